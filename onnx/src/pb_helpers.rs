use crate::pb::attribute_proto::AttributeType;
use crate::pb::*;
use modelport_core::internal::*;

use std::borrow::Cow;
use std::fmt::{self, Display};
use std::str;

pub trait Reason {
    fn reason(&self) -> Cow<'_, str>;
}

impl Reason for &str {
    fn reason(&self) -> Cow<'_, str> {
        (*self).into()
    }
}

impl<F> Reason for F
where
    F: Fn() -> String,
{
    fn reason(&self) -> Cow<'_, str> {
        self().into()
    }
}

pub trait OptionExt {
    type Item;

    fn and_try<F, T>(self, f: F) -> PortResult<Option<T>>
    where
        F: Fn(Self::Item) -> PortResult<T>;

    fn and_ok<F, T>(self, f: F) -> PortResult<Option<T>>
    where
        F: Fn(Self::Item) -> T;
}

impl<A> OptionExt for Option<A> {
    type Item = A;

    fn and_try<F, T>(self, f: F) -> PortResult<Option<T>>
    where
        F: Fn(Self::Item) -> PortResult<T>,
    {
        match self {
            Some(attr) => f(attr).map(Some),
            None => Ok(None),
        }
    }

    fn and_ok<F, T>(self, f: F) -> PortResult<Option<T>>
    where
        F: Fn(Self::Item) -> T,
    {
        Ok(self.map(f))
    }
}

impl Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            AttributeType::Int => "int",
            AttributeType::Float => "float",
            AttributeType::Tensor => "tensor",
            AttributeType::String => "string",
            AttributeType::Ints => "list of ints",
            AttributeType::Floats => "list of floats",
            AttributeType::Tensors => "list of tensors",
            AttributeType::Strings => "list of strings",
            AttributeType::Graph => "graph",
            AttributeType::Graphs => "graphs",
            _ => "<undefined>",
        })
    }
}

pub trait AttrScalarType<'a>: 'a + Sized {
    fn get_attr_opt_scalar(node: &'a NodeProto, name: &str) -> PortResult<Option<Self>>;
}

impl<'a> AttrScalarType<'a> for Tensor {
    fn get_attr_opt_scalar(node: &'a NodeProto, name: &str) -> PortResult<Option<Self>> {
        node.get_attr_opt_with_type(name, AttributeType::Tensor)?.and_try(|attr| {
            let t = attr.t.as_ref().with_context(|| format!("attribute {name} holds no tensor"))?;
            Tensor::try_from(t)
        })
    }
}

impl<'a> AttrScalarType<'a> for &'a str {
    fn get_attr_opt_scalar(node: &'a NodeProto, name: &str) -> PortResult<Option<Self>> {
        node.get_attr_opt_with_type(name, AttributeType::String)?
            .and_try(|attr| str::from_utf8(&attr.s).map_err(Into::into))
    }
}

impl<'a> AttrScalarType<'a> for String {
    fn get_attr_opt_scalar(node: &'a NodeProto, name: &str) -> PortResult<Option<Self>> {
        let string: Option<&'a str> = AttrScalarType::get_attr_opt_scalar(node, name)?;
        string.and_ok(Into::into)
    }
}

impl<'a> AttrScalarType<'a> for i64 {
    fn get_attr_opt_scalar(node: &'a NodeProto, name: &str) -> PortResult<Option<Self>> {
        node.get_attr_opt_with_type(name, AttributeType::Int)?.and_ok(|attr| attr.i)
    }
}

impl<'a> AttrScalarType<'a> for bool {
    fn get_attr_opt_scalar(node: &'a NodeProto, name: &str) -> PortResult<Option<Self>> {
        let int: Option<i64> = AttrScalarType::get_attr_opt_scalar(node, name)?;
        int.and_try(|int| {
            node.expect_attr(name, int == 0 || int == 1, "boolean (0 or 1)")?;
            Ok(int == 1)
        })
    }
}

impl<'a> AttrScalarType<'a> for f32 {
    fn get_attr_opt_scalar(node: &'a NodeProto, name: &str) -> PortResult<Option<Self>> {
        node.get_attr_opt_with_type(name, AttributeType::Float)?.and_ok(|attr| attr.f)
    }
}

pub trait AttrTVecType<'a>: 'a + Sized {
    fn get_attr_opt_tvec(node: &'a NodeProto, name: &str) -> PortResult<Option<TVec<Self>>>;
}

impl<'a> AttrTVecType<'a> for i64 {
    fn get_attr_opt_tvec(node: &'a NodeProto, name: &str) -> PortResult<Option<TVec<Self>>> {
        node.get_attr_opt_with_type(name, AttributeType::Ints)?.and_ok(|attr| attr.ints.iter().copied().collect())
    }
}

impl<'a> AttrTVecType<'a> for usize {
    fn get_attr_opt_tvec(node: &'a NodeProto, name: &str) -> PortResult<Option<TVec<Self>>> {
        let ints: Option<TVec<i64>> = AttrTVecType::get_attr_opt_tvec(node, name)?;
        ints.and_try(|ints| {
            for int in ints.iter() {
                node.expect_attr(name, *int >= 0, "list of non-negative ints")?;
            }
            Ok(ints.iter().map(|&x| x as usize).collect())
        })
    }
}

impl<'a> AttrTVecType<'a> for f32 {
    fn get_attr_opt_tvec(node: &'a NodeProto, name: &str) -> PortResult<Option<TVec<Self>>> {
        node.get_attr_opt_with_type(name, AttributeType::Floats)?
            .and_ok(|attr| attr.floats.iter().copied().collect())
    }
}

impl NodeProto {
    pub fn bail<T>(&self, msg: &str) -> PortResult<T> {
        bail!("Node {} ({}): {}", self.name, self.op_type, msg)
    }

    pub fn bail_attr<T>(&self, attr: &str, msg: &str) -> PortResult<T> {
        bail!("Node {} ({}), attribute '{}': {}", self.name, self.op_type, attr, msg)
    }

    pub fn expect<R: Reason>(&self, cond: bool, what: R) -> PortResult<()> {
        if !cond { self.bail(&format!("expected {}", what.reason())) } else { Ok(()) }
    }

    pub fn expect_attr<R: Reason>(&self, attr: &str, cond: bool, what: R) -> PortResult<()> {
        if !cond { self.bail_attr(attr, &format!("expected {}", what.reason())) } else { Ok(()) }
    }

    pub fn expect_ok_or_else<T, R: Reason>(&self, result: Option<T>, what: R) -> PortResult<T> {
        match result {
            Some(v) => Ok(v),
            None => self.bail(&format!("expected {}", what.reason())),
        }
    }

    fn get_attr_opt_with_type(&self, name: &str, ty: AttributeType) -> PortResult<Option<&AttributeProto>> {
        let attr = match self.attribute.iter().find(|a| a.name == name) {
            Some(attr) => attr,
            _ => return Ok(None),
        };
        let found = AttributeType::from_i32(attr.r#type).unwrap_or(AttributeType::Undefined);
        self.expect_attr(name, found == ty, || format!("{ty}, got {found}"))?;
        Ok(Some(attr))
    }

    pub fn get_attr_opt<'a, T>(&'a self, name: &str) -> PortResult<Option<T>>
    where
        T: AttrScalarType<'a>,
    {
        T::get_attr_opt_scalar(self, name)
    }

    pub fn get_attr<'a, T>(&'a self, name: &str) -> PortResult<T>
    where
        T: AttrScalarType<'a>,
    {
        self.expect_ok_or_else(self.get_attr_opt(name)?, || format!("attribute '{name}'"))
    }

    pub fn get_attr_opt_tvec<'a, T>(&'a self, name: &str) -> PortResult<Option<TVec<T>>>
    where
        T: AttrTVecType<'a>,
    {
        T::get_attr_opt_tvec(self, name)
    }

    pub fn get_attr_tvec<'a, T>(&'a self, name: &str) -> PortResult<TVec<T>>
    where
        T: AttrTVecType<'a>,
    {
        self.expect_ok_or_else(self.get_attr_opt_tvec(name)?, || format!("attribute '{name}'"))
    }
}

impl AttributeProto {
    fn typed(name: &str, ty: AttributeType) -> AttributeProto {
        AttributeProto { name: name.to_string(), r#type: ty as i32, ..AttributeProto::default() }
    }

    pub fn int(name: &str, i: i64) -> AttributeProto {
        AttributeProto { i, ..AttributeProto::typed(name, AttributeType::Int) }
    }

    pub fn float(name: &str, f: f32) -> AttributeProto {
        AttributeProto { f, ..AttributeProto::typed(name, AttributeType::Float) }
    }

    pub fn ints(name: &str, ints: impl IntoIterator<Item = i64>) -> AttributeProto {
        AttributeProto { ints: ints.into_iter().collect(), ..AttributeProto::typed(name, AttributeType::Ints) }
    }

    pub fn string(name: &str, s: &str) -> AttributeProto {
        AttributeProto { s: s.as_bytes().to_vec(), ..AttributeProto::typed(name, AttributeType::String) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(attribute: Vec<AttributeProto>) -> NodeProto {
        NodeProto { name: "/n".into(), op_type: "Transpose".into(), attribute, ..NodeProto::default() }
    }

    #[test]
    fn typed_getters() {
        let n = node(vec![
            AttributeProto::ints("perm", [0, 2, 1, 3]),
            AttributeProto::int("keepdims", 1),
            AttributeProto::float("epsilon", 1e-5),
            AttributeProto::string("approximate", "tanh"),
        ]);
        assert_eq!(n.get_attr_tvec::<usize>("perm").unwrap().as_slice(), &[0, 2, 1, 3]);
        assert!(n.get_attr::<bool>("keepdims").unwrap());
        assert_eq!(n.get_attr::<f32>("epsilon").unwrap(), 1e-5);
        assert_eq!(n.get_attr::<&str>("approximate").unwrap(), "tanh");
        assert_eq!(n.get_attr_opt::<i64>("axis").unwrap(), None);
    }

    #[test]
    fn wrong_type_names_the_attribute() {
        let n = node(vec![AttributeProto::int("perm", 1)]);
        let err = n.get_attr_tvec::<i64>("perm").unwrap_err();
        assert!(err.to_string().contains("attribute 'perm'"), "{err}");
        assert!(err.to_string().contains("list of ints, got int"), "{err}");
    }

    #[test]
    fn missing_attribute() {
        let n = node(vec![]);
        assert!(n.get_attr::<i64>("axis").is_err());
    }
}
