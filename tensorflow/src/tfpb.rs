use modelport_core::internal::*;

pub mod tensorflow {
    include!("prost/tensorflow.rs");
}

use self::tensorflow::attr_value::{ListValue, Value};
use self::tensorflow::{AttrValue, DataType, GraphDef, NodeDef, TensorProto, TensorShapeProto, VersionDef};

/// Producer version written in `GraphDef.versions`.
pub const GRAPH_DEF_VERSION: i32 = 1205;

pub fn graph() -> GraphDef {
    GraphDef {
        node: vec![],
        versions: Some(VersionDef { producer: GRAPH_DEF_VERSION, min_consumer: 0, bad_consumers: vec![] }),
        version: 0,
    }
}

pub fn node() -> NodeDef {
    NodeDef { name: String::new(), op: String::new(), input: vec![], device: String::new(), attr: HashMap::new() }
}

impl GraphDef {
    pub fn node(mut self, n: NodeDef) -> Self {
        self.node.push(n);
        self
    }

    pub fn write_to_bytes(&self) -> Vec<u8> {
        use prost::Message;
        self.encode_to_vec()
    }
}

impl NodeDef {
    pub fn name<S: ToString>(mut self, n: S) -> NodeDef {
        self.name = n.to_string();
        self
    }
    pub fn op<S: ToString>(mut self, n: S) -> NodeDef {
        self.op = n.to_string();
        self
    }
    pub fn input<S: ToString>(mut self, n: S) -> NodeDef {
        self.input.push(n.to_string());
        self
    }
    pub fn attr<S: ToString, V: Into<AttrValue>>(mut self, n: S, v: V) -> NodeDef {
        self.attr.insert(n.to_string(), v.into());
        self
    }
}

impl NodeDef {
    fn get_attr_value(&self, name: &str) -> Option<&Value> {
        self.attr.get(name).and_then(|a| a.value.as_ref())
    }

    fn missing<T>(&self, kind: &str, name: &str) -> PortResult<T> {
        bail!("Node {} ({}) expected {} attribute '{}'", self.name, self.op, kind, name)
    }

    pub fn get_attr_opt_bool(&self, name: &str) -> PortResult<Option<bool>> {
        Ok(match self.get_attr_value(name) {
            Some(Value::B(v)) => Some(*v),
            _ => None,
        })
    }

    pub fn get_attr_bool(&self, name: &str) -> PortResult<bool> {
        self.get_attr_opt_bool(name)?.map(Ok).unwrap_or_else(|| self.missing("bool", name))
    }

    pub fn get_attr_opt_datum_type(&self, name: &str) -> PortResult<Option<DatumType>> {
        match self.get_attr_value(name) {
            Some(Value::Type(v)) => {
                let dt = DataType::from_i32(*v).with_context(|| format!("Invalid DataType {v}"))?;
                Ok(Some(dt.try_into()?))
            }
            _ => Ok(None),
        }
    }

    pub fn get_attr_datum_type(&self, name: &str) -> PortResult<DatumType> {
        self.get_attr_opt_datum_type(name)?.map(Ok).unwrap_or_else(|| self.missing("datum_type", name))
    }

    /// Unknown dimensions are `-1`.
    pub fn get_attr_opt_shape(&self, name: &str) -> PortResult<Option<TVec<i64>>> {
        Ok(match self.get_attr_value(name) {
            Some(Value::Shape(shape)) => Some(shape.dim.iter().map(|d| d.size).collect()),
            _ => None,
        })
    }

    pub fn get_attr_shape(&self, name: &str) -> PortResult<TVec<i64>> {
        self.get_attr_opt_shape(name)?.map(Ok).unwrap_or_else(|| self.missing("shape", name))
    }

    pub fn get_attr_opt_tensor(&self, name: &str) -> PortResult<Option<Tensor>> {
        match self.get_attr_value(name) {
            Some(Value::Tensor(t)) => Ok(Some(
                Tensor::try_from(t).with_context(|| format!("Reading attribute '{name}' of {}", self.name))?,
            )),
            _ => Ok(None),
        }
    }

    pub fn get_attr_tensor(&self, name: &str) -> PortResult<Tensor> {
        self.get_attr_opt_tensor(name)?.map(Ok).unwrap_or_else(|| self.missing("tensor", name))
    }

    pub fn get_attr_opt_int(&self, name: &str) -> PortResult<Option<i64>> {
        Ok(match self.get_attr_value(name) {
            Some(Value::I(i)) => Some(*i),
            _ => None,
        })
    }

    pub fn get_attr_int(&self, name: &str) -> PortResult<i64> {
        self.get_attr_opt_int(name)?.map(Ok).unwrap_or_else(|| self.missing("int", name))
    }

    pub fn get_attr_opt_list_int(&self, name: &str) -> PortResult<Option<Vec<i64>>> {
        Ok(match self.get_attr_value(name) {
            Some(Value::List(list)) => Some(list.i.clone()),
            _ => None,
        })
    }

    pub fn get_attr_list_int(&self, name: &str) -> PortResult<Vec<i64>> {
        self.get_attr_opt_list_int(name)?.map(Ok).unwrap_or_else(|| self.missing("list<int>", name))
    }
}

impl From<DataType> for AttrValue {
    fn from(t: DataType) -> AttrValue {
        AttrValue { value: Some(Value::Type(t.into())) }
    }
}

impl<'a> From<&'a str> for AttrValue {
    fn from(t: &'a str) -> AttrValue {
        AttrValue { value: Some(Value::S(t.as_bytes().to_vec())) }
    }
}

impl From<i64> for AttrValue {
    fn from(t: i64) -> AttrValue {
        AttrValue { value: Some(Value::I(t)) }
    }
}

impl From<f32> for AttrValue {
    fn from(t: f32) -> AttrValue {
        AttrValue { value: Some(Value::F(t)) }
    }
}

impl From<bool> for AttrValue {
    fn from(t: bool) -> AttrValue {
        AttrValue { value: Some(Value::B(t)) }
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(t: Vec<i64>) -> AttrValue {
        AttrValue { value: Some(Value::List(ListValue { i: t, ..ListValue::default() })) }
    }
}

impl From<TensorProto> for AttrValue {
    fn from(t: TensorProto) -> AttrValue {
        AttrValue { value: Some(Value::Tensor(t)) }
    }
}

impl From<TensorShapeProto> for AttrValue {
    fn from(t: TensorShapeProto) -> AttrValue {
        AttrValue { value: Some(Value::Shape(t)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::shape_proto;

    #[test]
    fn attributes_round_trip_through_bytes() {
        use prost::Message;
        let graph = graph().node(
            node()
                .name("x")
                .op("Placeholder")
                .attr("dtype", DataType::DtInt64)
                .attr("shape", shape_proto(&[-1, 128]))
                .attr("keep_dims", true)
                .attr("axes", vec![0i64, 2]),
        );
        let bytes = graph.write_to_bytes();
        let back = GraphDef::decode(&*bytes).unwrap();
        let n = &back.node[0];
        assert_eq!(n.get_attr_datum_type("dtype").unwrap(), DatumType::I64);
        assert_eq!(n.get_attr_shape("shape").unwrap().as_slice(), &[-1, 128]);
        assert!(n.get_attr_bool("keep_dims").unwrap());
        assert_eq!(n.get_attr_list_int("axes").unwrap(), vec![0, 2]);
        assert!(n.get_attr_int("keep_dims").is_err());
        assert!(n.get_attr_opt_tensor("value").unwrap().is_none());
    }
}
