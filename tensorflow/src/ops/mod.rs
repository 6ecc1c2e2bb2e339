use modelport_onnx::tensor::datum_type;

use crate::internal::*;
use crate::tensor::data_type;

pub mod array;
pub mod math;
pub mod nn;

pub fn register_all_ops(reg: &mut TfOpRegister) {
    array::register_all_ops(reg);
    math::register_all_ops(reg);
    nn::register_all_ops(reg);
    reg.insert("Cast", cast);
    reg.insert("Constant", constant);
    reg.insert("Identity", identity);
}

/// The `T` attribute most TensorFlow ops carry.
pub(crate) fn t(dt: DatumType) -> (&'static str, AttrValue) {
    ("T", data_type(dt).into())
}

fn cast(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let to: i64 = node.get_attr("to")?;
    let dt = datum_type(to as i32)?;
    let fact = ctx.fact(node, 0)?;
    if let Some(k) = &ctx.input(node, 0)?.konst {
        let cast = Arc::new(k.cast_to(dt));
        return ctx.output_const(node, 0, cast);
    }
    let input = ctx.wire(node, 0)?;
    if fact.datum_type == dt {
        return ctx.emit(node, "Identity", vec![input], vec![t(dt)], fact);
    }
    let attrs = vec![
        ("SrcT", data_type(fact.datum_type).into()),
        ("DstT", data_type(dt).into()),
        ("Truncate", false.into()),
    ];
    ctx.emit(node, "Cast", vec![input], attrs, ValueFact::new(dt, fact.shape))
}

fn constant(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let value = if let Some(t) = node.get_attr_opt::<Tensor>("value")? {
        t
    } else if let Some(f) = node.get_attr_opt::<f32>("value_float")? {
        Tensor::scalar(f)
    } else if let Some(i) = node.get_attr_opt::<i64>("value_int")? {
        Tensor::scalar(i)
    } else if let Some(fs) = node.get_attr_opt_tvec::<f32>("value_floats")? {
        Tensor::vector(&fs)
    } else if let Some(is) = node.get_attr_opt_tvec::<i64>("value_ints")? {
        Tensor::vector(&is)
    } else {
        return node.bail("expected one of value, value_float, value_int, value_floats or value_ints");
    };
    ctx.output_const(node, 0, Arc::new(value))
}

fn identity(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let value = ctx.input(node, 0)?.clone();
    match (value.node, value.konst) {
        (None, Some(k)) => ctx.output_const(node, 0, k),
        (Some(input), _) => ctx.emit(node, "Identity", vec![input], vec![t(value.fact.datum_type)], value.fact),
        (None, None) => node.bail("input has no producer"),
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use modelport_onnx::pb::{AttributeProto, NodeProto};

    use crate::internal::*;
    use crate::model::ConversionContext;
    pub use crate::model::TfValue;

    pub fn node(op: &str, inputs: &[&str], attribute: Vec<AttributeProto>) -> NodeProto {
        NodeProto {
            name: format!("/test/{op}"),
            op_type: op.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![format!("/test/{op}_output_0")],
            attribute,
            ..NodeProto::default()
        }
    }

    pub fn context() -> ConversionContext {
        ConversionContext::new(14, log::Level::Debug)
    }

    pub fn placeholder(ctx: &mut ConversionContext, name: &str, dt: DatumType, shape: &[Dim]) {
        let node = ctx.unique_name(name);
        ctx.bind(name, TfValue { node: Some(node), fact: ValueFact::new(dt, shape.into()), konst: None });
    }

    pub fn batch(rest: &[usize]) -> TVec<Dim> {
        let mut shape = tvec!(Dim::sym("batch_size"));
        shape.extend(rest.iter().map(|&d| Dim::known(d)));
        shape
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use modelport_onnx::pb::AttributeProto;

    fn register() -> TfOpRegister {
        let mut reg = TfOpRegister::default();
        register_all_ops(&mut reg);
        reg
    }

    #[test]
    fn constants_only_materialize_when_consumed() {
        let reg = register();
        let mut ctx = context();
        let c = node("Constant", &[], vec![AttributeProto::float("value_float", 2.0)]);
        reg.get("Constant").unwrap()(&mut ctx, &c).unwrap();
        let out = &c.output[0];
        assert!(ctx.value(out).unwrap().node.is_none());

        let id = node("Identity", &[out], vec![]);
        reg.get("Identity").unwrap()(&mut ctx, &id).unwrap();
        assert!(ctx.value(&id.output[0]).unwrap().konst.is_some());
        assert!(ctx.into_nodes().is_empty());
    }

    #[test]
    fn cast_to_same_type_is_identity() {
        let reg = register();
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[4]));
        let c = node("Cast", &["x"], vec![AttributeProto::int("to", 1)]);
        reg.get("Cast").unwrap()(&mut ctx, &c).unwrap();
        let c = node("Cast", &["x"], vec![AttributeProto::int("to", 7)]);
        reg.get("Cast").unwrap()(&mut ctx, &c).unwrap();
        assert_eq!(ctx.value(&c.output[0]).unwrap().fact.datum_type, DatumType::I64);
        let nodes = ctx.into_nodes();
        assert_eq!(nodes[0].op, "Identity");
        assert_eq!(nodes[1].op, "Cast");
        assert_eq!(nodes[1].get_attr_datum_type("DstT").unwrap(), DatumType::I64);
    }
}
