use modelport_core::eval::resolve_axis;

use crate::internal::*;
use crate::ops::t;
use crate::shape::{reshape as reshape_shape, tf_reshape_target};
use crate::tensor::data_type;

pub fn register_all_ops(reg: &mut TfOpRegister) {
    reg.insert("Gather", gather);
    reg.insert("Reshape", reshape);
    reg.insert("Transpose", transpose);
}

fn gather(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let (data, indices) = (ctx.fact(node, 0)?, ctx.fact(node, 1)?);
    let axis = resolve_axis(node.get_attr_opt::<i64>("axis")?.unwrap_or(0), data.rank())?;
    node.expect(indices.datum_type == DatumType::I64, "int64 indices")?;
    let mut shape: TVec<Dim> = data.shape[..axis].into();
    shape.extend(indices.shape.iter().cloned());
    shape.extend(data.shape[axis + 1..].iter().cloned());

    let inputs = vec![
        ctx.wire(node, 0)?,
        ctx.wire(node, 1)?,
        ctx.konst(&format!("{}/axis", node.name), &Tensor::scalar(axis as i64))?,
    ];
    let attrs = vec![
        ("Tparams", data_type(data.datum_type).into()),
        ("Tindices", data_type(indices.datum_type).into()),
        ("Taxis", data_type(DatumType::I64).into()),
        ("batch_dims", 0i64.into()),
    ];
    ctx.emit(node, "GatherV2", inputs, attrs, data.with_shape(shape))
}

/// The ONNX target may copy dimensions (`0`); TensorFlow's may not, so the
/// target is recomputed from the inferred output shape.
fn reshape(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let fact = ctx.fact(node, 0)?;
    let target = ctx.const_input(node, 1)?;
    let target: TVec<i64> = target.as_slice::<i64>()?.into();
    if node.get_attr_opt::<i64>("allowzero")?.unwrap_or(0) != 0 && target.contains(&0) {
        return node.bail_attr("allowzero", "zero-sized reshape targets are not supported");
    }
    let shape = reshape_shape(&fact.shape, &target)?;
    let tf_target = tf_reshape_target(&shape)?;
    trace!("{}: {:?} -> {:?}", node.name, target, tf_target);
    let inputs =
        vec![ctx.wire(node, 0)?, ctx.konst(&format!("{}/shape", node.name), &Tensor::vector(&tf_target))?];
    let attrs = vec![t(fact.datum_type), ("Tshape", data_type(DatumType::I64).into())];
    ctx.emit(node, "Reshape", inputs, attrs, fact.with_shape(shape))
}

fn transpose(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let fact = ctx.fact(node, 0)?;
    let rank = fact.rank();
    let perm: TVec<usize> = node.get_attr_opt_tvec::<usize>("perm")?.unwrap_or_else(|| (0..rank).rev().collect());
    let mut sorted = perm.clone();
    sorted.sort();
    node.expect_attr("perm", sorted.iter().copied().eq(0..rank), || {
        format!("a permutation of the {rank} input axes, got {perm:?}")
    })?;
    let shape = perm.iter().map(|&p| fact.shape[p].clone()).collect();
    let perm: Vec<i64> = perm.iter().map(|&p| p as i64).collect();
    let inputs = vec![ctx.wire(node, 0)?, ctx.konst(&format!("{}/perm", node.name), &Tensor::vector(&perm))?];
    let attrs = vec![t(fact.datum_type), ("Tperm", data_type(DatumType::I64).into())];
    ctx.emit(node, "Transpose", inputs, attrs, fact.with_shape(shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_utils::*;
    use modelport_onnx::pb::AttributeProto;

    fn shape_const(ctx: &mut ConversionContext, name: &str, shape: &[i64]) {
        let k = Arc::new(Tensor::vector(shape));
        ctx.bind(name, TfValue { node: None, fact: ValueFact::of_tensor(&k), konst: Some(k) });
    }

    #[test]
    fn reshape_targets_keep_a_single_unknown() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[128, 32]));
        shape_const(&mut ctx, "split", &[0, 0, 4, 8]);
        let n = node("Reshape", &["x", "split"], vec![]);
        reshape(&mut ctx, &n).unwrap();
        assert_eq!(ctx.value(&n.output[0]).unwrap().fact.shape, batch(&[128, 4, 8]));

        let nodes = ctx.into_nodes();
        assert_eq!(nodes[0].name, "test/Reshape/shape");
        let target = nodes[0].get_attr_tensor("value").unwrap();
        assert_eq!(target.as_slice::<i64>().unwrap(), &[-1, 128, 4, 8]);
        assert_eq!(nodes[1].input, vec!["x".to_string(), "test/Reshape/shape".to_string()]);
        // the ONNX target itself is never emitted
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn reshape_needs_a_constant_target() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[4]));
        placeholder(&mut ctx, "s", DatumType::I64, &[Dim::known(1)]);
        let err = reshape(&mut ctx, &node("Reshape", &["x", "s"], vec![])).unwrap_err();
        assert!(err.to_string().contains("constant"), "{err}");
    }

    #[test]
    fn gather_embeddings() {
        let mut ctx = context();
        placeholder(&mut ctx, "table", DatumType::F32, &[Dim::known(100), Dim::known(32)]);
        placeholder(&mut ctx, "ids", DatumType::I64, &batch(&[128]));
        let n = node("Gather", &["table", "ids"], vec![AttributeProto::int("axis", 0)]);
        gather(&mut ctx, &n).unwrap();
        assert_eq!(ctx.value(&n.output[0]).unwrap().fact.shape, batch(&[128, 32]));
        let nodes = ctx.into_nodes();
        assert_eq!(nodes.last().unwrap().op, "GatherV2");
        assert_eq!(nodes.last().unwrap().input.len(), 3);
    }

    #[test]
    fn transpose_permutes_facts() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[128, 4, 8]));
        let n = node("Transpose", &["x"], vec![AttributeProto::ints("perm", [0, 2, 1, 3])]);
        transpose(&mut ctx, &n).unwrap();
        assert_eq!(ctx.value(&n.output[0]).unwrap().fact.shape, batch(&[4, 128, 8]));

        let bad = node("Transpose", &["x"], vec![AttributeProto::ints("perm", [0, 0, 1, 3])]);
        assert!(transpose(&mut ctx, &bad).is_err());
    }
}
