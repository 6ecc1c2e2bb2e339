use std::f32::consts::{FRAC_1_SQRT_2, FRAC_2_PI};

use modelport_core::eval::resolve_axis;

use crate::internal::*;
use crate::ops::t;
use crate::shape::broadcast;
use crate::tensor::data_type;

pub fn register_all_ops(reg: &mut TfOpRegister) {
    reg.insert("Gelu", gelu);
    reg.insert("LayerNormalization", layer_norm);
    reg.insert("ReduceMean", reduce_mean);
    reg.insert("Softmax", softmax);
}

/// A `Mean` node over `axes`, returning its name and fact.
fn mean(
    ctx: &mut ConversionContext,
    name: &str,
    input: String,
    fact: &ValueFact,
    axes: &[usize],
    keep_dims: bool,
) -> PortResult<(String, ValueFact)> {
    let shape = (0..fact.rank())
        .filter_map(|ix| match (axes.contains(&ix), keep_dims) {
            (false, _) => Some(fact.shape[ix].clone()),
            (true, true) => Some(Dim::known(1)),
            (true, false) => None,
        })
        .collect();
    let indices: Vec<i64> = axes.iter().map(|&a| a as i64).collect();
    let indices = ctx.konst(&format!("{name}/reduction_indices"), &Tensor::vector(&indices))?;
    let attrs = vec![t(fact.datum_type), ("Tidx", data_type(DatumType::I64).into()), ("keep_dims", keep_dims.into())];
    let mean = ctx.add_node(name, "Mean", vec![input, indices], attrs);
    Ok((mean, fact.with_shape(shape)))
}

fn reduce_mean(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let fact = ctx.fact(node, 0)?;
    let axes: Option<TVec<i64>> = if ctx.opset >= 18 {
        if ctx.has_input(node, 1) { Some(ctx.const_input(node, 1)?.as_slice::<i64>()?.into()) } else { None }
    } else {
        node.get_attr_opt_tvec::<i64>("axes")?
    };
    let keep_dims = node.get_attr_opt::<bool>("keepdims")?.unwrap_or(true);
    let noop_with_empty_axes = node.get_attr_opt::<bool>("noop_with_empty_axes")?.unwrap_or(false);
    let mut axes: TVec<usize> = match axes {
        Some(axes) if !axes.is_empty() => {
            axes.iter().map(|&a| resolve_axis(a, fact.rank())).collect::<PortResult<_>>()?
        }
        _ if noop_with_empty_axes => {
            let input = ctx.wire(node, 0)?;
            return ctx.emit(node, "Identity", vec![input], vec![t(fact.datum_type)], fact);
        }
        _ => (0..fact.rank()).collect(),
    };
    axes.sort();
    axes.dedup();
    let input = ctx.wire(node, 0)?;
    let (name, fact) = mean(ctx, &node.name, input, &fact, &axes, keep_dims)?;
    ctx.output(node, 0, name, fact)
}

/// TensorFlow's `Softmax` works on the last axis only.
fn softmax(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let fact = ctx.fact(node, 0)?;
    let axis = resolve_axis(node.get_attr_opt::<i64>("axis")?.unwrap_or(-1), fact.rank())?;
    if axis + 1 != fact.rank() {
        return node.bail_attr(
            "axis",
            &format!("softmax over axis {axis} of a rank {} input has no TensorFlow mapping", fact.rank()),
        );
    }
    let input = ctx.wire(node, 0)?;
    ctx.emit(node, "Softmax", vec![input], vec![t(fact.datum_type)], fact)
}

/// Normalizes over the trailing axes from `axis` on:
/// `(x - mean) * rsqrt(var + eps) * scale + bias`.
fn layer_norm(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let x = ctx.fact(node, 0)?;
    node.expect(x.datum_type == DatumType::F32, "a float input")?;
    let rank = x.rank();
    let axis = resolve_axis(node.get_attr_opt::<i64>("axis")?.unwrap_or(-1), rank)?;
    let epsilon = node.get_attr_opt::<f32>("epsilon")?.unwrap_or(1e-5);
    let axes: TVec<usize> = (axis..rank).collect();
    let mut shape = broadcast(&x.shape, &ctx.fact(node, 1)?.shape)?;
    if ctx.has_input(node, 2) {
        shape = broadcast(&shape, &ctx.fact(node, 2)?.shape)?;
    }
    let base = node.name.clone();
    let dt = x.datum_type;

    let input = ctx.wire(node, 0)?;
    let (mean_name, mean_fact) = mean(ctx, &format!("{base}/mean"), input.clone(), &x, &axes, true)?;
    let centered = ctx.add_node(&format!("{base}/centered"), "Sub", vec![input, mean_name.clone()], vec![t(dt)]);
    let squared =
        ctx.add_node(&format!("{base}/squared"), "Mul", vec![centered.clone(), centered.clone()], vec![t(dt)]);
    let (var, _) = mean(ctx, &format!("{base}/variance"), squared, &x, &axes, true)?;
    let eps = ctx.scalar(&format!("{base}/epsilon"), epsilon)?;
    let var = ctx.add_node(&format!("{base}/variance_eps"), "AddV2", vec![var, eps], vec![t(dt)]);
    let rstd = ctx.add_node(&format!("{base}/rstd"), "Rsqrt", vec![var], vec![t(dt)]);
    let normalized = ctx.add_node(&format!("{base}/normalized"), "Mul", vec![centered, rstd.clone()], vec![t(dt)]);
    let scale = ctx.wire(node, 1)?;
    let output = if ctx.has_input(node, 2) {
        let scaled = ctx.add_node(&format!("{base}/scaled"), "Mul", vec![normalized, scale], vec![t(dt)]);
        let bias = ctx.wire(node, 2)?;
        ctx.add_node(&base, "AddV2", vec![scaled, bias], vec![t(dt)])
    } else {
        ctx.add_node(&base, "Mul", vec![normalized, scale], vec![t(dt)])
    };

    ctx.output(node, 0, output, x.with_shape(shape))?;
    if node.output.len() > 1 {
        ctx.output(node, 1, mean_name, mean_fact.clone())?;
    }
    if node.output.len() > 2 {
        ctx.output(node, 2, rstd, mean_fact)?;
    }
    Ok(())
}

fn gelu(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let fact = ctx.fact(node, 0)?;
    node.expect(fact.datum_type == DatumType::F32, "a float input")?;
    let approximate = node.get_attr_opt::<String>("approximate")?.unwrap_or_else(|| "none".to_string());
    let base = node.name.clone();
    let x = ctx.wire(node, 0)?;
    let dt = fact.datum_type;
    let mul = |ctx: &mut ConversionContext, name: &str, a: String, b: String| {
        ctx.add_node(&format!("{base}/{name}"), "Mul", vec![a, b], vec![t(dt)])
    };

    let shifted = match approximate.as_str() {
        "none" => {
            let k = ctx.scalar(&format!("{base}/frac_1_sqrt_2"), FRAC_1_SQRT_2)?;
            let scaled = mul(ctx, "scaled", x.clone(), k);
            let erf = ctx.add_node(&format!("{base}/erf"), "Erf", vec![scaled], vec![t(dt)]);
            let one = ctx.scalar(&format!("{base}/one"), 1.0)?;
            ctx.add_node(&format!("{base}/shifted"), "AddV2", vec![erf, one], vec![t(dt)])
        }
        "tanh" => {
            let square = mul(ctx, "square", x.clone(), x.clone());
            let cube = mul(ctx, "cube", square, x.clone());
            let c = ctx.scalar(&format!("{base}/coef"), 0.044715)?;
            let cube = mul(ctx, "scaled_cube", cube, c);
            let inner = ctx.add_node(&format!("{base}/inner"), "AddV2", vec![x.clone(), cube], vec![t(dt)]);
            let k = ctx.scalar(&format!("{base}/sqrt_2_over_pi"), FRAC_2_PI.sqrt())?;
            let inner = mul(ctx, "scaled_inner", inner, k);
            let tanh = ctx.add_node(&format!("{base}/tanh"), "Tanh", vec![inner], vec![t(dt)]);
            let one = ctx.scalar(&format!("{base}/one"), 1.0)?;
            ctx.add_node(&format!("{base}/shifted"), "AddV2", vec![tanh, one], vec![t(dt)])
        }
        other => return node.bail_attr("approximate", &format!("unknown approximation {other:?}")),
    };
    let half = ctx.scalar(&format!("{base}/half"), 0.5)?;
    let half_x = mul(ctx, "half_x", x, half);
    let output = ctx.add_node(&base, "Mul", vec![half_x, shifted], vec![t(dt)]);
    ctx.output(node, 0, output, fact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_utils::*;
    use modelport_onnx::pb::AttributeProto;

    fn ops(ctx: ConversionContext) -> Vec<String> {
        ctx.into_nodes().into_iter().map(|n| n.op).collect()
    }

    #[test]
    fn softmax_on_last_axis_only() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[4, 128, 128]));
        softmax(&mut ctx, &node("Softmax", &["x"], vec![AttributeProto::int("axis", 3)])).unwrap();
        let err = softmax(&mut ctx, &node("Softmax", &["x"], vec![AttributeProto::int("axis", 1)])).unwrap_err();
        assert!(err.to_string().contains("Softmax"), "{err}");
    }

    #[test]
    fn reduce_mean_axes_from_attribute_or_input() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[128, 32]));
        let n = node(
            "ReduceMean",
            &["x"],
            vec![AttributeProto::ints("axes", [-1]), AttributeProto::int("keepdims", 0)],
        );
        reduce_mean(&mut ctx, &n).unwrap();
        assert_eq!(ctx.value(&n.output[0]).unwrap().fact.shape, batch(&[128]));

        let mut ctx = ConversionContext::new(18, log::Level::Debug);
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[128, 32]));
        let axes = Arc::new(Tensor::vector(&[1i64]));
        ctx.bind("axes", TfValue { node: None, fact: ValueFact::of_tensor(&axes), konst: Some(axes) });
        let n = node("ReduceMean", &["x", "axes"], vec![]);
        reduce_mean(&mut ctx, &n).unwrap();
        assert_eq!(ctx.value(&n.output[0]).unwrap().fact.shape, batch(&[1, 32]));
        assert_eq!(ops(ctx), vec!["Const", "Mean"]);
    }

    #[test]
    fn layer_norm_decomposition() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[128, 32]));
        placeholder(&mut ctx, "scale", DatumType::F32, &[Dim::known(32)]);
        placeholder(&mut ctx, "bias", DatumType::F32, &[Dim::known(32)]);
        let n = node("LayerNormalization", &["x", "scale", "bias"], vec![AttributeProto::float("epsilon", 1e-12)]);
        layer_norm(&mut ctx, &n).unwrap();
        assert_eq!(ctx.value(&n.output[0]).unwrap().node.as_deref(), Some("test/LayerNormalization"));
        assert_eq!(
            ops(ctx),
            vec!["Const", "Mean", "Sub", "Mul", "Const", "Mean", "Const", "AddV2", "Rsqrt", "Mul", "Mul", "AddV2"]
        );
    }

    #[test]
    fn layer_norm_statistics_outputs() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[128, 32]));
        placeholder(&mut ctx, "scale", DatumType::F32, &[Dim::known(32)]);
        let mut n = node("LayerNormalization", &["x", "scale"], vec![]);
        n.output.extend(["mean".to_string(), "inv_std_dev".to_string()]);
        layer_norm(&mut ctx, &n).unwrap();
        let mean = ctx.value("mean").unwrap();
        assert_eq!(mean.node.as_deref(), Some("test/LayerNormalization/mean"));
        assert_eq!(mean.fact.shape, batch(&[128, 1]));
        assert_eq!(ctx.value("inv_std_dev").unwrap().node.as_deref(), Some("test/LayerNormalization/rstd"));
    }

    #[test]
    fn gelu_flavours() {
        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[64]));
        gelu(&mut ctx, &node("Gelu", &["x"], vec![])).unwrap();
        let tanh = node("Gelu", &["x"], vec![AttributeProto::string("approximate", "tanh")]);
        gelu(&mut ctx, &tanh).unwrap();
        let ops = ops(ctx);
        assert_eq!(ops.iter().filter(|op| *op == "Erf").count(), 1);
        assert_eq!(ops.iter().filter(|op| *op == "Tanh").count(), 1);

        let mut ctx = context();
        placeholder(&mut ctx, "x", DatumType::F32, &batch(&[64]));
        let bad = node("Gelu", &["x"], vec![AttributeProto::string("approximate", "sigmoid")]);
        assert!(gelu(&mut ctx, &bad).is_err());
    }
}
