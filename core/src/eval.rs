//! Reference evaluation of every `Op` on concrete tensors.
use ndarray::{Array3, ArrayD, Axis, Ix2, IxDyn, Zip};

use crate::broadcast::multi_broadcast;
use crate::internal::*;

/// Evaluates a graph eagerly: values are the tensors themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct Eager;

impl Graph for Eager {
    type Value = Arc<Tensor>;

    fn parameter(&mut self, _name: &str, tensor: &Arc<Tensor>) -> PortResult<Arc<Tensor>> {
        Ok(tensor.clone())
    }

    fn constant(&mut self, tensor: Tensor) -> PortResult<Arc<Tensor>> {
        Ok(Arc::new(tensor))
    }

    fn apply(&mut self, op: Op, inputs: &[&Arc<Tensor>]) -> PortResult<Arc<Tensor>> {
        let inputs: TVec<&Tensor> = inputs.iter().map(|t| &***t).collect();
        Ok(Arc::new(eval(&op, &inputs)?))
    }

    fn shape_of<'v>(&self, value: &'v Arc<Tensor>) -> &'v [usize] {
        value.shape()
    }
}

pub fn eval(op: &Op, inputs: &[&Tensor]) -> PortResult<Tensor> {
    ensure!(
        inputs.len() == op.arity(),
        "{} expects {} inputs, got {}",
        op.name(),
        op.arity(),
        inputs.len()
    );
    let result = match op {
        Op::Add => binary_f32(inputs[0], inputs[1], |a, b| a + b),
        Op::Sub => binary_f32(inputs[0], inputs[1], |a, b| a - b),
        Op::Mul => binary_f32(inputs[0], inputs[1], |a, b| a * b),
        Op::Div => binary_f32(inputs[0], inputs[1], |a, b| a / b),
        Op::Pow => binary_f32(inputs[0], inputs[1], pow),
        Op::MatMul => matmul(inputs[0], inputs[1]),
        Op::Erf => unary_f32(inputs[0], libm::erff),
        Op::Tanh => unary_f32(inputs[0], f32::tanh),
        Op::Sqrt => unary_f32(inputs[0], f32::sqrt),
        Op::Relu => unary_f32(inputs[0], |x| x.max(0.0)),
        Op::Gather { axis } => gather(inputs[0], inputs[1], *axis),
        Op::Transpose { perm } => transpose(inputs[0], perm),
        Op::Reshape { shape } => reshape(inputs[0], shape),
        Op::ReduceMean { axes, keep_dims } => reduce_mean(inputs[0], axes, *keep_dims),
        Op::Softmax { axis } => softmax(inputs[0], *axis),
        Op::LayerNorm { axis, epsilon } => layer_norm(inputs[0], inputs[1], inputs[2], *axis, *epsilon),
        Op::Gelu { approximate: false } => {
            unary_f32(inputs[0], |x| 0.5 * x * (1.0 + libm::erff(x / std::f32::consts::SQRT_2)))
        }
        Op::Gelu { approximate: true } => {
            let k = std::f32::consts::FRAC_2_PI.sqrt();
            unary_f32(inputs[0], move |x| 0.5 * x * (1.0 + (k * (x + 0.044715 * x * x * x)).tanh()))
        }
    };
    result.with_context(|| format!("Evaluating {op} on {inputs:?}"))
}

fn pow(a: f32, b: f32) -> f32 {
    if b == 2.0 {
        a * a
    } else if b == 3.0 {
        a * a * a
    } else {
        a.powf(b)
    }
}

/// Normalizes a possibly negative axis against a rank.
pub fn resolve_axis(axis: i64, rank: usize) -> PortResult<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    ensure!(
        (0..rank as i64).contains(&resolved),
        "Axis {axis} out of range for rank {rank}"
    );
    Ok(resolved as usize)
}

fn unary_f32(a: &Tensor, f: impl Fn(f32) -> f32) -> PortResult<Tensor> {
    Ok(a.to_array_view::<f32>()?.mapv(f).into())
}

fn binary_f32(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> PortResult<Tensor> {
    let a = a.to_array_view::<f32>()?;
    let b = b.to_array_view::<f32>()?;
    let shape = multi_broadcast(&[a.shape(), b.shape()])?;
    let a = a.broadcast(IxDyn(&shape)).context("broadcasting left operand")?;
    let b = b.broadcast(IxDyn(&shape)).context("broadcasting right operand")?;
    let c: ArrayD<f32> = Zip::from(&a).and(&b).map_collect(|a, b| f(*a, *b));
    Ok(c.into())
}

/// numpy-style matmul on rank >= 2 operands, batch dims broadcast.
fn matmul(a: &Tensor, b: &Tensor) -> PortResult<Tensor> {
    let a = a.to_array_view::<f32>()?;
    let b = b.to_array_view::<f32>()?;
    ensure!(a.ndim() >= 2 && b.ndim() >= 2, "MatMul operands must have rank >= 2");
    let (m, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (k2, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    ensure!(k == k2, "MatMul inner dimensions mismatch: {:?} x {:?}", a.shape(), b.shape());
    let batch = multi_broadcast(&[&a.shape()[..a.ndim() - 2], &b.shape()[..b.ndim() - 2]])?;
    let batch_len: usize = batch.iter().product();

    let mut a_shape = batch.clone();
    a_shape.extend([m, k]);
    let mut b_shape = batch.clone();
    b_shape.extend([k, n]);
    let a = a
        .broadcast(IxDyn(&a_shape))
        .context("broadcasting left operand")?
        .to_owned()
        .into_shape_with_order((batch_len, m, k))?;
    let b = b
        .broadcast(IxDyn(&b_shape))
        .context("broadcasting right operand")?
        .to_owned()
        .into_shape_with_order((batch_len, k, n))?;

    let mut c = Array3::<f32>::zeros((batch_len, m, n));
    for i in 0..batch_len {
        let lhs = a.index_axis(Axis(0), i).into_dimensionality::<Ix2>()?;
        let rhs = b.index_axis(Axis(0), i).into_dimensionality::<Ix2>()?;
        c.index_axis_mut(Axis(0), i).assign(&lhs.dot(&rhs));
    }
    let mut c_shape = batch;
    c_shape.extend([m, n]);
    Ok(c.into_shape_with_order(IxDyn(&c_shape))?.into())
}

fn gather(data: &Tensor, indices: &Tensor, axis: i64) -> PortResult<Tensor> {
    let axis = resolve_axis(axis, data.rank())?;
    let dim = data.shape()[axis] as i64;
    let idx = indices
        .as_slice::<i64>()?
        .iter()
        .map(|&i| {
            let resolved = if i < 0 { i + dim } else { i };
            ensure!((0..dim).contains(&resolved), "Gather index {i} out of range 0..{dim}");
            Ok(resolved as usize)
        })
        .collect::<PortResult<Vec<usize>>>()?;
    let mut shape: TVec<usize> = data.shape()[..axis].into();
    shape.extend(indices.shape().iter().copied());
    shape.extend(data.shape()[axis + 1..].iter().copied());
    match data {
        Tensor::F32(a) => Ok(standard(a.select(Axis(axis), &idx)).into_shape_with_order(IxDyn(&shape))?.into()),
        Tensor::I64(a) => Ok(standard(a.select(Axis(axis), &idx)).into_shape_with_order(IxDyn(&shape))?.into()),
    }
}

fn standard<T: Clone>(a: ArrayD<T>) -> ArrayD<T> {
    if a.is_standard_layout() { a } else { a.as_standard_layout().into_owned() }
}

fn transpose(a: &Tensor, perm: &[usize]) -> PortResult<Tensor> {
    ensure!(
        perm.len() == a.rank() && (0..a.rank()).all(|i| perm.contains(&i)),
        "Invalid permutation {perm:?} for rank {}",
        a.rank()
    );
    match a {
        Tensor::F32(a) => Ok(a.view().permuted_axes(IxDyn(perm)).as_standard_layout().into_owned().into()),
        Tensor::I64(a) => Ok(a.view().permuted_axes(IxDyn(perm)).as_standard_layout().into_owned().into()),
    }
}

/// Resolves a reshape target with ONNX semantics: `0` copies the input dim,
/// one `-1` is inferred from the element count.
pub fn reshape_target(input: &[usize], shape: &[i64]) -> PortResult<TVec<usize>> {
    let len: usize = input.iter().product();
    let mut infer = None;
    let mut dims: TVec<usize> = tvec!();
    for (ix, &d) in shape.iter().enumerate() {
        match d {
            -1 => {
                ensure!(infer.is_none(), "Reshape target {shape:?} has more than one -1");
                infer = Some(ix);
                dims.push(1);
            }
            0 => dims.push(
                *input.get(ix).with_context(|| format!("Reshape target {shape:?} copies a missing dim"))?,
            ),
            d if d > 0 => dims.push(d as usize),
            _ => bail!("Invalid reshape target {shape:?}"),
        }
    }
    let known: usize = dims.iter().product();
    if let Some(ix) = infer {
        ensure!(known > 0 && len % known == 0, "Can not reshape {input:?} to {shape:?}");
        dims[ix] = len / known;
    }
    ensure!(dims.iter().product::<usize>() == len, "Can not reshape {input:?} to {shape:?}");
    Ok(dims)
}

fn reshape(a: &Tensor, shape: &[i64]) -> PortResult<Tensor> {
    let dims = reshape_target(a.shape(), shape)?;
    match a {
        Tensor::F32(a) => Ok(a.as_standard_layout().into_owned().into_shape_with_order(IxDyn(&dims))?.into()),
        Tensor::I64(a) => Ok(a.as_standard_layout().into_owned().into_shape_with_order(IxDyn(&dims))?.into()),
    }
}

fn reduce_mean(a: &Tensor, axes: &[i64], keep_dims: bool) -> PortResult<Tensor> {
    let mut array = a.to_array_view::<f32>()?.to_owned();
    let mut resolved = axes.iter().map(|&ax| resolve_axis(ax, a.rank())).collect::<PortResult<Vec<_>>>()?;
    resolved.sort_unstable();
    resolved.dedup();
    for &ax in resolved.iter().rev() {
        let mean = array.mean_axis(Axis(ax)).context("Mean over an empty axis")?;
        array = if keep_dims { mean.insert_axis(Axis(ax)) } else { mean };
    }
    Ok(array.into())
}

fn softmax(a: &Tensor, axis: i64) -> PortResult<Tensor> {
    let axis = resolve_axis(axis, a.rank())?;
    let mut array = a.to_array_view::<f32>()?.to_owned();
    for mut lane in array.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    Ok(array.into())
}

fn layer_norm(x: &Tensor, scale: &Tensor, bias: &Tensor, axis: i64, epsilon: f32) -> PortResult<Tensor> {
    let axis = resolve_axis(axis, x.rank())?;
    ensure!(axis + 1 == x.rank(), "LayerNorm only normalizes over the last axis");
    let dim = x.shape()[axis];
    let scale = scale.as_slice::<f32>()?;
    let bias = bias.as_slice::<f32>()?;
    ensure!(
        scale.len() == dim && bias.len() == dim,
        "LayerNorm scale and bias must have {dim} elements"
    );
    let mut array = x.to_array_view::<f32>()?.to_owned();
    for mut lane in array.lanes_mut(Axis(axis)) {
        let mean = lane.sum() / dim as f32;
        let var = lane.fold(0f32, |acc, &v| acc + (v - mean) * (v - mean)) / dim as f32;
        let inv = 1.0 / (var + epsilon).sqrt();
        for (i, v) in lane.iter_mut().enumerate() {
            *v = (*v - mean) * inv * scale[i] + bias[i];
        }
    }
    Ok(array.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn t2(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len();
        Tensor::from_shape(&[rows.len(), cols], rows.iter().flat_map(|r| r.iter().copied()).collect())
            .unwrap()
    }

    #[test]
    fn add_broadcasts() {
        let a = t2(&[&[1., 2.], &[3., 4.]]);
        let b = Tensor::vector(&[10f32, 20.]);
        let c = eval(&Op::Add, &[&a, &b]).unwrap();
        assert_eq!(c, t2(&[&[11., 22.], &[13., 24.]]));
    }

    #[test]
    fn add_refuses_bad_broadcast() {
        let a = t2(&[&[1., 2.], &[3., 4.]]);
        let b = Tensor::vector(&[1f32, 2., 3.]);
        assert!(eval(&Op::Add, &[&a, &b]).is_err());
    }

    #[test]
    fn matmul_2d() {
        let a = t2(&[&[1., 2.], &[3., 4.]]);
        let b = t2(&[&[5., 6.], &[7., 8.]]);
        let c = eval(&Op::MatMul, &[&a, &b]).unwrap();
        assert_eq!(c.into_array::<f32>().unwrap(), arr2(&[[19f32, 22.], [43., 50.]]).into_dyn());
    }

    #[test]
    fn matmul_broadcasts_batch() {
        let a = Tensor::from_shape(&[2, 1, 2], vec![1f32, 2., 3., 4.]).unwrap();
        let b = t2(&[&[1., 0.], &[0., 1.]]);
        let c = eval(&Op::MatMul, &[&a, &b]).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn gather_rows() {
        let data = t2(&[&[0., 0.], &[1., 1.], &[2., 2.]]);
        let idx = Tensor::from_shape(&[1, 2], vec![2i64, 0]).unwrap();
        let g = eval(&Op::Gather { axis: 0 }, &[&data, &idx]).unwrap();
        assert_eq!(g.shape(), &[1, 2, 2]);
        assert_eq!(g.as_slice::<f32>().unwrap(), &[2., 2., 0., 0.]);
    }

    #[test]
    fn gather_out_of_range() {
        let data = t2(&[&[0., 0.], &[1., 1.]]);
        let idx = Tensor::vector(&[2i64]);
        assert!(eval(&Op::Gather { axis: 0 }, &[&data, &idx]).is_err());
    }

    #[test]
    fn reshape_with_zero_and_minus_one() {
        assert_eq!(&*reshape_target(&[2, 128, 32], &[0, 0, 4, 8]).unwrap(), &[2, 128, 4, 8]);
        assert_eq!(&*reshape_target(&[2, 128, 4, 8], &[0, 0, -1]).unwrap(), &[2, 128, 32]);
        assert!(reshape_target(&[2, 3], &[-1, -1]).is_err());
        assert!(reshape_target(&[2, 3], &[4, -1]).is_err());
    }

    #[test]
    fn softmax_sums_to_one() {
        let a = t2(&[&[1., 2., 3.], &[-1., 0., 1000.]]);
        let s = eval(&Op::Softmax { axis: -1 }, &[&a]).unwrap();
        let s = s.into_array::<f32>().unwrap();
        for row in s.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn composites_match_decompositions() {
        let x = Tensor::from_shape(&[2, 4], vec![0.5f32, -1.0, 2.0, 0.0, 3.0, 1.5, -2.5, 0.25]).unwrap();
        let scale = Tensor::vector(&[1f32, 2., 0.5, 1.]);
        let bias = Tensor::vector(&[0f32, 0.1, -0.1, 1.]);
        let ops = [
            (Op::LayerNorm { axis: -1, epsilon: 1e-5 }, vec![&x, &scale, &bias]),
            (Op::Gelu { approximate: false }, vec![&x]),
            (Op::Gelu { approximate: true }, vec![&x]),
        ];
        for (op, inputs) in ops {
            let direct = eval(&op, &inputs).unwrap();
            let mut graph = Eager;
            let values: Vec<Arc<Tensor>> = inputs.iter().map(|t| Arc::new((*t).clone())).collect();
            let refs: Vec<&Arc<Tensor>> = values.iter().collect();
            let decomposed = op.decompose(&mut graph, &refs).unwrap();
            assert!(direct.max_abs_diff(&decomposed).unwrap() < 1e-5, "{op}");
        }
    }

    #[test]
    fn reduce_mean_keep_dims() {
        let a = t2(&[&[1., 3.], &[5., 7.]]);
        let m = eval(&Op::ReduceMean { axes: tvec!(-1), keep_dims: true }, &[&a]).unwrap();
        assert_eq!(m.shape(), &[2, 1]);
        assert_eq!(m.as_slice::<f32>().unwrap(), &[2., 6.]);
    }
}
