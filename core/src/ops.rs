//! The operator vocabulary of the forward pass, and the graph abstraction
//! the forward pass is written against.
use std::f32::consts::{FRAC_2_PI, SQRT_2};
use std::fmt;

use crate::internal::*;

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    MatMul,
    Erf,
    Tanh,
    Sqrt,
    Relu,
    /// ONNX-style gather: indices (I64) select slices of the data along `axis`.
    Gather { axis: i64 },
    Transpose { perm: TVec<usize> },
    /// `0` copies the input dim at the same position, `-1` is inferred.
    Reshape { shape: TVec<i64> },
    ReduceMean { axes: TVec<i64>, keep_dims: bool },
    Softmax { axis: i64 },
    /// Composite: normalization over `axis` followed by an affine transform.
    /// Inputs are data, scale and bias.
    LayerNorm { axis: i64, epsilon: f32 },
    /// Composite.
    Gelu { approximate: bool },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::Div => "Div",
            Op::Pow => "Pow",
            Op::MatMul => "MatMul",
            Op::Erf => "Erf",
            Op::Tanh => "Tanh",
            Op::Sqrt => "Sqrt",
            Op::Relu => "Relu",
            Op::Gather { .. } => "Gather",
            Op::Transpose { .. } => "Transpose",
            Op::Reshape { .. } => "Reshape",
            Op::ReduceMean { .. } => "ReduceMean",
            Op::Softmax { .. } => "Softmax",
            Op::LayerNorm { .. } => "LayerNormalization",
            Op::Gelu { .. } => "Gelu",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow | Op::MatMul | Op::Gather { .. } => 2,
            Op::LayerNorm { .. } => 3,
            _ => 1,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Op::LayerNorm { .. } | Op::Gelu { .. })
    }

    /// Rewrites a composite op in terms of primitive ones, wiring them in `graph`.
    pub fn decompose<G: Graph + ?Sized>(
        &self,
        graph: &mut G,
        inputs: &[&G::Value],
    ) -> PortResult<G::Value> {
        ensure!(inputs.len() == self.arity(), "{} expects {} inputs", self.name(), self.arity());
        match self {
            Op::LayerNorm { axis, epsilon } => {
                let x = inputs[0];
                let axes: TVec<i64> = tvec!(*axis);
                let mean = graph.apply(Op::ReduceMean { axes: axes.clone(), keep_dims: true }, &[x])?;
                let centered = graph.apply(Op::Sub, &[x, &mean])?;
                let two = graph.constant(Tensor::scalar(2f32))?;
                let squared = graph.apply(Op::Pow, &[&centered, &two])?;
                let var = graph.apply(Op::ReduceMean { axes, keep_dims: true }, &[&squared])?;
                let eps = graph.constant(Tensor::scalar(*epsilon))?;
                let var = graph.apply(Op::Add, &[&var, &eps])?;
                let std = graph.apply(Op::Sqrt, &[&var])?;
                let normed = graph.apply(Op::Div, &[&centered, &std])?;
                let scaled = graph.apply(Op::Mul, &[&normed, inputs[1]])?;
                graph.apply(Op::Add, &[&scaled, inputs[2]])
            }
            Op::Gelu { approximate: false } => {
                let x = inputs[0];
                let sqrt2 = graph.constant(Tensor::scalar(SQRT_2))?;
                let scaled = graph.apply(Op::Div, &[x, &sqrt2])?;
                let erf = graph.apply(Op::Erf, &[&scaled])?;
                let one = graph.constant(Tensor::scalar(1f32))?;
                let shifted = graph.apply(Op::Add, &[&erf, &one])?;
                let prod = graph.apply(Op::Mul, &[x, &shifted])?;
                let half = graph.constant(Tensor::scalar(0.5f32))?;
                graph.apply(Op::Mul, &[&prod, &half])
            }
            Op::Gelu { approximate: true } => {
                let x = inputs[0];
                let three = graph.constant(Tensor::scalar(3f32))?;
                let cube = graph.apply(Op::Pow, &[x, &three])?;
                let coef = graph.constant(Tensor::scalar(0.044715f32))?;
                let cube = graph.apply(Op::Mul, &[&cube, &coef])?;
                let inner = graph.apply(Op::Add, &[x, &cube])?;
                let k = graph.constant(Tensor::scalar(FRAC_2_PI.sqrt()))?;
                let inner = graph.apply(Op::Mul, &[&inner, &k])?;
                let tanh = graph.apply(Op::Tanh, &[&inner])?;
                let one = graph.constant(Tensor::scalar(1f32))?;
                let shifted = graph.apply(Op::Add, &[&tanh, &one])?;
                let prod = graph.apply(Op::Mul, &[x, &shifted])?;
                let half = graph.constant(Tensor::scalar(0.5f32))?;
                graph.apply(Op::Mul, &[&prod, &half])
            }
            _ => bail!("{} is not a composite op", self.name()),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Op::Gather { axis } => write!(f, "Gather(axis={axis})"),
            Op::Transpose { perm } => write!(f, "Transpose({perm:?})"),
            Op::Reshape { shape } => write!(f, "Reshape({shape:?})"),
            Op::ReduceMean { axes, keep_dims } => write!(f, "ReduceMean({axes:?}, keep_dims={keep_dims})"),
            Op::Softmax { axis } => write!(f, "Softmax(axis={axis})"),
            Op::LayerNorm { axis, epsilon } => write!(f, "LayerNormalization(axis={axis}, eps={epsilon})"),
            Op::Gelu { approximate } => write!(f, "Gelu(approximate={approximate})"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Something a forward pass can be wired into.
///
/// Values are opaque to the forward pass, except for their shape: every
/// implementation knows the concrete shape of everything it produced.
pub trait Graph {
    type Value: Clone + fmt::Debug;

    fn parameter(&mut self, name: &str, tensor: &Arc<Tensor>) -> PortResult<Self::Value>;

    fn constant(&mut self, tensor: Tensor) -> PortResult<Self::Value>;

    fn apply(&mut self, op: Op, inputs: &[&Self::Value]) -> PortResult<Self::Value>;

    fn shape_of<'v>(&self, value: &'v Self::Value) -> &'v [usize];

    fn push_scope(&mut self, _scope: &str) {}

    fn pop_scope(&mut self) {}

    fn scoped<T>(&mut self, scope: &str, f: impl FnOnce(&mut Self) -> PortResult<T>) -> PortResult<T>
    where
        Self: Sized,
    {
        self.push_scope(scope);
        let result = f(self);
        self.pop_scope();
        result
    }

    fn scalar(&mut self, value: f32) -> PortResult<Self::Value> {
        self.constant(Tensor::scalar(value))
    }

    fn add(&mut self, a: &Self::Value, b: &Self::Value) -> PortResult<Self::Value> {
        self.apply(Op::Add, &[a, b])
    }

    fn mul(&mut self, a: &Self::Value, b: &Self::Value) -> PortResult<Self::Value> {
        self.apply(Op::Mul, &[a, b])
    }

    fn div(&mut self, a: &Self::Value, b: &Self::Value) -> PortResult<Self::Value> {
        self.apply(Op::Div, &[a, b])
    }

    fn matmul(&mut self, a: &Self::Value, b: &Self::Value) -> PortResult<Self::Value> {
        self.apply(Op::MatMul, &[a, b])
    }

    fn transpose(&mut self, a: &Self::Value, perm: &[usize]) -> PortResult<Self::Value> {
        self.apply(Op::Transpose { perm: perm.into() }, &[a])
    }

    fn reshape(&mut self, a: &Self::Value, shape: &[i64]) -> PortResult<Self::Value> {
        self.apply(Op::Reshape { shape: shape.into() }, &[a])
    }

    fn gather(&mut self, data: &Self::Value, indices: &Self::Value, axis: i64) -> PortResult<Self::Value> {
        self.apply(Op::Gather { axis }, &[data, indices])
    }

    fn softmax(&mut self, a: &Self::Value, axis: i64) -> PortResult<Self::Value> {
        self.apply(Op::Softmax { axis }, &[a])
    }

    /// `x . weight^t + bias`, weight laid out `[out, in]`.
    fn linear(&mut self, x: &Self::Value, weight: &Self::Value, bias: &Self::Value) -> PortResult<Self::Value> {
        let weight = self.transpose(weight, &[1, 0])?;
        let y = self.matmul(x, &weight)?;
        self.add(&y, bias)
    }

    fn layer_norm(
        &mut self,
        x: &Self::Value,
        scale: &Self::Value,
        bias: &Self::Value,
        epsilon: f32,
    ) -> PortResult<Self::Value> {
        self.apply(Op::LayerNorm { axis: -1, epsilon }, &[x, scale, bias])
    }

    fn activation(&mut self, x: &Self::Value, act: Activation) -> PortResult<Self::Value> {
        match act {
            Activation::Gelu => self.apply(Op::Gelu { approximate: false }, &[x]),
            Activation::GeluTanh => self.apply(Op::Gelu { approximate: true }, &[x]),
            Activation::Relu => self.apply(Op::Relu, &[x]),
        }
    }
}
