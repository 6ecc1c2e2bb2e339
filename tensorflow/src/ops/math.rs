use crate::internal::*;
use crate::ops::t;
use crate::shape::{broadcast, fmt_shape};

pub fn register_all_ops(reg: &mut TfOpRegister) {
    reg.insert("Add", |ctx, node| binary(ctx, node, "AddV2"));
    reg.insert("Sub", |ctx, node| binary(ctx, node, "Sub"));
    reg.insert("Mul", |ctx, node| binary(ctx, node, "Mul"));
    reg.insert("Div", div);
    reg.insert("Pow", |ctx, node| binary(ctx, node, "Pow"));
    reg.insert("MatMul", matmul);

    reg.insert("Erf", |ctx, node| unary_float(ctx, node, "Erf"));
    reg.insert("Tanh", |ctx, node| unary_float(ctx, node, "Tanh"));
    reg.insert("Sqrt", |ctx, node| unary_float(ctx, node, "Sqrt"));
    reg.insert("Relu", |ctx, node| unary_float(ctx, node, "Relu"));
}

fn binary(ctx: &mut ConversionContext, node: &NodeProto, op: &str) -> PortResult<()> {
    let (a, b) = (ctx.fact(node, 0)?, ctx.fact(node, 1)?);
    ensure!(a.datum_type == b.datum_type, "Operands of different types: {a} and {b}");
    let shape = broadcast(&a.shape, &b.shape)?;
    let inputs = vec![ctx.wire(node, 0)?, ctx.wire(node, 1)?];
    ctx.emit(node, op, inputs, vec![t(a.datum_type)], a.with_shape(shape))
}

/// ONNX integer division truncates, as TensorFlow's `TruncateDiv`.
fn div(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let op = if ctx.fact(node, 0)?.datum_type == DatumType::F32 { "RealDiv" } else { "TruncateDiv" };
    binary(ctx, node, op)
}

fn unary_float(ctx: &mut ConversionContext, node: &NodeProto, op: &str) -> PortResult<()> {
    let fact = ctx.fact(node, 0)?;
    node.expect(fact.datum_type == DatumType::F32, || format!("a float input, got {}", fact.datum_type))?;
    let input = ctx.wire(node, 0)?;
    ctx.emit(node, op, vec![input], vec![t(fact.datum_type)], fact)
}

/// `BatchMatMulV2` broadcasts batch dimensions the way ONNX `MatMul` does,
/// for operands of rank 2 and more.
fn matmul(ctx: &mut ConversionContext, node: &NodeProto) -> PortResult<()> {
    let (a, b) = (ctx.fact(node, 0)?, ctx.fact(node, 1)?);
    if a.rank() < 2 || b.rank() < 2 {
        return node.bail(&format!(
            "matrix-vector products ({} x {}) have no BatchMatMulV2 mapping",
            fmt_shape(&a.shape),
            fmt_shape(&b.shape)
        ));
    }
    let (ra, rb) = (a.rank(), b.rank());
    ensure!(
        a.shape[ra - 1] == b.shape[rb - 2],
        "MatMul inner dimensions mismatch: {} x {}",
        fmt_shape(&a.shape),
        fmt_shape(&b.shape)
    );
    let mut shape = broadcast(&a.shape[..ra - 2], &b.shape[..rb - 2])?;
    shape.push(a.shape[ra - 2].clone());
    shape.push(b.shape[rb - 1].clone());
    let inputs = vec![ctx.wire(node, 0)?, ctx.wire(node, 1)?];
    let attrs = vec![t(a.datum_type), ("adj_x", false.into()), ("adj_y", false.into())];
    ctx.emit(node, "BatchMatMulV2", inputs, attrs, a.with_shape(shape))
}
