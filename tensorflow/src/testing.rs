//! A reference runner for frozen graphs, to check conversions numerically.
use modelport_core::eval::eval;

use crate::internal::*;
use crate::tfpb::tensorflow::GraphDef;

/// Runs a frozen inference graph, mapping TensorFlow ops back onto the
/// reference evaluator.
pub fn run(graph: &GraphDef, feeds: &[(&str, Tensor)], fetch: &str) -> PortResult<Tensor> {
    let mut values: HashMap<String, Arc<Tensor>> = HashMap::new();
    for (name, t) in feeds {
        values.insert(name.to_string(), Arc::new(t.clone()));
    }
    for node in &graph.node {
        if values.contains_key(&node.name) {
            continue;
        }
        let inputs = node
            .input
            .iter()
            .map(|i| {
                let name = i.split(':').next().unwrap_or(i);
                values.get(name).cloned().with_context(|| format!("{} needs {name}", node.name))
            })
            .collect::<PortResult<Vec<_>>>()?;
        let value = step(node, &inputs).with_context(|| format!("Running {} ({})", node.name, node.op))?;
        values.insert(node.name.clone(), Arc::new(value));
    }
    let name = fetch.split(':').next().unwrap_or(fetch);
    values.get(name).map(|t| (**t).clone()).with_context(|| format!("No value for {fetch}"))
}

fn ints(t: &Tensor) -> PortResult<Vec<i64>> {
    Ok(t.as_slice::<i64>()?.to_vec())
}

fn step(node: &NodeDef, inputs: &[Arc<Tensor>]) -> PortResult<Tensor> {
    let i: Vec<&Tensor> = inputs.iter().map(|t| &**t).collect();
    let op = match node.op.as_str() {
        "Placeholder" => bail!("Placeholder {} is not fed", node.name),
        "Const" => return node.get_attr_tensor("value"),
        "Identity" => return Ok(i[0].clone()),
        "Cast" => return Ok(i[0].cast_to(node.get_attr_datum_type("DstT")?)),
        "Rsqrt" => {
            let sqrt = eval(&Op::Sqrt, &[i[0]])?;
            return eval(&Op::Div, &[&Tensor::scalar(1f32), &sqrt]);
        }
        "AddV2" => Op::Add,
        "Sub" => Op::Sub,
        "Mul" => Op::Mul,
        "RealDiv" => Op::Div,
        "Pow" => Op::Pow,
        "BatchMatMulV2" => {
            ensure!(!node.get_attr_bool("adj_x")? && !node.get_attr_bool("adj_y")?);
            Op::MatMul
        }
        "Erf" => Op::Erf,
        "Tanh" => Op::Tanh,
        "Sqrt" => Op::Sqrt,
        "Relu" => Op::Relu,
        "Softmax" => Op::Softmax { axis: -1 },
        "GatherV2" => {
            let axis = i[2].to_scalar::<i64>()?;
            return eval(&Op::Gather { axis }, &i[..2]);
        }
        "Transpose" => {
            let perm = ints(i[1])?.into_iter().map(|p| p as usize).collect();
            return eval(&Op::Transpose { perm }, &i[..1]);
        }
        "Reshape" => {
            let shape = ints(i[1])?;
            ensure!(!shape.contains(&0), "TensorFlow reshape targets never copy dimensions");
            return eval(&Op::Reshape { shape: shape.into() }, &i[..1]);
        }
        "Mean" => {
            let axes = ints(i[1])?.into();
            let keep_dims = node.get_attr_bool("keep_dims")?;
            return eval(&Op::ReduceMean { axes, keep_dims }, &i[..1]);
        }
        other => bail!("No reference for TensorFlow op {other}"),
    };
    eval(&op, &i)
}
