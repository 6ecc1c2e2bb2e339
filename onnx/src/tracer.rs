//! Records a forward pass into ONNX nodes.
//!
//! Every op is evaluated on real values while being recorded, so each value
//! in the graph has a concrete shape, as in a torch trace.
use std::collections::HashSet;

use modelport_core::eval::eval;

use crate::internal::*;
use crate::tensor::{tensor_proto, value_info};

pub const MIN_OPSET: i64 = 14;
pub const MAX_OPSET: i64 = 20;

/// A value flowing through a trace: its name in the graph and its content.
#[derive(Clone, Debug)]
pub struct Traced {
    pub name: String,
    pub value: Arc<Tensor>,
    /// Known at export time: an initializer, possibly the result of folding.
    pub constant: bool,
}

#[derive(Clone, Debug)]
struct GraphInput {
    name: String,
    datum_type: DatumType,
    shape: TVec<usize>,
    required: bool,
}

/// What a finished trace turned into.
#[derive(Clone, Debug)]
pub struct TracedGraph {
    pub graph: GraphProto,
    pub folded: usize,
    pub pruned: usize,
}

#[derive(Debug)]
pub struct Tracer {
    opset: i64,
    fold: bool,
    export_params: bool,
    scopes: Vec<String>,
    names: HashMap<String, usize>,
    nodes: Vec<NodeProto>,
    initializers: Vec<(String, Arc<Tensor>)>,
    inputs: Vec<GraphInput>,
    params: HashMap<String, Traced>,
    folded: usize,
}

impl Tracer {
    pub fn new(opset: i64, fold: bool, export_params: bool) -> PortResult<Tracer> {
        ensure!(
            (MIN_OPSET..=MAX_OPSET).contains(&opset),
            "Unsupported opset version {opset}, expected {MIN_OPSET} to {MAX_OPSET}"
        );
        Ok(Tracer {
            opset,
            fold,
            export_params,
            scopes: vec![],
            names: HashMap::new(),
            nodes: vec![],
            initializers: vec![],
            inputs: vec![],
            params: HashMap::new(),
            folded: 0,
        })
    }

    pub fn opset(&self) -> i64 {
        self.opset
    }

    pub fn nodes(&self) -> &[NodeProto] {
        &self.nodes
    }

    /// Declares a graph input, traced with `sample`.
    pub fn input(&mut self, name: &str, sample: Tensor) -> Traced {
        self.inputs.push(GraphInput {
            name: name.to_string(),
            datum_type: sample.datum_type(),
            shape: sample.shape().into(),
            required: true,
        });
        Traced { name: name.to_string(), value: Arc::new(sample), constant: false }
    }

    fn scope_path(&self) -> String {
        self.scopes.iter().map(|s| format!("/{s}")).collect()
    }

    fn unique(&mut self, base: String) -> String {
        let seen = self.names.entry(base.clone()).or_insert(0);
        *seen += 1;
        if *seen == 1 { base } else { format!("{}_{}", base, *seen - 1) }
    }

    fn initializer(&mut self, name: String, tensor: Arc<Tensor>) -> Traced {
        self.initializers.push((name.clone(), tensor.clone()));
        Traced { name, value: tensor, constant: true }
    }

    /// Whether the target opset has a node for `op`. Composite ops missing
    /// from the opset are recorded through their decomposition.
    fn has_native(&self, op: &Op) -> bool {
        match op {
            Op::LayerNorm { .. } => self.opset >= 17,
            Op::Gelu { .. } => self.opset >= 20,
            _ => true,
        }
    }

    fn emit(&mut self, op: &Op, inputs: Vec<String>, attribute: Vec<AttributeProto>, value: Tensor) -> Traced {
        let name = self.unique(format!("{}/{}", self.scope_path(), op.name()));
        let output = format!("{name}_output_0");
        trace!("{name}: {op} {inputs:?} -> {value:?}");
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![output.clone()],
            name,
            op_type: op.name().to_string(),
            attribute,
            ..NodeProto::default()
        });
        Traced { name: output, value: Arc::new(value), constant: false }
    }

    /// Binds `outputs` to their final names, prunes what they do not depend
    /// on, and assembles the graph.
    pub fn into_graph(mut self, outputs: &[(String, Traced)]) -> PortResult<TracedGraph> {
        let mut graph_outputs = vec![];
        for (name, traced) in outputs {
            ensure!(!traced.constant, "Output {name} is a constant, there is nothing to export");
            let producer = self
                .nodes
                .iter_mut()
                .find(|n| n.output.contains(&traced.name))
                .with_context(|| format!("Output {name} is a graph input, not computed by the model"))?;
            for o in producer.output.iter_mut().filter(|o| **o == traced.name) {
                *o = name.clone();
            }
            for node in &mut self.nodes {
                for i in node.input.iter_mut().filter(|i| **i == traced.name) {
                    *i = name.clone();
                }
            }
            graph_outputs.push(value_info(name, traced.value.datum_type(), traced.value.shape()));
        }

        let mut live: HashSet<String> = outputs.iter().map(|(name, _)| name.clone()).collect();
        let mut kept = vec![];
        let mut pruned = 0;
        for node in self.nodes.into_iter().rev() {
            if node.output.iter().any(|o| live.contains(o)) {
                live.extend(node.input.iter().cloned());
                kept.push(node);
            } else {
                debug!("Pruning {} ({})", node.name, node.op_type);
                pruned += 1;
            }
        }
        kept.reverse();

        let initializer = self
            .initializers
            .iter()
            .filter(|(name, _)| live.contains(name))
            .map(|(name, tensor)| tensor_proto(name, tensor))
            .collect::<PortResult<Vec<_>>>()?;
        let input = self
            .inputs
            .iter()
            .filter(|i| i.required || live.contains(&i.name))
            .map(|i| value_info(&i.name, i.datum_type, &i.shape))
            .collect();

        Ok(TracedGraph {
            graph: GraphProto {
                node: kept,
                name: "main_graph".to_string(),
                initializer,
                input,
                output: graph_outputs,
                ..GraphProto::default()
            },
            folded: self.folded,
            pruned,
        })
    }
}

impl Graph for Tracer {
    type Value = Traced;

    fn parameter(&mut self, name: &str, tensor: &Arc<Tensor>) -> PortResult<Traced> {
        if let Some(traced) = self.params.get(name) {
            return Ok(traced.clone());
        }
        let traced = if self.export_params {
            self.initializer(name.to_string(), tensor.clone())
        } else {
            self.inputs.push(GraphInput {
                name: name.to_string(),
                datum_type: tensor.datum_type(),
                shape: tensor.shape().into(),
                required: false,
            });
            Traced { name: name.to_string(), value: tensor.clone(), constant: false }
        };
        self.params.insert(name.to_string(), traced.clone());
        Ok(traced)
    }

    fn constant(&mut self, tensor: Tensor) -> PortResult<Traced> {
        let name = self.unique(format!("{}/Constant", self.scope_path()));
        Ok(self.initializer(format!("{name}_output_0"), Arc::new(tensor)))
    }

    fn apply(&mut self, op: Op, inputs: &[&Traced]) -> PortResult<Traced> {
        ensure!(inputs.len() == op.arity(), "{} expects {} inputs, got {}", op, op.arity(), inputs.len());
        let values: TVec<&Tensor> = inputs.iter().map(|i| &*i.value).collect();

        if self.fold && inputs.iter().all(|i| i.constant) {
            let value = eval(&op, &values)?;
            self.folded += 1;
            let name = format!("onnx::{}_{}", op.name(), self.folded);
            trace!("Folded {op} into {name} {value:?}");
            return Ok(self.initializer(name, Arc::new(value)));
        }

        if !self.has_native(&op) {
            return op.decompose(self, inputs);
        }

        let value = eval(&op, &values).with_context(|| format!("Tracing {op} in {}", self.scope_path()))?;
        let mut names: Vec<String> = inputs.iter().map(|i| i.name.clone()).collect();
        let mut attribute = vec![];
        match &op {
            Op::Gather { axis } | Op::Softmax { axis } => attribute.push(AttributeProto::int("axis", *axis)),
            Op::Transpose { perm } => {
                attribute.push(AttributeProto::ints("perm", perm.iter().map(|&p| p as i64)))
            }
            Op::Reshape { shape } => {
                let shape = self.constant(Tensor::vector(&shape[..]))?;
                names.push(shape.name);
            }
            Op::ReduceMean { axes, keep_dims } => {
                if self.opset >= 18 {
                    let axes = self.constant(Tensor::vector(&axes[..]))?;
                    names.push(axes.name);
                } else {
                    attribute.push(AttributeProto::ints("axes", axes.iter().copied()));
                }
                attribute.push(AttributeProto::int("keepdims", *keep_dims as i64));
            }
            Op::LayerNorm { axis, epsilon } => {
                attribute.push(AttributeProto::int("axis", *axis));
                attribute.push(AttributeProto::float("epsilon", *epsilon));
            }
            Op::Gelu { approximate } => {
                attribute.push(AttributeProto::string("approximate", if *approximate { "tanh" } else { "none" }))
            }
            _ => (),
        }
        Ok(self.emit(&op, names, attribute, value))
    }

    fn shape_of<'v>(&self, value: &'v Traced) -> &'v [usize] {
        value.value.shape()
    }

    fn push_scope(&mut self, scope: &str) {
        self.scopes.push(scope.to_string());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight() -> Arc<Tensor> {
        Arc::new(Tensor::from_shape(&[3, 2], vec![1f32, 2., 3., 4., 5., 6.]).unwrap())
    }

    fn bias() -> Arc<Tensor> {
        Arc::new(Tensor::vector(&[0.5f32, -0.5, 0.]))
    }

    fn linear(tracer: &mut Tracer) -> Traced {
        let x = tracer.input("x", Tensor::from_shape(&[1, 2], vec![1f32, 1.]).unwrap());
        tracer
            .scoped("dense", |t| {
                let w = t.parameter("dense.weight", &weight())?;
                let b = t.parameter("dense.bias", &bias())?;
                t.linear(&x, &w, &b)
            })
            .unwrap()
    }

    fn op_types(tracer: &Tracer) -> Vec<&str> {
        tracer.nodes().iter().map(|n| n.op_type.as_str()).collect()
    }

    #[test]
    fn records_scoped_nodes() {
        let mut tracer = Tracer::new(14, false, true).unwrap();
        let y = linear(&mut tracer);
        assert_eq!(op_types(&tracer), vec!["Transpose", "MatMul", "Add"]);
        assert_eq!(tracer.nodes()[1].name, "/dense/MatMul");
        assert_eq!(y.name, "/dense/Add_output_0");
        assert_eq!(y.value.as_slice::<f32>().unwrap(), &[3.5, 6.5, 11.]);
    }

    #[test]
    fn folds_weight_transpose() {
        let mut tracer = Tracer::new(14, true, true).unwrap();
        let y = linear(&mut tracer);
        assert_eq!(op_types(&tracer), vec!["MatMul", "Add"]);
        assert!(tracer.nodes()[0].input[1].starts_with("onnx::Transpose"));
        assert_eq!(y.value.as_slice::<f32>().unwrap(), &[3.5, 6.5, 11.]);
    }

    #[test]
    fn params_as_inputs_are_not_folded() {
        let mut tracer = Tracer::new(14, true, false).unwrap();
        let y = linear(&mut tracer);
        assert_eq!(op_types(&tracer), vec!["Transpose", "MatMul", "Add"]);
        let traced = tracer.into_graph(&[("y".to_string(), y)]).unwrap();
        let inputs: Vec<&str> = traced.graph.input.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(inputs, vec!["x", "dense.weight", "dense.bias"]);
        assert!(traced.graph.initializer.is_empty());
    }

    #[test]
    fn repeated_names_get_suffixes() {
        let mut tracer = Tracer::new(14, false, true).unwrap();
        let x = tracer.input("x", Tensor::vector(&[1f32, -1.]));
        let a = tracer.apply(Op::Relu, &[&x]).unwrap();
        let b = tracer.apply(Op::Relu, &[&a]).unwrap();
        assert_eq!(a.name, "/Relu_output_0");
        assert_eq!(b.name, "/Relu_1_output_0");
    }

    #[test]
    fn composites_follow_opset() {
        for (opset, native) in [(14, false), (17, true)] {
            let mut tracer = Tracer::new(opset, false, true).unwrap();
            let x = tracer.input("x", Tensor::from_shape(&[1, 2], vec![1f32, 3.]).unwrap());
            let g = tracer.constant(Tensor::vector(&[1f32, 1.])).unwrap();
            let b = tracer.constant(Tensor::vector(&[0f32, 0.])).unwrap();
            let y = tracer.layer_norm(&x, &g, &b, 1e-5).unwrap();
            assert_eq!(op_types(&tracer).contains(&"LayerNormalization"), native);
            let y = y.value.as_slice::<f32>().unwrap().to_vec();
            assert!((y[0] + 1.0).abs() < 1e-3 && (y[1] - 1.0).abs() < 1e-3, "{y:?}");
        }
    }

    #[test]
    fn reduce_mean_axes_move_to_input() {
        let mut tracer = Tracer::new(18, false, true).unwrap();
        let x = tracer.input("x", Tensor::from_shape(&[1, 2], vec![1f32, 3.]).unwrap());
        tracer.apply(Op::ReduceMean { axes: tvec!(-1), keep_dims: true }, &[&x]).unwrap();
        let node = &tracer.nodes()[0];
        assert_eq!(node.input.len(), 2);
        assert!(node.get_attr_opt_tvec::<i64>("axes").unwrap().is_none());
        assert!(node.get_attr::<bool>("keepdims").unwrap());
    }

    #[test]
    fn prunes_unused_branches() {
        let mut tracer = Tracer::new(14, false, true).unwrap();
        let y = linear(&mut tracer);
        let unused = tracer.apply(Op::Tanh, &[&y]).unwrap();
        let kept = tracer.apply(Op::Relu, &[&y]).unwrap();
        drop(unused);
        let traced = tracer.into_graph(&[("output".to_string(), kept)]).unwrap();
        assert_eq!(traced.pruned, 1);
        let last = traced.graph.node.last().unwrap();
        assert_eq!(last.output, vec!["output".to_string()]);
        assert_eq!(traced.graph.initializer.len(), 2);
    }

    #[test]
    fn refuses_unknown_opsets() {
        assert!(Tracer::new(13, true, true).is_err());
        assert!(Tracer::new(21, true, true).is_err());
    }
}
