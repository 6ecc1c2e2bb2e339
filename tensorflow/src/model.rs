//! ONNX graph to TensorFlow graph conversion.
use std::collections::HashSet;

use modelport_onnx::model::{default_opset, model_for_path};
use modelport_onnx::pb::tensor_shape_proto::dimension;
use modelport_onnx::pb::{GraphProto, ModelProto, NodeProto, ValueInfoProto};
use modelport_onnx::tensor::{datum_type, tensor_type};

use crate::internal::*;
use crate::saved_model::{PREDICT_METHOD_NAME, saved_model, tensor_info, write_saved_model};
use crate::tensor::{data_type, shape_proto};
use crate::tfpb::tensorflow::{GraphDef, SavedModel, SignatureDef};

pub const MIN_OPSET: i64 = 13;
pub const MAX_OPSET: i64 = 20;

#[derive(Clone, Debug)]
pub struct ConvertConfig {
    /// Attach a serving signature to the meta graph.
    pub output_signaturedefs: bool,
    /// Log the node mapping at `info` instead of `debug`.
    pub verbose: bool,
    pub tag: String,
    pub signature_key: String,
}

impl Default for ConvertConfig {
    fn default() -> ConvertConfig {
        ConvertConfig {
            output_signaturedefs: true,
            verbose: true,
            tag: "serve".to_string(),
            signature_key: "serving_default".to_string(),
        }
    }
}

impl ConvertConfig {
    pub fn quiet(self) -> ConvertConfig {
        ConvertConfig { verbose: false, ..self }
    }

    fn level(&self) -> log::Level {
        if self.verbose { log::Level::Info } else { log::Level::Debug }
    }
}

/// An ONNX value, as seen from the TensorFlow graph.
#[derive(Clone, Debug)]
pub struct TfValue {
    /// The node computing it. Constants only get one when something
    /// consumes them as a tensor.
    pub node: Option<String>,
    pub fact: ValueFact,
    pub konst: Option<Arc<Tensor>>,
}

pub type OpBuilder = fn(&mut ConversionContext, &NodeProto) -> PortResult<()>;

#[derive(Clone, Default)]
pub struct TfOpRegister(pub HashMap<String, OpBuilder>);

impl TfOpRegister {
    pub fn insert(&mut self, s: &'static str, builder: OpBuilder) {
        self.0.insert(s.into(), builder);
    }

    pub fn get(&self, s: &str) -> Option<&OpBuilder> {
        self.0.get(s)
    }
}

/// State of a conversion in progress: the TensorFlow graph so far and
/// where every ONNX value ended up.
pub struct ConversionContext {
    pub opset: i64,
    level: log::Level,
    nodes: Vec<NodeDef>,
    names: HashSet<String>,
    values: HashMap<String, TfValue>,
}

/// TensorFlow node names: `[A-Za-z0-9.][A-Za-z0-9_.\-/]*`.
pub fn sanitize(name: &str) -> String {
    let mut s: String = name
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-/".contains(c) { c } else { '_' })
        .collect();
    if !s.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '.') {
        s.insert(0, 'n');
    }
    s
}

impl ConversionContext {
    pub fn new(opset: i64, level: log::Level) -> ConversionContext {
        ConversionContext { opset, level, nodes: vec![], names: HashSet::new(), values: HashMap::new() }
    }

    /// Claims a name so that no generated node takes it.
    pub fn reserve(&mut self, name: &str) -> PortResult<()> {
        ensure!(self.names.insert(name.to_string()), "TensorFlow node name {name} is used twice");
        Ok(())
    }

    pub fn unique_name(&mut self, base: &str) -> String {
        let base = sanitize(base);
        let mut name = base.clone();
        let mut ix = 0;
        while self.names.contains(&name) {
            ix += 1;
            name = format!("{base}_{ix}");
        }
        self.names.insert(name.clone());
        name
    }

    pub fn bind(&mut self, onnx_name: &str, value: TfValue) {
        self.values.insert(onnx_name.to_string(), value);
    }

    pub fn value(&self, onnx_name: &str) -> PortResult<&TfValue> {
        self.values.get(onnx_name).with_context(|| format!("Value {onnx_name} is not defined"))
    }

    pub fn has_input(&self, node: &NodeProto, ix: usize) -> bool {
        node.input.get(ix).is_some_and(|i| !i.is_empty())
    }

    pub fn input(&self, node: &NodeProto, ix: usize) -> PortResult<&TfValue> {
        let name = node
            .input
            .get(ix)
            .filter(|i| !i.is_empty())
            .with_context(|| format!("Node {} ({}) has no input #{ix}", node.name, node.op_type))?;
        self.value(name).with_context(|| format!("Wiring input #{ix} of {} ({})", node.name, node.op_type))
    }

    pub fn fact(&self, node: &NodeProto, ix: usize) -> PortResult<ValueFact> {
        Ok(self.input(node, ix)?.fact.clone())
    }

    /// An input whose value must be known at conversion time.
    pub fn const_input(&self, node: &NodeProto, ix: usize) -> PortResult<Arc<Tensor>> {
        let value = self.input(node, ix)?;
        match &value.konst {
            Some(k) => Ok(k.clone()),
            None => node.bail(&format!("input #{ix} ({}) must be a constant", node.input[ix])),
        }
    }

    /// The node producing input `ix`, creating a `Const` for constants on
    /// first use.
    pub fn wire(&mut self, node: &NodeProto, ix: usize) -> PortResult<String> {
        let value = self.input(node, ix)?.clone();
        if let Some(name) = value.node {
            return Ok(name);
        }
        let tensor = value.konst.with_context(|| format!("Value {} has no producer", node.input[ix]))?;
        let name = self.konst(&node.input[ix], &tensor)?;
        let onnx_name = &node.input[ix];
        if let Some(v) = self.values.get_mut(onnx_name) {
            v.node = Some(name.clone());
        }
        Ok(name)
    }

    pub fn add_node(&mut self, base: &str, op: &str, inputs: Vec<String>, attrs: Vec<(&str, AttrValue)>) -> String {
        let name = self.unique_name(base);
        let mut node = tfpb::node().name(&name).op(op);
        for input in inputs {
            node = node.input(input);
        }
        for (k, v) in attrs {
            node = node.attr(k, v);
        }
        self.nodes.push(node);
        name
    }

    pub fn konst(&mut self, base: &str, tensor: &Tensor) -> PortResult<String> {
        let value = TensorProto::try_from(tensor)?;
        Ok(self.add_node(
            base,
            "Const",
            vec![],
            vec![("dtype", data_type(tensor.datum_type()).into()), ("value", value.into())],
        ))
    }

    /// A scalar `f32` constant.
    pub fn scalar(&mut self, base: &str, value: f32) -> PortResult<String> {
        self.konst(base, &Tensor::scalar(value))
    }

    /// Binds output `ix` of `node` to a TensorFlow node.
    pub fn output(&mut self, node: &NodeProto, ix: usize, tf_node: String, fact: ValueFact) -> PortResult<()> {
        let name = node
            .output
            .get(ix)
            .with_context(|| format!("Node {} ({}) has no output #{ix}", node.name, node.op_type))?;
        if name.is_empty() {
            return Ok(());
        }
        log!(self.level, "{} ({}) -> {} [{}]", node.name, node.op_type, tf_node, fact);
        self.bind(name, TfValue { node: Some(tf_node), fact, konst: None });
        Ok(())
    }

    /// Binds output `ix` of `node` to a value known at conversion time.
    pub fn output_const(&mut self, node: &NodeProto, ix: usize, tensor: Arc<Tensor>) -> PortResult<()> {
        let name = node
            .output
            .get(ix)
            .with_context(|| format!("Node {} ({}) has no output #{ix}", node.name, node.op_type))?;
        let fact = ValueFact::of_tensor(&tensor);
        log!(self.level, "{} ({}) -> constant [{}]", node.name, node.op_type, fact);
        self.bind(name, TfValue { node: None, fact, konst: Some(tensor) });
        Ok(())
    }

    /// Adds the node computing output 0 of `node`, named after it.
    pub fn emit(
        &mut self,
        node: &NodeProto,
        op: &str,
        inputs: Vec<String>,
        attrs: Vec<(&str, AttrValue)>,
        fact: ValueFact,
    ) -> PortResult<()> {
        let name = self.add_node(&node.name, op, inputs, attrs);
        self.output(node, 0, name, fact)
    }

    pub fn into_nodes(self) -> Vec<NodeDef> {
        self.nodes
    }
}

/// What came out of a conversion.
#[derive(Clone, Debug)]
pub struct Converted {
    pub graph: GraphDef,
    pub inputs: Vec<(String, ValueFact)>,
    pub outputs: Vec<(String, ValueFact)>,
}

impl Converted {
    pub fn signature(&self) -> SignatureDef {
        let infos = |values: &[(String, ValueFact)]| {
            values.iter().map(|(name, fact)| (name.clone(), tensor_info(&sanitize(name), fact))).collect()
        };
        SignatureDef {
            inputs: infos(&self.inputs),
            outputs: infos(&self.outputs),
            method_name: PREDICT_METHOD_NAME.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConversionSummary {
    pub nodes: usize,
    /// Node count per TensorFlow op.
    pub ops: BTreeMap<String, usize>,
    pub bytes: u64,
}

#[derive(Clone, Default)]
pub struct Converter {
    pub op_register: TfOpRegister,
}

fn input_fact(vi: &ValueInfoProto) -> PortResult<ValueFact> {
    let tt = tensor_type(vi)?;
    let dt = datum_type(tt.elem_type)?;
    let shape = tt.shape.as_ref().with_context(|| format!("Input {} has no shape", vi.name))?;
    let dims = shape
        .dim
        .iter()
        .enumerate()
        .map(|(ix, d)| match &d.value {
            Some(dimension::Value::DimValue(v)) if *v >= 0 => Dim::known(*v as usize),
            Some(dimension::Value::DimParam(p)) => Dim::sym(p),
            _ => Dim::sym(&format!("{}__{ix}", vi.name)),
        })
        .collect();
    Ok(ValueFact::new(dt, dims))
}

impl Converter {
    pub fn convert_graph(&self, graph: &GraphProto, opset: i64, config: &ConvertConfig) -> PortResult<Converted> {
        ensure!(
            (MIN_OPSET..=MAX_OPSET).contains(&opset),
            "Unsupported opset version {opset}, expected {MIN_OPSET} to {MAX_OPSET}"
        );
        let mut ctx = ConversionContext::new(opset, config.level());
        let initializers: HashSet<&str> = graph.initializer.iter().map(|i| i.name.as_str()).collect();

        for output in &graph.output {
            ctx.reserve(&sanitize(&output.name))?;
        }

        let mut inputs = vec![];
        for vi in graph.input.iter().filter(|vi| !initializers.contains(vi.name.as_str())) {
            let fact = input_fact(vi)?;
            let name = ctx.unique_name(&vi.name);
            ensure!(name == vi.name, "Input name {} is not a valid TensorFlow node name", vi.name);
            ctx.nodes.push(
                tfpb::node()
                    .name(&name)
                    .op("Placeholder")
                    .attr("dtype", data_type(fact.datum_type))
                    .attr("shape", shape_proto(&fact.tf_shape())),
            );
            log!(ctx.level, "Input {} -> Placeholder [{}]", vi.name, fact);
            ctx.bind(&vi.name, TfValue { node: Some(name), fact: fact.clone(), konst: None });
            inputs.push((vi.name.clone(), fact));
        }

        for init in &graph.initializer {
            let tensor = Tensor::try_from(init).with_context(|| format!("Reading initializer {}", init.name))?;
            ctx.bind(
                &init.name,
                TfValue { node: None, fact: ValueFact::of_tensor(&tensor), konst: Some(Arc::new(tensor)) },
            );
        }

        for node in &graph.node {
            ensure!(
                node.domain.is_empty() || node.domain == "ai.onnx",
                "Node {} ({}) belongs to domain {}, which has no TensorFlow mapping",
                node.name,
                node.op_type,
                node.domain
            );
            let builder = self.op_register.get(&node.op_type).with_context(|| {
                format!("Node {} ({}): op {} has no TensorFlow mapping", node.name, node.op_type, node.op_type)
            })?;
            builder(&mut ctx, node).with_context(|| format!("Converting node {} ({})", node.name, node.op_type))?;
        }

        let mut outputs = vec![];
        for output in &graph.output {
            let value = ctx.value(&output.name)?.clone();
            let fact = value.fact.clone();
            let source = match value.node {
                Some(n) => n,
                None => {
                    let k = value.konst.with_context(|| format!("Output {} has no producer", output.name))?;
                    ctx.konst(&format!("{}/value", output.name), &k)?
                }
            };
            let name = sanitize(&output.name);
            ctx.nodes.push(
                tfpb::node().name(&name).op("Identity").input(source).attr("T", data_type(fact.datum_type)),
            );
            log!(ctx.level, "Output {} -> Identity [{}]", output.name, fact);
            outputs.push((output.name.clone(), fact));
        }

        let mut graph_def = tfpb::graph();
        graph_def.node = ctx.into_nodes();
        Ok(Converted { graph: graph_def, inputs, outputs })
    }

    pub fn convert_model(&self, model: &ModelProto, config: &ConvertConfig) -> PortResult<Converted> {
        let opset = default_opset(model).context("Model does not import the default ONNX domain")?;
        let graph = model.graph.as_ref().context("Model has no graph")?;
        self.convert_graph(graph, opset, config)
    }

    /// Wraps a conversion in a `SavedModel` with one meta graph.
    pub fn saved_model(&self, converted: Converted, config: &ConvertConfig) -> SavedModel {
        let mut signatures = BTreeMap::new();
        if config.output_signaturedefs {
            signatures.insert(config.signature_key.clone(), converted.signature());
        }
        saved_model(converted.graph, &config.tag, signatures)
    }

    /// Converts the ONNX file at `onnx` into a saved-model directory.
    pub fn convert(
        &self,
        onnx: impl AsRef<Path>,
        dir: impl AsRef<Path>,
        config: &ConvertConfig,
    ) -> PortResult<ConversionSummary> {
        let (onnx, dir) = (onnx.as_ref(), dir.as_ref());
        let proto = model_for_path(onnx)?;
        let converted = self.convert_model(&proto, config).with_context(|| format!("Converting {}", onnx.display()))?;
        let mut ops = BTreeMap::new();
        for node in &converted.graph.node {
            *ops.entry(node.op.clone()).or_insert(0) += 1;
        }
        let nodes = converted.graph.node.len();
        let saved = self.saved_model(converted, config);
        let bytes = write_saved_model(dir, &saved)?;
        info!("Converted {} into {nodes} TensorFlow nodes in {}", onnx.display(), dir.display());
        debug!("TensorFlow ops: {ops:?}");
        Ok(ConversionSummary { nodes, ops, bytes })
    }
}
