//! `torch.onnx.export`-like entry point.
use crate::internal::*;
use crate::model::{ir_version_for_opset, write_model};
use crate::pb::tensor_shape_proto::dimension;
use crate::tensor::dims_mut;
use crate::tracer::{Traced, Tracer};

pub const BATCH_AXIS_NAME: &str = "batch_size";

#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub opset_version: i64,
    /// Store parameters as initializers. When false they become graph inputs.
    pub export_params: bool,
    pub do_constant_folding: bool,
    pub input_names: Vec<String>,
    /// Names bound to the leading model outputs. Outputs past these are dropped.
    pub output_names: Vec<String>,
    /// Input or output name -> axis -> symbolic dimension name.
    pub dynamic_axes: BTreeMap<String, BTreeMap<usize, String>>,
}

impl Default for ExportConfig {
    fn default() -> ExportConfig {
        let batch = || BTreeMap::from([(0, BATCH_AXIS_NAME.to_string())]);
        ExportConfig {
            opset_version: 14,
            export_params: true,
            do_constant_folding: true,
            input_names: vec!["input_ids".to_string()],
            output_names: vec!["output".to_string()],
            dynamic_axes: BTreeMap::from([
                ("input_ids".to_string(), batch()),
                ("output".to_string(), batch()),
            ]),
        }
    }
}

impl ExportConfig {
    pub fn with_opset(self, opset_version: i64) -> ExportConfig {
        ExportConfig { opset_version, ..self }
    }

    pub fn with_constant_folding(self, do_constant_folding: bool) -> ExportConfig {
        ExportConfig { do_constant_folding, ..self }
    }

    pub fn with_export_params(self, export_params: bool) -> ExportConfig {
        ExportConfig { export_params, ..self }
    }
}

#[derive(Clone, Debug)]
pub struct ExportSummary {
    pub opset_version: i64,
    pub nodes: usize,
    pub initializers: usize,
    /// Node count per op type.
    pub op_types: BTreeMap<String, usize>,
    pub folded: usize,
    pub pruned: usize,
    /// The first output, as computed while tracing.
    pub reference_output: Arc<Tensor>,
    /// Serialized size, once written.
    pub bytes: Option<u64>,
}

/// Traces `model` on a synthetic input and writes the graph to `path`.
pub fn export(
    model: &Model,
    input: &SyntheticInput,
    config: &ExportConfig,
    path: impl AsRef<Path>,
) -> PortResult<ExportSummary> {
    let path = path.as_ref();
    input.check_vocabulary(model.config().vocab_size)?;
    let input_ids = input.generate()?;
    let (proto, mut summary) = trace(model, &input_ids, config)?;
    summary.bytes = Some(write_model(&proto, path).with_context(|| format!("Writing {}", path.display()))?);
    info!(
        "Exported {} nodes and {} initializers (opset {}) to {}",
        summary.nodes,
        summary.initializers,
        summary.opset_version,
        path.display()
    );
    Ok(summary)
}

pub fn trace(model: &Model, input_ids: &Tensor, config: &ExportConfig) -> PortResult<(ModelProto, ExportSummary)> {
    ensure!(
        config.input_names.len() == 1,
        "The model takes a single input, got input names {:?}",
        config.input_names
    );
    ensure!(!config.output_names.is_empty(), "No output names given");
    ensure!(input_ids.datum_type() == DatumType::I64, "input_ids must be int64, got {:?}", input_ids.datum_type());
    debug!("{config:?}");

    let mut tracer = Tracer::new(config.opset_version, config.do_constant_folding, config.export_params)?;
    let input = tracer.input(&config.input_names[0], input_ids.clone());
    let outputs = model.forward(&mut tracer, &input)?.into_vec();
    ensure!(
        config.output_names.len() <= outputs.len(),
        "{} output names given, the model has {} outputs",
        config.output_names.len(),
        outputs.len()
    );
    if outputs.len() > config.output_names.len() {
        info!("Dropping {} unnamed model output(s)", outputs.len() - config.output_names.len());
    }
    let bound: Vec<(String, Traced)> = config.output_names.iter().cloned().zip(outputs).collect();
    let reference_output = bound[0].1.value.clone();

    let traced = tracer.into_graph(&bound)?;
    let mut graph = traced.graph;
    apply_dynamic_axes(&mut graph, &config.dynamic_axes)?;

    let mut op_types = BTreeMap::new();
    for node in &graph.node {
        *op_types.entry(node.op_type.clone()).or_insert(0) += 1;
    }
    let summary = ExportSummary {
        opset_version: config.opset_version,
        nodes: graph.node.len(),
        initializers: graph.initializer.len(),
        op_types,
        folded: traced.folded,
        pruned: traced.pruned,
        reference_output,
        bytes: None,
    };
    debug!("Trace: {} folded, {} pruned, ops {:?}", summary.folded, summary.pruned, summary.op_types);

    let proto = ModelProto {
        ir_version: ir_version_for_opset(config.opset_version)?,
        opset_import: vec![OperatorSetIdProto { domain: String::new(), version: config.opset_version }],
        producer_name: "modelport".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        ..ModelProto::default()
    };
    Ok((proto, summary))
}

fn apply_dynamic_axes(graph: &mut GraphProto, dynamic_axes: &BTreeMap<String, BTreeMap<usize, String>>) -> PortResult<()> {
    for (name, axes) in dynamic_axes {
        let Some(vi) = graph.input.iter_mut().chain(graph.output.iter_mut()).find(|vi| vi.name == *name) else {
            warn!("dynamic_axes names {name}, which is neither an input nor an output of the graph. Ignored.");
            continue;
        };
        let dims = dims_mut(vi)?;
        for (&axis, symbol) in axes {
            ensure!(axis < dims.len(), "Dynamic axis {axis} is out of range for {name} of rank {}", dims.len());
            dims[axis].value = Some(dimension::Value::DimParam(symbol.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelport_core::testing::{TinyEncoder, setup_test_logger};

    fn ids(seq: usize) -> Tensor {
        SyntheticInput::new(1, seq, 100, Some(3)).generate().unwrap()
    }

    #[test]
    fn unknown_dynamic_axis_key_is_ignored() {
        setup_test_logger();
        let model = TinyEncoder::distilbert().vocab_size(100).build().unwrap();
        let mut config = ExportConfig::default();
        config.dynamic_axes.insert("attention_mask".into(), BTreeMap::from([(0, "b".to_string())]));
        assert!(trace(&model, &ids(8), &config).is_ok());
    }

    #[test]
    fn out_of_range_dynamic_axis() {
        let model = TinyEncoder::distilbert().vocab_size(100).build().unwrap();
        let mut config = ExportConfig::default();
        config.dynamic_axes.insert("input_ids".into(), BTreeMap::from([(2, "seq".to_string())]));
        let err = trace(&model, &ids(8), &config).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn too_many_output_names() {
        let model = TinyEncoder::distilbert().vocab_size(100).build().unwrap();
        let config = ExportConfig { output_names: vec!["a".into(), "b".into()], ..ExportConfig::default() };
        assert!(trace(&model, &ids(8), &config).is_err());
    }

    #[test]
    fn both_bert_outputs_can_be_kept() {
        let model = TinyEncoder::bert().vocab_size(100).build().unwrap();
        let config = ExportConfig {
            output_names: vec!["last_hidden_state".into(), "pooler_output".into()],
            dynamic_axes: BTreeMap::new(),
            ..ExportConfig::default()
        };
        let (proto, summary) = trace(&model, &ids(8), &config).unwrap();
        let graph = proto.graph.unwrap();
        let outputs: Vec<&str> = graph.output.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(outputs, vec!["last_hidden_state", "pooler_output"]);
        assert_eq!(summary.pruned, 0);
        assert_eq!(summary.reference_output.shape(), &[1, 8, 32]);
    }

    #[test]
    fn opset_fixes_ir_version() {
        let model = TinyEncoder::distilbert().vocab_size(100).build().unwrap();
        for (opset, ir) in [(14, 7), (17, 8), (20, 9)] {
            let (proto, _) = trace(&model, &ids(4), &ExportConfig::default().with_opset(opset)).unwrap();
            assert_eq!(proto.ir_version, ir);
            assert_eq!(proto.opset_import[0].version, opset);
        }
    }
}
