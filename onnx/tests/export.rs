use std::path::Path;

use modelport_core::prelude::*;
use modelport_core::testing::{TinyEncoder, setup_test_logger};
use modelport_onnx::pb::tensor_shape_proto::dimension::Value as DimValue;
use modelport_onnx::pb::{GraphProto, ModelProto};
use modelport_onnx::tensor::tensor_type;
use modelport_onnx::{ExportConfig, export, model_for_path};

mod tract {
    use tract_onnx::prelude::*;

    pub fn run(path: &std::path::Path, ids: &[i64], shape: [usize; 2]) -> TractResult<Vec<f32>> {
        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, i64::fact(shape).into())?
            .into_optimized()?
            .into_runnable()?;
        let input = Tensor::from_shape(&shape, ids)?;
        let outputs = model.run(tvec!(input.into()))?;
        Ok(outputs[0].as_slice::<f32>()?.to_vec())
    }
}

fn export_to(dir: &Path, model: &Model, config: &ExportConfig) -> ModelProto {
    let path = dir.join("model.onnx");
    export(model, &SyntheticInput::default().with_seed(7), config, &path).unwrap();
    model_for_path(&path).unwrap()
}

fn graph(proto: &ModelProto) -> &GraphProto {
    proto.graph.as_ref().unwrap()
}

fn dims(vi: &modelport_onnx::pb::ValueInfoProto) -> Vec<DimValue> {
    tensor_type(vi).unwrap().shape.as_ref().unwrap().dim.iter().map(|d| d.value.clone().unwrap()).collect()
}

fn matches_eager(model: &Model, path: &Path) {
    let input = SyntheticInput::new(2, 128, 30522, Some(11)).generate().unwrap();
    let ids = input.as_slice::<i64>().unwrap().to_vec();
    let found = tract::run(path, &ids, [2, 128]).unwrap();

    let mut eager = Eager;
    let input = eager.constant(input).unwrap();
    let expected = model.forward(&mut eager, &input).unwrap().last_hidden_state;
    let expected = expected.as_slice::<f32>().unwrap();
    assert_eq!(found.len(), expected.len());
    for (f, e) in found.iter().zip(expected) {
        approx::assert_abs_diff_eq!(*f, *e, epsilon = 1e-3);
    }
}

#[test]
fn bert_graph_runs_on_a_larger_batch() {
    setup_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::bert().build().unwrap();
    export_to(dir.path(), &model, &ExportConfig::default());
    matches_eager(&model, &dir.path().join("model.onnx"));
}

#[test]
fn distilbert_tanh_gelu_runs_on_a_larger_batch() {
    setup_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::distilbert().activation("gelu_new").build().unwrap();
    export_to(dir.path(), &model, &ExportConfig::default());
    matches_eager(&model, &dir.path().join("model.onnx"));
}

#[test]
fn single_input_single_output_with_dynamic_batch() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::bert().build().unwrap();
    let proto = export_to(dir.path(), &model, &ExportConfig::default());
    let graph = graph(&proto);

    assert_eq!(graph.input.len(), 1);
    assert_eq!(graph.input[0].name, "input_ids");
    assert_eq!(dims(&graph.input[0]), vec![DimValue::DimParam("batch_size".into()), DimValue::DimValue(128)]);

    assert_eq!(graph.output.len(), 1);
    assert_eq!(graph.output[0].name, "output");
    assert_eq!(
        dims(&graph.output[0]),
        vec![DimValue::DimParam("batch_size".into()), DimValue::DimValue(128), DimValue::DimValue(32)]
    );

    assert!(graph.node.iter().all(|n| !n.name.starts_with("/pooler")));
    assert!(graph.initializer.iter().all(|i| !i.name.starts_with("pooler")));
    assert!(graph.node.iter().any(|n| n.name.starts_with("/encoder/layer.1/attention")));
}

#[test]
fn folding_removes_weight_transposes() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::bert().build().unwrap();
    let is_weight_transpose = |g: &GraphProto| {
        g.node.iter().filter(|n| n.op_type == "Transpose" && n.input[0].ends_with(".weight")).count()
    };

    let folded = export_to(dir.path(), &model, &ExportConfig::default());
    let unfolded = export_to(dir.path(), &model, &ExportConfig::default().with_constant_folding(false));
    assert_eq!(is_weight_transpose(graph(&folded)), 0);
    // q, k, v, attention output, intermediate, output, per layer
    assert_eq!(is_weight_transpose(graph(&unfolded)), 12);
    assert!(graph(&folded).node.len() < graph(&unfolded).node.len());
}

#[test]
fn lowering_depends_on_opset() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::bert().build().unwrap();
    let ops = |opset: i64| -> Vec<String> {
        let proto = export_to(dir.path(), &model, &ExportConfig::default().with_opset(opset));
        graph(&proto).node.iter().map(|n| n.op_type.clone()).collect()
    };

    let v14 = ops(14);
    assert!(!v14.iter().any(|op| op == "LayerNormalization" || op == "Gelu"));
    assert!(v14.iter().any(|op| op == "Erf"));

    let v17 = ops(17);
    assert_eq!(v17.iter().filter(|op| *op == "LayerNormalization").count(), 5);
    assert!(!v17.iter().any(|op| op == "Gelu"));

    let v20 = ops(20);
    assert_eq!(v20.iter().filter(|op| *op == "Gelu").count(), 2);
    assert!(!v20.iter().any(|op| op == "Erf"));
}

#[test]
fn unexported_params_become_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::distilbert().build().unwrap();
    let proto = export_to(dir.path(), &model, &ExportConfig::default().with_export_params(false));
    let graph = graph(&proto);
    assert_eq!(graph.input[0].name, "input_ids");
    assert!(graph.input.iter().any(|i| i.name == "embeddings.word_embeddings.weight"));
    assert!(graph.initializer.iter().all(|i| !i.name.ends_with(".weight")));
}

#[test]
fn synthetic_ids_must_fit_the_vocabulary() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::bert().vocab_size(1000).build().unwrap();
    let path = dir.path().join("model.onnx");
    let err = export(&model, &SyntheticInput::default(), &ExportConfig::default(), &path).unwrap_err();
    assert!(err.to_string().contains("vocabulary"), "{err}");
    assert!(!path.exists());
}
