use std::path::{Path, PathBuf};

use modelport_core::testing::{TinyEncoder, setup_test_logger};
use modelport_h5::hdf5::{self, Dataset, Group, Value};
use modelport_h5::package::{FORMAT, MODEL_CONFIG, WEIGHTS_GROUP};
use modelport_h5::prelude::*;
use modelport_onnx::{ExportConfig, export};
use modelport_tensorflow::prelude::{ConvertConfig, converter};
use modelport_tensorflow::testing::run;

fn saved_model(dir: &Path, model: &Model, config: &ConvertConfig) -> PathBuf {
    let onnx = dir.join("model.onnx");
    export(model, &SyntheticInput::default().with_seed(3), &ExportConfig::default(), &onnx).unwrap();
    let saved = dir.join("saved_model");
    converter().convert(&onnx, &saved, config).unwrap();
    saved
}

#[test]
fn packaged_bert_is_loadable_and_runs() {
    setup_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::bert().build().unwrap();
    let saved = saved_model(dir.path(), &model, &ConvertConfig::default());
    let path = dir.path().join(PACKAGED_FILENAME);
    let packaged = package(&saved, &path, &PackageConfig::default()).unwrap();
    assert_eq!(PackagedModel::load(&path).unwrap(), packaged);

    assert_eq!(
        packaged.signature.inputs,
        vec![TensorSpec { key: "input_ids".into(), node: "input_ids".into(), dtype: DatumType::I64, shape: vec![-1, 128] }]
    );
    let output = &packaged.signature.outputs[0];
    assert_eq!((output.key.as_str(), output.dtype), ("output", DatumType::F32));
    assert_eq!(output.shape, vec![-1, 128, 32]);

    let input = SyntheticInput::new(2, 128, 30522, Some(21)).generate().unwrap();
    let graph = packaged.to_graph_def().unwrap();
    let found = run(&graph, &[("input_ids", input.clone())], "output:0").unwrap();
    let mut eager = Eager;
    let input = eager.constant(input).unwrap();
    let expected = model.forward(&mut eager, &input).unwrap().last_hidden_state;
    assert_eq!(found.shape(), expected.shape());
    for (f, e) in found.as_slice::<f32>().unwrap().iter().zip(expected.as_slice::<f32>().unwrap()) {
        approx::assert_abs_diff_eq!(*f, *e, epsilon = 1e-3);
    }
}

#[test]
fn file_layout() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::distilbert().build().unwrap();
    let saved = saved_model(dir.path(), &model, &ConvertConfig::default().quiet());
    let path = dir.path().join(PACKAGED_FILENAME);
    let packaged = package(&saved, &path, &PackageConfig::default()).unwrap();

    let root = hdf5::read(&path).unwrap();
    assert_eq!(root.attr("format").unwrap(), FORMAT);
    assert_eq!(root.attr("backend").unwrap(), "tensorflow");
    assert!(root.attr("producer").unwrap().starts_with("modelport"));
    let signature: serde_json::Value = serde_json::from_str(root.attr("signature").unwrap()).unwrap();
    assert_eq!(signature["inputs"][0]["dtype"], "int64");

    let Value::String(config) = &root.dataset(MODEL_CONFIG).unwrap().value else { panic!("config is not a string") };
    let config: serde_json::Value = serde_json::from_str(config).unwrap();
    let nodes = config["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), packaged.config.nodes.len());
    let konst = nodes.iter().find(|n| n["op"] == "Const").unwrap();
    assert!(konst["attrs"]["value"]["weight"].is_string());

    let weights = root.group(WEIGHTS_GROUP).unwrap();
    assert_eq!(weights.datasets().count(), packaged.weights.len());
    assert!(weights.datasets().all(|(name, _)| !name.contains('/')));
    let embeddings = packaged.weights.values().find(|t| t.shape() == [30522, 32]);
    assert!(embeddings.is_some());
}

#[test]
fn checkpoints_with_variables_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::distilbert().build().unwrap();
    let saved = saved_model(dir.path(), &model, &ConvertConfig::default());
    std::fs::write(saved.join("variables/variables.index"), b"").unwrap();
    let err = package(&saved, dir.path().join(PACKAGED_FILENAME), &PackageConfig::default()).unwrap_err();
    assert!(format!("{err:#}").contains("variables"), "{err:#}");
    assert!(!dir.path().join(PACKAGED_FILENAME).exists());
}

#[test]
fn signature_must_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let model = TinyEncoder::distilbert().build().unwrap();
    let config = ConvertConfig { output_signaturedefs: false, ..ConvertConfig::default() };
    let saved = saved_model(dir.path(), &model, &config);
    let err = package(&saved, dir.path().join(PACKAGED_FILENAME), &PackageConfig::default()).unwrap_err();
    assert!(format!("{err:#}").contains("serving_default"), "{err:#}");

    let config = PackageConfig { tag: "train".into(), ..PackageConfig::default() };
    assert!(package(&saved, dir.path().join(PACKAGED_FILENAME), &config).is_err());
}

#[test]
fn malformed_directories_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    assert!(package(dir.path().join("missing"), dir.path().join("a.h5"), &PackageConfig::default()).is_err());
    std::fs::write(dir.path().join("saved_model.pb"), b"\x0a\xff garbage").unwrap();
    assert!(package(dir.path(), dir.path().join("a.h5"), &PackageConfig::default()).is_err());
}

#[test]
fn reads_library_layout() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/reference.h5");
    let root = hdf5::read(path).unwrap();

    let mut expected = Group::default();
    expected.set_attr("format", "fixture");
    expected.add_dataset("note", Dataset::new(Value::String("hello, h5py!".into()))).unwrap();
    let weights = expected.add_group("weights").unwrap();
    weights.set_attr("kind", "weights");
    weights.add_dataset("bias", Dataset::new(Value::Tensor(Tensor::vector(&[0.5f32, -1., 2.])))).unwrap();
    let mut ids = Dataset::new(Value::Tensor(Tensor::from_shape(&[2, 2], vec![1i64, 2, 3, -4]).unwrap()));
    ids.attrs.insert("units".into(), "tokens".into());
    weights.add_dataset("ids", ids).unwrap();
    weights.add_dataset("empty", Dataset::new(Value::Tensor(Tensor::zero::<f32>(&[0])))).unwrap();
    assert_eq!(root, expected);
}
