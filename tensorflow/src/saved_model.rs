//! The saved-model directory: `saved_model.pb` next to a `variables/`
//! directory.
use prost::Message;

use crate::internal::*;
use crate::tensor::{data_type, shape_proto};
use crate::tfpb::tensorflow::{GraphDef, MetaGraphDef, MetaInfoDef, SavedModel, SignatureDef, TensorInfo};

pub const SAVED_MODEL_FILENAME: &str = "saved_model.pb";
pub const VARIABLES_DIR: &str = "variables";
pub const VARIABLES_INDEX: &str = "variables.index";
pub const SAVED_MODEL_SCHEMA_VERSION: i64 = 1;
pub const PREDICT_METHOD_NAME: &str = "tensorflow/serving/predict";

/// Describes output 0 of `node`.
pub fn tensor_info(node: &str, fact: &ValueFact) -> TensorInfo {
    TensorInfo {
        name: format!("{node}:0"),
        dtype: data_type(fact.datum_type).into(),
        tensor_shape: Some(shape_proto(&fact.tf_shape())),
    }
}

pub fn saved_model(graph: GraphDef, tag: &str, signature_def: BTreeMap<String, SignatureDef>) -> SavedModel {
    let meta_graph = MetaGraphDef {
        meta_info_def: Some(MetaInfoDef {
            tags: vec![tag.to_string()],
            meta_graph_version: format!("modelport {}", env!("CARGO_PKG_VERSION")),
            ..MetaInfoDef::default()
        }),
        graph_def: Some(graph),
        signature_def,
    };
    SavedModel { saved_model_schema_version: SAVED_MODEL_SCHEMA_VERSION, meta_graphs: vec![meta_graph] }
}

impl SavedModel {
    /// The meta graph carrying `tag`.
    pub fn meta_graph(&self, tag: &str) -> PortResult<&MetaGraphDef> {
        self.meta_graphs
            .iter()
            .find(|mg| mg.meta_info_def.as_ref().is_some_and(|info| info.tags.iter().any(|t| t == tag)))
            .with_context(|| {
                let tags: Vec<&Vec<String>> =
                    self.meta_graphs.iter().filter_map(|mg| mg.meta_info_def.as_ref().map(|i| &i.tags)).collect();
                format!("No meta graph tagged {tag:?}, found {tags:?}")
            })
    }
}

impl MetaGraphDef {
    pub fn graph(&self) -> PortResult<&GraphDef> {
        self.graph_def.as_ref().context("Meta graph has no graph")
    }
}

/// Writes `saved_model.pb` and an empty `variables/` under `dir`. Returns
/// the size of the protobuf.
pub fn write_saved_model(dir: impl AsRef<Path>, model: &SavedModel) -> PortResult<u64> {
    let dir = dir.as_ref();
    fs_err::create_dir_all(dir.join(VARIABLES_DIR))?;
    let bytes = model.encode_to_vec();
    let path = dir.join(SAVED_MODEL_FILENAME);
    fs_err::write(&path, &bytes)?;
    debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes.len() as u64)
}

pub fn read_saved_model(dir: impl AsRef<Path>) -> PortResult<SavedModel> {
    let path = dir.as_ref().join(SAVED_MODEL_FILENAME);
    let bytes = fs_err::read(&path)?;
    SavedModel::decode(&*bytes).with_context(|| format!("Decoding {}", path.display()))
}
