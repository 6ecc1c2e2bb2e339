//! The conversion chain: checkpoint directory, torch checkpoint, ONNX graph,
//! TensorFlow SavedModel, packaged HDF5 file.
//!
//! Each stage consumes the artifact of the previous one. Artifact types can
//! only be built by the stage producing them, so stages can not run out of
//! order.
use std::fmt;

use modelport_core::checkpoint::write_checkpoint;
use modelport_core::internal::*;
use modelport_h5::{PackageConfig, package};
use modelport_onnx::{ExportConfig, ExportSummary, export};
use modelport_tensorflow::model::{ConversionSummary, ConvertConfig};

pub const CHECKPOINT_FILENAME: &str = "model.pt";
pub const ONNX_FILENAME: &str = "model.onnx";
pub const SAVED_MODEL_DIRNAME: &str = "saved_model";
pub use modelport_h5::prelude::PACKAGED_FILENAME;

/// Where every artifact goes, given the model directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifacts {
    pub dir: PathBuf,
    pub checkpoint: PathBuf,
    pub onnx: PathBuf,
    pub saved_model: PathBuf,
    pub packaged: PathBuf,
}

impl Artifacts {
    pub fn for_dir(dir: impl AsRef<Path>) -> Artifacts {
        let dir = dir.as_ref();
        Artifacts {
            dir: dir.to_path_buf(),
            checkpoint: dir.join(CHECKPOINT_FILENAME),
            onnx: dir.join(ONNX_FILENAME),
            saved_model: dir.join(SAVED_MODEL_DIRNAME),
            packaged: dir.join(PACKAGED_FILENAME),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Load,
    Checkpoint,
    Export,
    Convert,
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::Load => "Loader",
            Stage::Checkpoint => "Checkpoint writer",
            Stage::Export => "Graph export",
            Stage::Convert => "Graph converter",
            Stage::Package => "Packager",
        };
        write!(f, "{name}")
    }
}

/// Error context naming the stage a failure happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageFailed(pub Stage);

impl fmt::Display for StageFailed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} stage failed", self.0)
    }
}

/// The stage an error returned by [`run`] comes from.
pub fn failed_stage(error: &PortError) -> Option<Stage> {
    error.downcast_ref::<StageFailed>().map(|s| s.0)
}

fn stage<T>(stage: Stage, f: impl FnOnce() -> PortResult<T>) -> PortResult<T> {
    info!("{stage} stage");
    f().context(StageFailed(stage))
}

macro_rules! artifact {
    ($name:ident, $what:literal) => {
        #[doc = concat!("Path to a written ", $what, ".")]
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name(PathBuf);

        impl $name {
            pub fn path(&self) -> &Path {
                &self.0
            }
        }
    };
}

artifact!(CheckpointFile, "torch checkpoint");
artifact!(OnnxFile, "ONNX graph");
artifact!(SavedModelDir, "SavedModel directory");
artifact!(PackagedFile, "packaged model");

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub load: LoadOptions,
    pub input: SyntheticInput,
    pub export: ExportConfig,
    pub convert: ConvertConfig,
    pub package: PackageConfig,
    pub write_checkpoint: bool,
}

impl Default for PipelineConfig {
    fn default() -> PipelineConfig {
        PipelineConfig {
            load: LoadOptions::default(),
            input: SyntheticInput::default(),
            export: ExportConfig::default(),
            convert: ConvertConfig::default(),
            package: PackageConfig::default(),
            write_checkpoint: true,
        }
    }
}

pub fn load_model(artifacts: &Artifacts, config: &PipelineConfig) -> PortResult<Model> {
    loader::load(&artifacts.dir, &config.load)
}

pub fn checkpoint(model: &Model, artifacts: &Artifacts) -> PortResult<CheckpointFile> {
    Ok(CheckpointFile(write_checkpoint(model.state_dict(), &artifacts.checkpoint)?))
}

pub fn export_graph(model: &Model, artifacts: &Artifacts, config: &PipelineConfig) -> PortResult<(OnnxFile, ExportSummary)> {
    let summary = export(model, &config.input, &config.export, &artifacts.onnx)?;
    Ok((OnnxFile(artifacts.onnx.clone()), summary))
}

pub fn convert_graph(
    onnx: &OnnxFile,
    artifacts: &Artifacts,
    config: &PipelineConfig,
) -> PortResult<(SavedModelDir, ConversionSummary)> {
    let summary = modelport_tensorflow::converter().convert(onnx.path(), &artifacts.saved_model, &config.convert)?;
    Ok((SavedModelDir(artifacts.saved_model.clone()), summary))
}

pub fn package_model(saved: &SavedModelDir, artifacts: &Artifacts, config: &PipelineConfig) -> PortResult<PackagedFile> {
    package(saved.path(), &artifacts.packaged, &config.package)?;
    Ok(PackagedFile(artifacts.packaged.clone()))
}

#[derive(Clone, Debug)]
pub struct Report {
    pub checkpoint: Option<CheckpointFile>,
    pub onnx: OnnxFile,
    pub saved_model: SavedModelDir,
    pub packaged: PackagedFile,
    pub export: ExportSummary,
    pub conversion: ConversionSummary,
}

/// Runs every stage on `dir`, writing the artifacts next to the checkpoint.
pub fn run(dir: impl AsRef<Path>, config: &PipelineConfig) -> PortResult<Report> {
    let artifacts = Artifacts::for_dir(dir);
    let model = stage(Stage::Load, || load_model(&artifacts, config))?;
    info!(
        "{} encoder, {} layers, {} parameters",
        model.config().model_type,
        model.config().num_hidden_layers,
        model.state_dict().num_params()
    );
    let checkpoint = if config.write_checkpoint {
        Some(stage(Stage::Checkpoint, || checkpoint(&model, &artifacts))?)
    } else {
        info!("Skipping {}", artifacts.checkpoint.display());
        None
    };
    let (onnx, export) = stage(Stage::Export, || export_graph(&model, &artifacts, config))?;
    drop(model);
    let (saved_model, conversion) = stage(Stage::Convert, || convert_graph(&onnx, &artifacts, config))?;
    let packaged = stage(Stage::Package, || package_model(&saved_model, &artifacts, config))?;
    Ok(Report { checkpoint, onnx, saved_model, packaged, export, conversion })
}
