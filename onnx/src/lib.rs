//! # modelport-onnx
//!
//! Records the forward pass of a [`modelport_core::Model`] into an ONNX
//! graph, the way `torch.onnx.export` traces a module: the model runs on a
//! sample input while every op is written down as a node.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use modelport_core::prelude::*;
//! use modelport_onnx::export::{ExportConfig, export};
//!
//! let model = loader::load("fine-tuned-bert", &LoadOptions::default())?;
//! let summary = export(&model, &SyntheticInput::default(), &ExportConfig::default(), "model.onnx")?;
//! println!("{} nodes", summary.nodes);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod export;
pub mod model;
pub mod pb_helpers;
pub mod tensor;
pub mod tracer;

pub mod pb {
    include!("prost/onnx.rs");
}

pub use self::export::{ExportConfig, ExportSummary, export};
pub use self::model::{model_for_path, write_model};

pub mod prelude {
    pub use crate::export::{ExportConfig, ExportSummary};
    pub use crate::pb::ModelProto;
    pub use modelport_core::prelude::*;
}

pub(crate) mod internal {
    pub use crate::pb::*;
    pub use crate::prelude::*;
    pub use modelport_core::internal::*;
}
