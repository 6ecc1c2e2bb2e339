//! # modelport-core
//!
//! Loads fine-tuned transformer encoders from Hugging Face style directories
//! (`config.json` + safetensors weights) and exposes their forward pass over
//! an abstract [`ops::Graph`], so the same code runs eagerly or gets recorded
//! by an exporter.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use modelport_core::prelude::*;
//!
//! let model = loader::load("fine-tuned-bert", &LoadOptions::default())?;
//! let input = SyntheticInput::default().generate()?;
//! let mut eager = Eager;
//! let input = eager.constant(input)?;
//! let outputs = model.forward(&mut eager, &input)?;
//! println!("{:?}", outputs.last_hidden_state);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

#[macro_use]
pub mod macros;

pub mod arch;
pub mod broadcast;
pub mod checkpoint;
pub mod config;
pub mod eval;
pub mod input;
pub mod loader;
pub mod model;
pub mod ops;
mod pickle;
pub mod tensor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use anyhow;
pub use ndarray;

pub type TVec<T> = smallvec::SmallVec<[T; 4]>;
pub type PortResult<T> = anyhow::Result<T>;
pub type PortError = anyhow::Error;

pub mod prelude {
    pub use crate::config::{Activation, ModelConfig};
    pub use crate::eval::Eager;
    pub use crate::input::SyntheticInput;
    pub use crate::loader::{self, LoadOptions};
    pub use crate::model::{Model, Outputs, StateDict};
    pub use crate::ops::{Graph, Op};
    pub use crate::tensor::{Datum, DatumType, Tensor};
    pub use crate::{PortError, PortResult, TVec};
    pub use crate::tvec;
}

pub mod internal {
    pub use crate::prelude::*;
    pub use anyhow::{Context, bail, ensure, format_err};
    pub use std::collections::{BTreeMap, HashMap};
    pub use std::path::{Path, PathBuf};
    pub use std::sync::Arc;
}
