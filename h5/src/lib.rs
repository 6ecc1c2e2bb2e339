//! # modelport-h5
//!
//! Packages a frozen TensorFlow SavedModel into a single HDF5 file: the
//! graph architecture as a JSON `model_config`, the weights as datasets
//! under `model_weights/`, the serving signature as a root attribute.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use modelport_h5::prelude::*;
//!
//! let model = package("saved_model", "model.h5", &PackageConfig::default())?;
//! println!("{} weights", model.weights.len());
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub mod bundle;
pub mod dtype;
pub mod hdf5;
pub mod package;

pub use package::{PackageConfig, PackagedModel, package};

pub mod prelude {
    pub use crate::bundle::{SavedModelBundle, Signature, TensorSpec};
    pub use crate::package::{PACKAGED_FILENAME, PackageConfig, PackagedModel, package};
    pub use modelport_core::prelude::*;
}

pub(crate) mod internal {
    pub use crate::prelude::*;
    pub use modelport_core::internal::*;
    pub use serde::{Deserialize, Serialize};
}
