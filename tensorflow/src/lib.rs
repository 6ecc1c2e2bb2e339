//! # modelport-tensorflow
//!
//! Turns the ONNX graphs written by `modelport-onnx` into TensorFlow
//! SavedModels: each ONNX node maps onto one or a few TensorFlow nodes,
//! weights are frozen into `Const` nodes, and a serving signature describes
//! the inputs and outputs.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use modelport_tensorflow::prelude::*;
//!
//! let summary = converter().convert("model.onnx", "saved_model", &ConvertConfig::default())?;
//! println!("{} nodes", summary.nodes);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub mod model;
pub mod ops;
pub mod saved_model;
pub mod shape;
pub mod tensor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tfpb;

pub use model::{ConvertConfig, Converter};

/// A converter knowing every supported ONNX op.
pub fn converter() -> Converter {
    let mut ops = crate::model::TfOpRegister::default();
    ops::register_all_ops(&mut ops);
    Converter { op_register: ops }
}

pub mod prelude {
    pub use crate::converter;
    pub use crate::model::{ConversionSummary, ConvertConfig, Converter};
    pub use crate::saved_model::read_saved_model;
    pub use crate::tfpb::tensorflow::SavedModel;
    pub use modelport_core::prelude::*;
}

pub(crate) mod internal {
    pub use crate::model::{ConversionContext, TfOpRegister};
    pub use crate::prelude::*;
    pub use crate::shape::{Dim, ValueFact};
    pub use crate::tfpb;
    pub use crate::tfpb::tensorflow::{AttrValue, NodeDef, TensorProto};
    pub use modelport_core::internal::*;
    pub use modelport_onnx::pb::NodeProto;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_op_has_a_builder() {
        let conv = converter();
        for op in [
            "Add", "Sub", "Mul", "Div", "Pow", "MatMul", "Gather", "Transpose", "Reshape", "ReduceMean", "Softmax",
            "Erf", "Tanh", "Sqrt", "Relu", "Identity", "Cast", "Constant", "LayerNormalization", "Gelu",
        ] {
            assert!(conv.op_register.get(op).is_some(), "{op}");
        }
        assert!(conv.op_register.get("Conv").is_none());
    }
}
