use prost::Message;

use crate::internal::*;

/// Protobuf messages can not exceed 2GiB.
pub const PROTOBUF_SIZE_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

pub fn model_for_path(p: impl AsRef<Path>) -> PortResult<ModelProto> {
    let p = p.as_ref();
    let bytes = fs_err::read(p)?;
    ModelProto::decode(&*bytes).with_context(|| format!("Can not parse protobuf in {}", p.display()))
}

pub fn write_model(model: &ModelProto, p: impl AsRef<Path>) -> PortResult<u64> {
    let p = p.as_ref();
    let len = model.encoded_len() as u64;
    ensure!(
        len < PROTOBUF_SIZE_LIMIT,
        "Serialized model is {len} bytes, over the 2GiB protobuf limit"
    );
    fs_err::write(p, model.encode_to_vec())?;
    debug!("Wrote {} ({len} bytes)", p.display());
    Ok(len)
}

/// Version of the default-domain operator set the model imports.
pub fn default_opset(model: &ModelProto) -> Option<i64> {
    model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
}

/// IR version matching an opset, as the ONNX release introducing the opset.
pub fn ir_version_for_opset(opset: i64) -> PortResult<i64> {
    Ok(match opset {
        14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => bail!("No IR version known for opset {opset}"),
    })
}
