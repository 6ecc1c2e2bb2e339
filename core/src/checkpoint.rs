//! Writes state dicts as torch zip checkpoints (`torch.save` format).
use std::io::Write;

use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::internal::*;
use crate::pickle::{OpCode, Pickler};

fn storage_class(dt: DatumType) -> &'static str {
    match dt {
        DatumType::F32 => "FloatStorage",
        DatumType::I64 => "LongStorage",
    }
}

/// The `data.pkl` record: an `OrderedDict` of `_rebuild_tensor_v2` calls,
/// each tensor storage referenced by its index.
pub fn state_dict_pickle(state_dict: &StateDict) -> Vec<u8> {
    let mut p = Pickler::new();
    p.global("collections", "OrderedDict").op(OpCode::EmptyTuple).op(OpCode::Reduce);
    p.op(OpCode::Mark);
    for (key, (name, tensor)) in state_dict.iter().enumerate() {
        p.string(name);
        p.global("torch._utils", "_rebuild_tensor_v2");
        p.op(OpCode::Mark);
        {
            p.op(OpCode::Mark);
            p.string("storage")
                .global("torch", storage_class(tensor.datum_type()))
                .string(&key.to_string())
                .string("cpu")
                .int(tensor.len() as i64);
            p.op(OpCode::Tuple).op(OpCode::BinPersId);
        }
        p.int(0);
        p.int_tuple(tensor.shape());
        p.int_tuple(&tensor.strides());
        p.op(OpCode::NewFalse);
        p.global("collections", "OrderedDict").op(OpCode::EmptyTuple).op(OpCode::Reduce);
        p.op(OpCode::Tuple).op(OpCode::Reduce);
    }
    p.op(OpCode::SetItems);
    p.finish()
}

/// Writes `state_dict` to `path` as a torch zip archive. Records are named
/// after the file stem, as `torch.save` does.
pub fn write_checkpoint(state_dict: &StateDict, path: impl AsRef<Path>) -> PortResult<PathBuf> {
    let path = path.as_ref();
    info!("Writing checkpoint {} ({} tensors)", path.display(), state_dict.len());
    let prefix = path.file_stem().and_then(|s| s.to_str()).unwrap_or("archive");
    let file = fs_err::File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let record = |zip: &mut ZipWriter<fs_err::File>, name: String, bytes: &[u8]| -> PortResult<()> {
        let options = options.clone().large_file(bytes.len() as u64 >= u32::MAX as u64);
        zip.start_file(name.as_str(), options).with_context(|| format!("Starting record {name}"))?;
        zip.write_all(bytes).with_context(|| format!("Writing record {name}"))?;
        Ok(())
    };

    record(&mut zip, format!("{prefix}/data.pkl"), &state_dict_pickle(state_dict))?;
    record(&mut zip, format!("{prefix}/byteorder"), b"little")?;
    for (key, (name, tensor)) in state_dict.iter().enumerate() {
        trace!("storage {key}: {name} {tensor:?}");
        record(&mut zip, format!("{prefix}/data/{key}"), &tensor.to_le_bytes()?)?;
    }
    record(&mut zip, format!("{prefix}/version"), b"3\n")?;
    zip.finish().with_context(|| format!("Finalizing {}", path.display()))?;
    Ok(path.to_path_buf())
}
