//! Loading Hugging Face style checkpoint directories.
use byteorder::{ByteOrder, LittleEndian};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::arch::{Architecture, ArchitectureRegistry};
use crate::config::read_config_json;
use crate::internal::*;

#[derive(Clone, Debug)]
pub struct LoadOptions {
    /// Accept checkpoints declaring custom modeling code (`auto_map`).
    pub trust_remote_code: bool,
}

impl Default for LoadOptions {
    fn default() -> LoadOptions {
        LoadOptions { trust_remote_code: true }
    }
}

pub fn load(dir: impl AsRef<Path>, options: &LoadOptions) -> PortResult<Model> {
    load_with_registry(dir, options, &ArchitectureRegistry::default())
}

pub fn load_with_registry(
    dir: impl AsRef<Path>,
    options: &LoadOptions,
    registry: &ArchitectureRegistry,
) -> PortResult<Model> {
    let dir = dir.as_ref();
    info!("Loading checkpoint from {}", dir.display());
    ensure!(dir.is_dir(), "{} is not a directory", dir.display());
    let json = read_config_json(dir)?;

    if let Some(auto_map) = json.get("auto_map") {
        ensure!(
            options.trust_remote_code,
            "{} declares custom modeling code (auto_map: {auto_map}); refusing without trust_remote_code",
            dir.display()
        );
        warn!("Checkpoint declares custom modeling code ({auto_map}), using the built-in implementation of its model_type");
    }

    let arch = registry.resolve(&json)?;
    let config = arch.parse_config(&json)?;
    debug!("{config:?}");

    let files = weight_files(dir)?;
    let mut raw = vec![];
    for file in &files {
        raw.extend(read_safetensors(file)?);
    }
    build_model(arch, config, raw)
}

/// Matches checkpoint tensors with the architecture's parameters.
pub fn build_model(
    arch: &dyn Architecture,
    config: ModelConfig,
    tensors: Vec<(String, Tensor)>,
) -> PortResult<Model> {
    let prefix = format!("{}.", arch.base_model_prefix());
    let mut found: HashMap<String, Tensor> = HashMap::new();
    for (key, tensor) in tensors {
        let name = arch.rename_key(key.strip_prefix(&prefix).unwrap_or(&key));
        if found.insert(name.clone(), tensor).is_some() {
            bail!("Parameter {name} appears twice in the checkpoint");
        }
    }

    let mut layout = arch.layout(&config);
    let specs = layout.parameters(&config);
    if specs.iter().any(|s| s.optional && !found.contains_key(&s.name)) {
        info!("No pooler weights in checkpoint, pooler output disabled");
        layout.pooler = None;
    }

    let mut state_dict = StateDict::default();
    for spec in layout.parameters(&config) {
        let tensor = found
            .remove(&spec.name)
            .with_context(|| format!("Checkpoint is missing parameter {}", spec.name))?;
        ensure!(
            tensor.datum_type() == DatumType::F32,
            "Parameter {} should be a float tensor, found {:?}",
            spec.name,
            tensor.datum_type()
        );
        ensure!(
            tensor.shape() == &*spec.shape,
            "Parameter {} has shape {:?}, expected {:?}",
            spec.name,
            tensor.shape(),
            spec.shape
        );
        trace!("{} {:?}", spec.name, tensor);
        state_dict.insert(spec.name, Arc::new(tensor));
    }

    let mut unused: Vec<&String> = found.keys().collect();
    unused.sort();
    for key in unused {
        info!("Ignoring checkpoint tensor {key}");
    }
    info!(
        "Loaded {} encoder: {} layers, hidden size {}, {} parameters",
        config.model_type,
        config.num_hidden_layers,
        config.hidden_size,
        state_dict.num_params()
    );
    Ok(Model::new(config, layout, state_dict))
}

/// Safetensors files of a checkpoint directory: the shards named by
/// `model.safetensors.index.json` if present, every `*.safetensors` otherwise.
pub fn weight_files(dir: &Path) -> PortResult<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    let mut files = if index_path.exists() {
        let index: serde_json::Value = serde_json::from_str(&fs_err::read_to_string(&index_path)?)
            .with_context(|| format!("Parsing {}", index_path.display()))?;
        let map = index
            .get("weight_map")
            .and_then(|m| m.as_object())
            .with_context(|| format!("{} has no weight_map", index_path.display()))?;
        let mut files = map
            .values()
            .map(|f| {
                f.as_str()
                    .map(|f| dir.join(f))
                    .with_context(|| format!("Invalid shard name {f} in {}", index_path.display()))
            })
            .collect::<PortResult<Vec<_>>>()?;
        files.dedup();
        files
    } else {
        let mut files = vec![];
        for entry in fs_err::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
                files.push(path);
            }
        }
        files
    };
    files.sort();
    files.dedup();
    ensure!(!files.is_empty(), "No safetensors weights found in {}", dir.display());
    debug!("Weight files: {files:?}");
    Ok(files)
}

pub fn read_safetensors(path: &Path) -> PortResult<Vec<(String, Tensor)>> {
    debug!("Reading {}", path.display());
    let file = fs_err::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(file.file()) }
        .with_context(|| format!("Memory-mapping {}", path.display()))?;
    let st = SafeTensors::deserialize(&mmap).with_context(|| format!("Parsing {}", path.display()))?;
    let mut tensors = vec![];
    for (name, view) in st.tensors() {
        let tensor =
            convert_view(&view).with_context(|| format!("Reading tensor {name} from {}", path.display()))?;
        tensors.push((name, tensor));
    }
    Ok(tensors)
}

fn convert_view(view: &TensorView) -> PortResult<Tensor> {
    let shape = view.shape();
    let data = view.data();
    let len: usize = shape.iter().product();
    let expect = |size: usize| -> PortResult<()> {
        ensure!(data.len() == len * size, "Tensor buffer has {} bytes, expected {}", data.len(), len * size);
        Ok(())
    };
    match view.dtype() {
        Dtype::F32 => Tensor::from_le_bytes(DatumType::F32, shape, data),
        Dtype::F64 => {
            expect(8)?;
            let mut v = vec![0f64; len];
            LittleEndian::read_f64_into(data, &mut v);
            Tensor::from_shape(shape, v.into_iter().map(|x| x as f32).collect::<Vec<f32>>())
        }
        Dtype::F16 | Dtype::BF16 => {
            expect(2)?;
            let mut bits = vec![0u16; len];
            LittleEndian::read_u16_into(data, &mut bits);
            let floats: Vec<f32> = if view.dtype() == Dtype::F16 {
                bits.into_iter().map(|b| half::f16::from_bits(b).to_f32()).collect()
            } else {
                bits.into_iter().map(|b| half::bf16::from_bits(b).to_f32()).collect()
            };
            Tensor::from_shape(shape, floats)
        }
        Dtype::I64 => Tensor::from_le_bytes(DatumType::I64, shape, data),
        Dtype::I32 => {
            expect(4)?;
            let mut v = vec![0i32; len];
            LittleEndian::read_i32_into(data, &mut v);
            Tensor::from_shape(shape, v.into_iter().map(|x| x as i64).collect::<Vec<i64>>())
        }
        dt => bail!("Unsupported dtype {dt:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TinyEncoder, setup_test_logger};

    #[test]
    fn load_tiny_bert() {
        setup_test_logger();
        let dir = tempfile::tempdir().unwrap();
        TinyEncoder::bert().write(dir.path()).unwrap();
        let model = load(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(model.config().model_type, "bert");
        assert!(model.has_pooler());
        assert_eq!(model.state_dict().len(), 5 + 16 * 2 + 2);
    }

    #[test]
    fn prefixed_legacy_checkpoint() {
        setup_test_logger();
        let dir = tempfile::tempdir().unwrap();
        TinyEncoder::bert()
            .prefixed()
            .legacy_norm_names()
            .with_classifier()
            .without_pooler()
            .write(dir.path())
            .unwrap();
        let model = load(dir.path(), &LoadOptions::default()).unwrap();
        assert!(!model.has_pooler());
        assert!(model.state_dict().contains("embeddings.LayerNorm.weight"));
        assert!(!model.state_dict().contains("classifier.weight"));
    }

    #[test]
    fn sharded_checkpoint() {
        setup_test_logger();
        let dir = tempfile::tempdir().unwrap();
        TinyEncoder::distilbert().shards(3).write(dir.path()).unwrap();
        assert_eq!(weight_files(dir.path()).unwrap().len(), 3);
        let model = load(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(model.config().model_type, "distilbert");
    }

    #[test]
    fn half_precision_weights() {
        setup_test_logger();
        let dir = tempfile::tempdir().unwrap();
        TinyEncoder::bert().half().write(dir.path()).unwrap();
        let model = load(dir.path(), &LoadOptions::default()).unwrap();
        let w = model.state_dict().get("embeddings.word_embeddings.weight").unwrap();
        assert_eq!(w.datum_type(), DatumType::F32);
    }

    #[test]
    fn missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        TinyEncoder::bert().write_config(dir.path()).unwrap();
        let err = load(dir.path(), &LoadOptions::default()).unwrap_err();
        assert!(format!("{err:?}").contains("No safetensors weights"));
    }

    #[test]
    fn missing_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), &LoadOptions::default()).is_err());
    }

    #[test]
    fn missing_parameter_is_named() {
        let dir = tempfile::tempdir().unwrap();
        TinyEncoder::bert().drop_param("encoder.layer.1.output.dense.bias").write(dir.path()).unwrap();
        let err = load(dir.path(), &LoadOptions::default()).unwrap_err();
        assert!(format!("{err:?}").contains("encoder.layer.1.output.dense.bias"));
    }

    #[test]
    fn remote_code_needs_trust() {
        let dir = tempfile::tempdir().unwrap();
        TinyEncoder::bert().with_auto_map().write(dir.path()).unwrap();
        assert!(load(dir.path(), &LoadOptions { trust_remote_code: false }).is_err());
        assert!(load(dir.path(), &LoadOptions { trust_remote_code: true }).is_ok());
    }
}
