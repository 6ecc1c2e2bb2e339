//! Tiny random checkpoints, for tests of this crate and its dependents.
use std::collections::BTreeMap as Map;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use safetensors::Dtype;
use safetensors::tensor::TensorView;

use crate::arch::ArchitectureRegistry;
use crate::internal::*;
use crate::loader::build_model;

pub fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("MODELPORT_LOG").is_test(true).try_init();
}

/// Builder for a small randomly initialized encoder checkpoint.
#[derive(Clone, Debug)]
pub struct TinyEncoder {
    model_type: &'static str,
    vocab_size: usize,
    hidden_size: usize,
    num_layers: usize,
    num_heads: usize,
    intermediate_size: usize,
    max_position_embeddings: usize,
    activation: &'static str,
    seed: u64,
    pooler: bool,
    prefixed: bool,
    legacy_norm_names: bool,
    classifier: bool,
    half: bool,
    shards: usize,
    auto_map: bool,
    dropped: Vec<String>,
}

impl TinyEncoder {
    pub fn bert() -> TinyEncoder {
        TinyEncoder {
            model_type: "bert",
            vocab_size: 30522,
            hidden_size: 32,
            num_layers: 2,
            num_heads: 4,
            intermediate_size: 64,
            max_position_embeddings: 512,
            activation: "gelu",
            seed: 42,
            pooler: true,
            prefixed: false,
            legacy_norm_names: false,
            classifier: false,
            half: false,
            shards: 1,
            auto_map: false,
            dropped: vec![],
        }
    }

    pub fn distilbert() -> TinyEncoder {
        TinyEncoder { model_type: "distilbert", pooler: false, ..TinyEncoder::bert() }
    }

    pub fn vocab_size(self, vocab_size: usize) -> TinyEncoder {
        TinyEncoder { vocab_size, ..self }
    }

    pub fn max_position_embeddings(self, max_position_embeddings: usize) -> TinyEncoder {
        TinyEncoder { max_position_embeddings, ..self }
    }

    pub fn activation(self, activation: &'static str) -> TinyEncoder {
        TinyEncoder { activation, ..self }
    }

    pub fn seed(self, seed: u64) -> TinyEncoder {
        TinyEncoder { seed, ..self }
    }

    pub fn without_pooler(self) -> TinyEncoder {
        TinyEncoder { pooler: false, ..self }
    }

    /// Stores weights the way task heads do, under the base model prefix.
    pub fn prefixed(self) -> TinyEncoder {
        TinyEncoder { prefixed: true, ..self }
    }

    /// Names norm parameters `gamma` and `beta`.
    pub fn legacy_norm_names(self) -> TinyEncoder {
        TinyEncoder { legacy_norm_names: true, ..self }
    }

    /// Adds a sequence classification head.
    pub fn with_classifier(self) -> TinyEncoder {
        TinyEncoder { classifier: true, ..self }
    }

    /// Stores weights as f16.
    pub fn half(self) -> TinyEncoder {
        TinyEncoder { half: true, ..self }
    }

    pub fn shards(self, shards: usize) -> TinyEncoder {
        TinyEncoder { shards: shards.max(1), ..self }
    }

    pub fn with_auto_map(self) -> TinyEncoder {
        TinyEncoder { auto_map: true, ..self }
    }

    pub fn drop_param(mut self, name: &str) -> TinyEncoder {
        self.dropped.push(name.to_string());
        self
    }

    pub fn config_json(&self) -> serde_json::Value {
        let mut json = if self.model_type == "distilbert" {
            serde_json::json!({
                "architectures": ["DistilBertForSequenceClassification"],
                "model_type": "distilbert",
                "vocab_size": self.vocab_size,
                "dim": self.hidden_size,
                "n_layers": self.num_layers,
                "n_heads": self.num_heads,
                "hidden_dim": self.intermediate_size,
                "activation": self.activation,
                "max_position_embeddings": self.max_position_embeddings,
            })
        } else {
            serde_json::json!({
                "architectures": ["BertForSequenceClassification"],
                "model_type": self.model_type,
                "vocab_size": self.vocab_size,
                "hidden_size": self.hidden_size,
                "num_hidden_layers": self.num_layers,
                "num_attention_heads": self.num_heads,
                "intermediate_size": self.intermediate_size,
                "hidden_act": self.activation,
                "max_position_embeddings": self.max_position_embeddings,
                "type_vocab_size": 2,
                "layer_norm_eps": 1e-12,
            })
        };
        if self.auto_map {
            json["auto_map"] = serde_json::json!({ "AutoModel": "modeling_custom.CustomModel" });
        }
        json
    }

    /// Checkpoint tensors, named as they would be stored on disk.
    pub fn tensors(&self) -> PortResult<Vec<(String, Tensor)>> {
        let json = self.config_json();
        let registry = ArchitectureRegistry::default();
        let arch = registry.resolve(&json)?;
        let config = arch.parse_config(&json)?;
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut tensors = vec![];
        for spec in arch.layout(&config).parameters(&config) {
            if (spec.optional && !self.pooler) || self.dropped.contains(&spec.name) {
                continue;
            }
            let len: usize = spec.shape.iter().product();
            let is_norm = spec.name.contains("LayerNorm") || spec.name.contains("layer_norm");
            let data: Vec<f32> = if is_norm && spec.name.ends_with(".weight") {
                (0..len).map(|_| 1.0 + rng.gen_range(-0.1f32..0.1)).collect()
            } else if spec.shape.len() == 1 {
                (0..len).map(|_| rng.gen_range(-0.02f32..0.02)).collect()
            } else {
                (0..len).map(|_| rng.gen_range(-0.1f32..0.1)).collect()
            };
            let mut name = spec.name.clone();
            if self.legacy_norm_names && is_norm {
                name = name.replace(".weight", ".gamma").replace(".bias", ".beta");
            }
            if self.prefixed {
                name = format!("{}.{}", arch.base_model_prefix(), name);
            }
            tensors.push((name, Tensor::from_shape(&spec.shape, data)?));
        }
        if self.classifier {
            let h = config.hidden_size;
            let w: Vec<f32> = (0..2 * h).map(|_| rng.gen_range(-0.1f32..0.1)).collect();
            tensors.push(("classifier.weight".to_string(), Tensor::from_shape(&[2, h], w)?));
            tensors.push(("classifier.bias".to_string(), Tensor::from_shape(&[2], vec![0f32; 2])?));
        }
        Ok(tensors)
    }

    pub fn build(&self) -> PortResult<Model> {
        let json = self.config_json();
        let registry = ArchitectureRegistry::default();
        let arch = registry.resolve(&json)?;
        let config = arch.parse_config(&json)?;
        let tensors = self
            .tensors()?
            .into_iter()
            .map(|(name, t)| -> PortResult<_> {
                // same precision loss as a round trip through the file
                let t = if self.half {
                    let widened: Vec<f32> = to_f16(&t)?.into_iter().map(|h| h.to_f32()).collect();
                    Tensor::from_shape(t.shape(), widened)?
                } else {
                    t
                };
                Ok((name, t))
            })
            .collect::<PortResult<Vec<_>>>()?;
        build_model(arch, config, tensors)
    }

    pub fn write_config(&self, dir: &Path) -> PortResult<()> {
        fs_err::create_dir_all(dir)?;
        fs_err::write(dir.join("config.json"), serde_json::to_string_pretty(&self.config_json())?)?;
        Ok(())
    }

    /// Writes `config.json` and the safetensors weights into `dir`.
    pub fn write(&self, dir: &Path) -> PortResult<()> {
        self.write_config(dir)?;
        let tensors = self.tensors()?;
        let per_shard = tensors.len().div_ceil(self.shards);
        let mut weight_map = Map::new();
        for (ix, chunk) in tensors.chunks(per_shard.max(1)).enumerate() {
            let file = if self.shards == 1 {
                "model.safetensors".to_string()
            } else {
                format!("model-{:05}-of-{:05}.safetensors", ix + 1, self.shards)
            };
            let buffers = chunk
                .iter()
                .map(|(name, t)| -> PortResult<_> {
                    let bytes = if self.half {
                        to_f16(t)?.iter().flat_map(|h| h.to_bits().to_le_bytes()).collect()
                    } else {
                        t.to_le_bytes()?
                    };
                    Ok((name.clone(), t.shape().to_vec(), bytes))
                })
                .collect::<PortResult<Vec<_>>>()?;
            let dtype = if self.half { Dtype::F16 } else { Dtype::F32 };
            let views = buffers
                .iter()
                .map(|(name, shape, bytes)| Ok((name.clone(), TensorView::new(dtype, shape.clone(), bytes)?)))
                .collect::<PortResult<Vec<_>>>()?;
            let serialized = safetensors::serialize(views, &None)?;
            fs_err::write(dir.join(&file), serialized)?;
            for (name, _) in chunk {
                weight_map.insert(name.clone(), file.clone());
            }
        }
        if self.shards > 1 {
            let index = serde_json::json!({ "metadata": {}, "weight_map": weight_map });
            fs_err::write(dir.join("model.safetensors.index.json"), serde_json::to_string_pretty(&index)?)?;
        }
        Ok(())
    }
}

fn to_f16(t: &Tensor) -> PortResult<Vec<half::f16>> {
    Ok(t.as_slice::<f32>()?.iter().map(|&f| half::f16::from_f32(f)).collect())
}
