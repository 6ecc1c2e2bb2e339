use serde::Deserialize;

use super::{Architecture, EncoderLayout, LayerLayout, ParamGroup};
use crate::internal::*;

#[derive(Clone, Copy, Debug, Default)]
pub struct DistilBert;

#[derive(Deserialize, Debug)]
struct DistilBertConfig {
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default = "defaults::vocab_size")]
    vocab_size: usize,
    #[serde(default = "defaults::dim")]
    dim: usize,
    #[serde(default = "defaults::n_layers")]
    n_layers: usize,
    #[serde(default = "defaults::n_heads")]
    n_heads: usize,
    #[serde(default = "defaults::hidden_dim")]
    hidden_dim: usize,
    #[serde(default = "defaults::activation")]
    activation: String,
    #[serde(default = "defaults::max_position_embeddings")]
    max_position_embeddings: usize,
}

mod defaults {
    pub fn vocab_size() -> usize {
        30522
    }
    pub fn dim() -> usize {
        768
    }
    pub fn n_layers() -> usize {
        6
    }
    pub fn n_heads() -> usize {
        12
    }
    pub fn hidden_dim() -> usize {
        3072
    }
    pub fn activation() -> String {
        "gelu".to_string()
    }
    pub fn max_position_embeddings() -> usize {
        512
    }
}

impl Architecture for DistilBert {
    fn model_type(&self) -> &'static str {
        "distilbert"
    }

    fn base_model_prefix(&self) -> &'static str {
        "distilbert"
    }

    fn parse_config(&self, json: &serde_json::Value) -> PortResult<ModelConfig> {
        let raw = DistilBertConfig::deserialize(json).context("Invalid distilbert config")?;
        let config = ModelConfig {
            model_type: self.model_type().to_string(),
            architectures: raw.architectures,
            vocab_size: raw.vocab_size,
            hidden_size: raw.dim,
            num_hidden_layers: raw.n_layers,
            num_attention_heads: raw.n_heads,
            intermediate_size: raw.hidden_dim,
            hidden_act: raw.activation.parse()?,
            max_position_embeddings: raw.max_position_embeddings,
            type_vocab_size: 0,
            layer_norm_eps: 1e-12,
        };
        config.validate()?;
        Ok(config)
    }

    fn layout(&self, config: &ModelConfig) -> EncoderLayout {
        let layers = (0..config.num_hidden_layers)
            .map(|ix| {
                let p = format!("transformer.layer.{ix}");
                LayerLayout {
                    scope: format!("transformer/layer.{ix}"),
                    query: ParamGroup::new(format!("{p}.attention.q_lin")),
                    key: ParamGroup::new(format!("{p}.attention.k_lin")),
                    value: ParamGroup::new(format!("{p}.attention.v_lin")),
                    attention_output: ParamGroup::new(format!("{p}.attention.out_lin")),
                    attention_norm: ParamGroup::new(format!("{p}.sa_layer_norm")),
                    intermediate: ParamGroup::new(format!("{p}.ffn.lin1")),
                    output: ParamGroup::new(format!("{p}.ffn.lin2")),
                    output_norm: ParamGroup::new(format!("{p}.output_layer_norm")),
                }
            })
            .collect();
        EncoderLayout {
            word_embeddings: "embeddings.word_embeddings.weight".to_string(),
            position_embeddings: "embeddings.position_embeddings.weight".to_string(),
            token_type_embeddings: None,
            embeddings_norm: ParamGroup::new("embeddings.LayerNorm".to_string()),
            layers,
            pooler: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_names_are_mapped() {
        let json = json!({
            "model_type": "distilbert", "dim": 32, "n_layers": 2, "n_heads": 4,
            "hidden_dim": 64, "activation": "relu"
        });
        let config = DistilBert.parse_config(&json).unwrap();
        assert_eq!(config.hidden_size, 32);
        assert_eq!(config.intermediate_size, 64);
        assert_eq!(config.hidden_act, Activation::Relu);
        let layout = DistilBert.layout(&config);
        assert!(layout.pooler.is_none());
        assert_eq!(layout.parameters(&config).len(), 4 + 16 * 2);
    }
}
