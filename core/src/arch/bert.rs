use serde::Deserialize;

use super::{Architecture, EncoderLayout, LayerLayout, ParamGroup};
use crate::internal::*;

#[derive(Clone, Copy, Debug, Default)]
pub struct Bert;

#[derive(Deserialize, Debug)]
struct BertConfig {
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default = "defaults::vocab_size")]
    vocab_size: usize,
    #[serde(default = "defaults::hidden_size")]
    hidden_size: usize,
    #[serde(default = "defaults::num_layers")]
    num_hidden_layers: usize,
    #[serde(default = "defaults::num_heads")]
    num_attention_heads: usize,
    #[serde(default = "defaults::intermediate_size")]
    intermediate_size: usize,
    #[serde(default = "defaults::hidden_act")]
    hidden_act: String,
    #[serde(default = "defaults::max_position_embeddings")]
    max_position_embeddings: usize,
    #[serde(default = "defaults::type_vocab_size")]
    type_vocab_size: usize,
    #[serde(default = "defaults::layer_norm_eps")]
    layer_norm_eps: f32,
    #[serde(default)]
    position_embedding_type: Option<String>,
}

mod defaults {
    pub fn vocab_size() -> usize {
        30522
    }
    pub fn hidden_size() -> usize {
        768
    }
    pub fn num_layers() -> usize {
        12
    }
    pub fn num_heads() -> usize {
        12
    }
    pub fn intermediate_size() -> usize {
        3072
    }
    pub fn hidden_act() -> String {
        "gelu".to_string()
    }
    pub fn max_position_embeddings() -> usize {
        512
    }
    pub fn type_vocab_size() -> usize {
        2
    }
    pub fn layer_norm_eps() -> f32 {
        1e-12
    }
}

impl Architecture for Bert {
    fn model_type(&self) -> &'static str {
        "bert"
    }

    fn base_model_prefix(&self) -> &'static str {
        "bert"
    }

    fn parse_config(&self, json: &serde_json::Value) -> PortResult<ModelConfig> {
        let raw = BertConfig::deserialize(json).context("Invalid bert config")?;
        if let Some(pet) = &raw.position_embedding_type {
            ensure!(pet == "absolute", "Unsupported position_embedding_type {pet:?}");
        }
        let config = ModelConfig {
            model_type: self.model_type().to_string(),
            architectures: raw.architectures,
            vocab_size: raw.vocab_size,
            hidden_size: raw.hidden_size,
            num_hidden_layers: raw.num_hidden_layers,
            num_attention_heads: raw.num_attention_heads,
            intermediate_size: raw.intermediate_size,
            hidden_act: raw.hidden_act.parse()?,
            max_position_embeddings: raw.max_position_embeddings,
            type_vocab_size: raw.type_vocab_size,
            layer_norm_eps: raw.layer_norm_eps,
        };
        config.validate()?;
        Ok(config)
    }

    fn layout(&self, config: &ModelConfig) -> EncoderLayout {
        let layers = (0..config.num_hidden_layers)
            .map(|ix| {
                let p = format!("encoder.layer.{ix}");
                LayerLayout {
                    scope: format!("encoder/layer.{ix}"),
                    query: ParamGroup::new(format!("{p}.attention.self.query")),
                    key: ParamGroup::new(format!("{p}.attention.self.key")),
                    value: ParamGroup::new(format!("{p}.attention.self.value")),
                    attention_output: ParamGroup::new(format!("{p}.attention.output.dense")),
                    attention_norm: ParamGroup::new(format!("{p}.attention.output.LayerNorm")),
                    intermediate: ParamGroup::new(format!("{p}.intermediate.dense")),
                    output: ParamGroup::new(format!("{p}.output.dense")),
                    output_norm: ParamGroup::new(format!("{p}.output.LayerNorm")),
                }
            })
            .collect();
        EncoderLayout {
            word_embeddings: "embeddings.word_embeddings.weight".to_string(),
            position_embeddings: "embeddings.position_embeddings.weight".to_string(),
            token_type_embeddings: (config.type_vocab_size > 0)
                .then(|| "embeddings.token_type_embeddings.weight".to_string()),
            embeddings_norm: ParamGroup::new("embeddings.LayerNorm".to_string()),
            layers,
            pooler: Some(ParamGroup::new("pooler.dense".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_bert_base() {
        let config = Bert.parse_config(&json!({"model_type": "bert"})).unwrap();
        assert_eq!(config.vocab_size, 30522);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.hidden_act, Activation::Gelu);
        let layout = Bert.layout(&config);
        // 5 embedding tensors, 16 per layer, 2 for the pooler
        assert_eq!(layout.parameters(&config).len(), 5 + 16 * 12 + 2);
    }

    #[test]
    fn relative_positions_are_refused() {
        let json = json!({"model_type": "bert", "position_embedding_type": "relative_key"});
        assert!(Bert.parse_config(&json).is_err());
    }
}
