//! Supported encoder families and how their checkpoints are named.
use std::fmt;

use crate::internal::*;

pub mod bert;
pub mod distilbert;

/// A `weight` + `bias` pair living under a common module path, like
/// `encoder.layer.0.attention.self.query`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, new)]
pub struct ParamGroup {
    pub path: String,
}

impl ParamGroup {
    pub fn weight(&self) -> String {
        format!("{}.weight", self.path)
    }

    pub fn bias(&self) -> String {
        format!("{}.bias", self.path)
    }

    /// Last component of the module path, used to scope traced nodes.
    pub fn name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerLayout {
    /// Trace scope, slash separated (`encoder/layer.3`).
    pub scope: String,
    pub query: ParamGroup,
    pub key: ParamGroup,
    pub value: ParamGroup,
    pub attention_output: ParamGroup,
    pub attention_norm: ParamGroup,
    pub intermediate: ParamGroup,
    pub output: ParamGroup,
    pub output_norm: ParamGroup,
}

/// Parameter names of a post layer-norm transformer encoder.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderLayout {
    pub word_embeddings: String,
    pub position_embeddings: String,
    pub token_type_embeddings: Option<String>,
    pub embeddings_norm: ParamGroup,
    pub layers: Vec<LayerLayout>,
    pub pooler: Option<ParamGroup>,
}

#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct ParamSpec {
    pub name: String,
    pub shape: TVec<usize>,
    pub optional: bool,
}

impl EncoderLayout {
    /// Every parameter with its expected shape, in module order.
    pub fn parameters(&self, config: &ModelConfig) -> Vec<ParamSpec> {
        let h = config.hidden_size;
        let mut specs = vec![];
        let linear = |specs: &mut Vec<ParamSpec>, g: &ParamGroup, out: usize, inp: usize, optional: bool| {
            specs.push(ParamSpec::new(g.weight(), tvec!(out, inp), optional));
            specs.push(ParamSpec::new(g.bias(), tvec!(out), optional));
        };
        let norm = |specs: &mut Vec<ParamSpec>, g: &ParamGroup| {
            specs.push(ParamSpec::new(g.weight(), tvec!(h), false));
            specs.push(ParamSpec::new(g.bias(), tvec!(h), false));
        };
        specs.push(ParamSpec::new(self.word_embeddings.clone(), tvec!(config.vocab_size, h), false));
        specs.push(ParamSpec::new(
            self.position_embeddings.clone(),
            tvec!(config.max_position_embeddings, h),
            false,
        ));
        if let Some(tt) = &self.token_type_embeddings {
            specs.push(ParamSpec::new(tt.clone(), tvec!(config.type_vocab_size, h), false));
        }
        norm(&mut specs, &self.embeddings_norm);
        for layer in &self.layers {
            linear(&mut specs, &layer.query, h, h, false);
            linear(&mut specs, &layer.key, h, h, false);
            linear(&mut specs, &layer.value, h, h, false);
            linear(&mut specs, &layer.attention_output, h, h, false);
            norm(&mut specs, &layer.attention_norm);
            linear(&mut specs, &layer.intermediate, config.intermediate_size, h, false);
            linear(&mut specs, &layer.output, h, config.intermediate_size, false);
            norm(&mut specs, &layer.output_norm);
        }
        if let Some(pooler) = &self.pooler {
            linear(&mut specs, pooler, h, h, true);
        }
        specs
    }
}

pub trait Architecture: Send + Sync + fmt::Debug {
    /// `model_type` value of `config.json`.
    fn model_type(&self) -> &'static str;

    /// Prefix task-specific checkpoints put in front of the encoder weights.
    fn base_model_prefix(&self) -> &'static str;

    fn parse_config(&self, json: &serde_json::Value) -> PortResult<ModelConfig>;

    fn layout(&self, config: &ModelConfig) -> EncoderLayout;

    /// Canonical name of a checkpoint key, once the base model prefix is
    /// stripped.
    fn rename_key(&self, key: &str) -> String {
        if let Some(stem) = key.strip_suffix(".gamma") {
            format!("{stem}.weight")
        } else if let Some(stem) = key.strip_suffix(".beta") {
            format!("{stem}.bias")
        } else {
            key.to_string()
        }
    }
}

#[derive(Debug)]
pub struct ArchitectureRegistry {
    archs: Vec<Box<dyn Architecture>>,
}

impl Default for ArchitectureRegistry {
    fn default() -> ArchitectureRegistry {
        let mut reg = ArchitectureRegistry { archs: vec![] };
        reg.register(Box::new(bert::Bert));
        reg.register(Box::new(distilbert::DistilBert));
        reg
    }
}

impl ArchitectureRegistry {
    pub fn register(&mut self, arch: Box<dyn Architecture>) {
        self.archs.retain(|a| a.model_type() != arch.model_type());
        self.archs.push(arch);
    }

    pub fn get(&self, model_type: &str) -> Option<&dyn Architecture> {
        self.archs.iter().find(|a| a.model_type() == model_type).map(|a| &**a)
    }

    /// Finds the architecture for a `config.json`, by `model_type` or,
    /// failing that, by the first declared `architectures` class name.
    pub fn resolve(&self, json: &serde_json::Value) -> PortResult<&dyn Architecture> {
        if let Some(model_type) = json.get("model_type").and_then(|v| v.as_str()) {
            return self
                .get(model_type)
                .with_context(|| format!("Unknown architecture: model_type {model_type:?}"));
        }
        let class = json
            .get("architectures")
            .and_then(|a| a.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.as_str())
            .context("Unknown architecture: config.json has neither model_type nor architectures")?;
        let lowered = class.to_lowercase();
        self.archs
            .iter()
            .filter(|a| lowered.starts_with(a.model_type()))
            .max_by_key(|a| a.model_type().len())
            .map(|a| &**a)
            .with_context(|| format!("Unknown architecture: {class}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_by_model_type() {
        let reg = ArchitectureRegistry::default();
        assert_eq!(reg.resolve(&json!({"model_type": "bert"})).unwrap().model_type(), "bert");
        assert!(reg.resolve(&json!({"model_type": "gpt2"})).is_err());
    }

    #[test]
    fn resolve_by_class_name() {
        let reg = ArchitectureRegistry::default();
        let json = json!({"architectures": ["DistilBertForSequenceClassification"]});
        assert_eq!(reg.resolve(&json).unwrap().model_type(), "distilbert");
        let json = json!({"architectures": ["BertForMaskedLM"]});
        assert_eq!(reg.resolve(&json).unwrap().model_type(), "bert");
    }

    #[test]
    fn legacy_names() {
        assert_eq!(bert::Bert.rename_key("embeddings.LayerNorm.gamma"), "embeddings.LayerNorm.weight");
        assert_eq!(bert::Bert.rename_key("embeddings.LayerNorm.beta"), "embeddings.LayerNorm.bias");
        assert_eq!(bert::Bert.rename_key("pooler.dense.bias"), "pooler.dense.bias");
    }
}
