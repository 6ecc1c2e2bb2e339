//! Normalized encoder hyper-parameters.
use std::fmt;
use std::str::FromStr;

use crate::internal::*;

/// Feed-forward activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Activation {
    /// `0.5 * x * (1 + erf(x / sqrt(2)))`
    Gelu,
    /// The tanh approximation of gelu.
    GeluTanh,
    Relu,
}

impl FromStr for Activation {
    type Err = PortError;
    fn from_str(s: &str) -> PortResult<Activation> {
        match s {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::GeluTanh),
            "relu" => Ok(Activation::Relu),
            _ => bail!("Unsupported activation function {s:?}"),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Activation::Gelu => "gelu",
            Activation::GeluTanh => "gelu_new",
            Activation::Relu => "relu",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub model_type: String,
    pub architectures: Vec<String>,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: Activation,
    pub max_position_embeddings: usize,
    /// Zero when the architecture has no token type embeddings.
    pub type_vocab_size: usize,
    pub layer_norm_eps: f32,
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> PortResult<()> {
        ensure!(self.vocab_size > 0, "vocab_size must be positive");
        ensure!(self.hidden_size > 0, "hidden_size must be positive");
        ensure!(self.num_attention_heads > 0, "num_attention_heads must be positive");
        ensure!(
            self.hidden_size % self.num_attention_heads == 0,
            "hidden_size ({}) is not a multiple of num_attention_heads ({})",
            self.hidden_size,
            self.num_attention_heads
        );
        ensure!(self.intermediate_size > 0, "intermediate_size must be positive");
        ensure!(self.max_position_embeddings > 0, "max_position_embeddings must be positive");
        ensure!(
            self.layer_norm_eps.is_finite() && self.layer_norm_eps > 0.0,
            "layer_norm_eps must be a positive number, got {}",
            self.layer_norm_eps
        );
        Ok(())
    }
}

/// Reads and parses `<dir>/config.json`.
pub fn read_config_json(dir: &Path) -> PortResult<serde_json::Value> {
    let path = dir.join("config.json");
    let content = fs_err::read_to_string(&path)?;
    let json: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Parsing {}", path.display()))?;
    ensure!(json.is_object(), "{} does not hold a JSON object", path.display());
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activations() {
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!("gelu_pytorch_tanh".parse::<Activation>().unwrap(), Activation::GeluTanh);
        assert!("swish".parse::<Activation>().is_err());
    }

    #[test]
    fn heads_must_divide_hidden() {
        let config = ModelConfig {
            model_type: "bert".into(),
            architectures: vec![],
            vocab_size: 10,
            hidden_size: 30,
            num_hidden_layers: 1,
            num_attention_heads: 4,
            intermediate_size: 8,
            hidden_act: Activation::Gelu,
            max_position_embeddings: 16,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
        };
        assert!(config.validate().is_err());
        assert!(ModelConfig { num_attention_heads: 3, ..config }.validate().is_ok());
    }
}
