use std::fmt;

use crate::arch::{EncoderLayout, LayerLayout, ParamGroup};
use crate::internal::*;

/// Parameter tensors by name, in module order.
#[derive(Clone, Default)]
pub struct StateDict {
    names: Vec<String>,
    tensors: HashMap<String, Arc<Tensor>>,
}

impl StateDict {
    pub fn insert(&mut self, name: impl Into<String>, tensor: Arc<Tensor>) {
        let name = name.into();
        if self.tensors.insert(name.clone(), tensor).is_none() {
            self.names.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Tensor>)> {
        self.names.iter().map(move |n| (n.as_str(), &self.tensors[n]))
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }
}

impl fmt::Debug for StateDict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[derive(Clone, Debug)]
pub struct Outputs<V> {
    pub last_hidden_state: V,
    pub pooler_output: Option<V>,
}

impl<V> Outputs<V> {
    /// Outputs in declaration order.
    pub fn into_vec(self) -> Vec<V> {
        let mut v = vec![self.last_hidden_state];
        v.extend(self.pooler_output);
        v
    }
}

/// A loaded encoder: normalized config, parameter names, weights.
#[derive(Clone, Debug, new)]
pub struct Model {
    config: ModelConfig,
    layout: EncoderLayout,
    state_dict: StateDict,
}

impl Model {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn layout(&self) -> &EncoderLayout {
        &self.layout
    }

    pub fn state_dict(&self) -> &StateDict {
        &self.state_dict
    }

    pub fn has_pooler(&self) -> bool {
        self.layout.pooler.is_some()
    }

    pub fn output_names(&self) -> Vec<&'static str> {
        if self.has_pooler() {
            vec!["last_hidden_state", "pooler_output"]
        } else {
            vec!["last_hidden_state"]
        }
    }

    fn param<G: Graph>(&self, graph: &mut G, name: &str) -> PortResult<G::Value> {
        let tensor = self
            .state_dict
            .get(name)
            .with_context(|| format!("Model has no parameter {name}"))?;
        graph.parameter(name, tensor)
    }

    fn linear<G: Graph>(&self, graph: &mut G, group: &ParamGroup, x: &G::Value) -> PortResult<G::Value> {
        graph.scoped(group.name(), |g| {
            let w = self.param(g, &group.weight())?;
            let b = self.param(g, &group.bias())?;
            g.linear(x, &w, &b)
        })
    }

    fn layer_norm<G: Graph>(&self, graph: &mut G, group: &ParamGroup, x: &G::Value) -> PortResult<G::Value> {
        graph.scoped(group.name(), |g| {
            let w = self.param(g, &group.weight())?;
            let b = self.param(g, &group.bias())?;
            g.layer_norm(x, &w, &b, self.config.layer_norm_eps)
        })
    }

    /// Runs the encoder on `input_ids`, a `[batch, sequence]` I64 value.
    pub fn forward<G: Graph>(&self, graph: &mut G, input_ids: &G::Value) -> PortResult<Outputs<G::Value>> {
        let shape = graph.shape_of(input_ids).to_vec();
        ensure!(shape.len() == 2, "input_ids must be [batch, sequence], got {shape:?}");
        let seq = shape[1];
        ensure!(
            seq <= self.config.max_position_embeddings,
            "Sequence length {seq} exceeds max_position_embeddings ({})",
            self.config.max_position_embeddings
        );

        let hidden = graph.scoped("embeddings", |g| self.embeddings(g, input_ids, seq))?;
        let hidden = self.layout.layers.iter().try_fold(hidden, |h, layer| {
            graph.scoped(&layer.scope, |g| self.layer(g, layer, &h))
        });
        let hidden = hidden?;
        let pooler_output = if let Some(pooler) = &self.layout.pooler {
            Some(graph.scoped("pooler", |g| {
                let first = g.constant(Tensor::scalar(0i64))?;
                let first = g.gather(&hidden, &first, 1)?;
                let dense = self.linear(g, pooler, &first)?;
                g.apply(Op::Tanh, &[&dense])
            })?)
        } else {
            None
        };
        Ok(Outputs { last_hidden_state: hidden, pooler_output })
    }

    fn embeddings<G: Graph>(&self, g: &mut G, input_ids: &G::Value, seq: usize) -> PortResult<G::Value> {
        let words = self.param(g, &self.layout.word_embeddings)?;
        let mut x = g.scoped("word_embeddings", |g| g.gather(&words, input_ids, 0))?;
        if let Some(tt) = &self.layout.token_type_embeddings {
            // no token_type_ids input: every position is segment 0
            let types = self.param(g, tt)?;
            let zeros = g.constant(Tensor::zero::<i64>(&[1, seq]))?;
            let t = g.scoped("token_type_embeddings", |g| g.gather(&types, &zeros, 0))?;
            x = g.add(&x, &t)?;
        }
        let positions = self.param(g, &self.layout.position_embeddings)?;
        let ids = Tensor::from_shape(&[1, seq], (0..seq as i64).collect::<Vec<i64>>())?;
        let ids = g.constant(ids)?;
        let p = g.scoped("position_embeddings", |g| g.gather(&positions, &ids, 0))?;
        let x = g.add(&x, &p)?;
        self.layer_norm(g, &self.layout.embeddings_norm, &x)
    }

    fn layer<G: Graph>(&self, g: &mut G, layer: &LayerLayout, x: &G::Value) -> PortResult<G::Value> {
        let attention = g.scoped("attention", |g| self.attention(g, layer, x))?;
        let intermediate = self.linear(g, &layer.intermediate, &attention)?;
        let intermediate = g.activation(&intermediate, self.config.hidden_act)?;
        let output = self.linear(g, &layer.output, &intermediate)?;
        let output = g.add(&output, &attention)?;
        self.layer_norm(g, &layer.output_norm, &output)
    }

    fn attention<G: Graph>(&self, g: &mut G, layer: &LayerLayout, x: &G::Value) -> PortResult<G::Value> {
        let heads = self.config.num_attention_heads as i64;
        let head_dim = self.config.head_dim() as i64;
        let split = |g: &mut G, group: &ParamGroup| -> PortResult<G::Value> {
            let projected = self.linear(g, group, x)?;
            let projected = g.reshape(&projected, &[0, 0, heads, head_dim])?;
            g.transpose(&projected, &[0, 2, 1, 3])
        };
        let q = split(g, &layer.query)?;
        let k = split(g, &layer.key)?;
        let v = split(g, &layer.value)?;
        let k = g.transpose(&k, &[0, 1, 3, 2])?;
        let scores = g.matmul(&q, &k)?;
        let scale = g.scalar((head_dim as f32).sqrt())?;
        let scores = g.div(&scores, &scale)?;
        let probs = g.softmax(&scores, -1)?;
        let context = g.matmul(&probs, &v)?;
        let context = g.transpose(&context, &[0, 2, 1, 3])?;
        let context = g.reshape(&context, &[0, 0, heads * head_dim])?;
        let output = self.linear(g, &layer.attention_output, &context)?;
        let output = g.add(&output, x)?;
        self.layer_norm(g, &layer.attention_norm, &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TinyEncoder;

    #[test]
    fn eager_forward_shapes() {
        let model = TinyEncoder::bert().build().unwrap();
        let input = Tensor::from_shape(&[2, 5], vec![1i64, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        let mut eager = Eager;
        let input = eager.constant(input).unwrap();
        let outputs = model.forward(&mut eager, &input).unwrap();
        let hidden = model.config().hidden_size;
        assert_eq!(outputs.last_hidden_state.shape(), &[2, 5, hidden]);
        assert_eq!(outputs.pooler_output.unwrap().shape(), &[2, hidden]);
    }

    #[test]
    fn rows_are_independent() {
        let model = TinyEncoder::distilbert().build().unwrap();
        let one = Tensor::from_shape(&[1, 4], vec![5i64, 6, 7, 8]).unwrap();
        let two = Tensor::from_shape(&[2, 4], vec![1i64, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut eager = Eager;
        let one = eager.constant(one).unwrap();
        let two = eager.constant(two).unwrap();
        let one = model.forward(&mut eager, &one).unwrap().last_hidden_state;
        let two = model.forward(&mut eager, &two).unwrap().last_hidden_state;
        let second_row = two.to_array_view::<f32>().unwrap().index_axis(ndarray::Axis(0), 1).to_owned();
        let first = one.to_array_view::<f32>().unwrap().index_axis(ndarray::Axis(0), 0).to_owned();
        let diff = (&second_row - &first).mapv(f32::abs).fold(0f32, |a, &b| a.max(b));
        assert!(diff < 1e-5);
    }

    #[test]
    fn sequence_longer_than_positions_is_refused() {
        let model = TinyEncoder::bert().max_position_embeddings(4).build().unwrap();
        let mut eager = Eager;
        let input = eager.constant(Tensor::zero::<i64>(&[1, 5])).unwrap();
        assert!(model.forward(&mut eager, &input).is_err());
    }
}
