//! A frozen SavedModel read back from disk, validated and ready to package.
use modelport_tensorflow::saved_model::{VARIABLES_DIR, VARIABLES_INDEX, read_saved_model};
use modelport_tensorflow::tfpb::tensorflow::{DataType, GraphDef, SignatureDef, TensorInfo};

use crate::internal::*;

/// One named input or output of a signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub key: String,
    pub node: String,
    #[serde(with = "crate::dtype::serde_name")]
    pub dtype: DatumType,
    /// `-1` marks an unknown dimension.
    pub shape: Vec<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// Node name of a graph edge: `^ctrl` and `node:1` both refer to a node.
pub fn node_name(input: &str) -> &str {
    let input = input.strip_prefix('^').unwrap_or(input);
    input.split(':').next().unwrap_or(input)
}

fn tensor_spec(key: &str, info: &TensorInfo, index: &HashMap<&str, usize>) -> PortResult<TensorSpec> {
    let node = node_name(&info.name);
    ensure!(index.contains_key(node), "Signature tensor {key} refers to {}, which is not in the graph", info.name);
    let dtype = DataType::from_i32(info.dtype).with_context(|| format!("Invalid DataType {}", info.dtype))?;
    let dtype = DatumType::try_from(dtype).with_context(|| format!("Signature tensor {key}"))?;
    let shape = info.tensor_shape.as_ref().with_context(|| format!("Signature tensor {key} has no shape"))?;
    ensure!(!shape.unknown_rank, "Signature tensor {key} has an unknown rank");
    Ok(TensorSpec {
        key: key.to_string(),
        node: node.to_string(),
        dtype,
        shape: shape.dim.iter().map(|d| d.size).collect(),
    })
}

#[derive(Clone, Debug)]
pub struct SavedModelBundle {
    pub graph: GraphDef,
    /// Node indices, producers before consumers.
    pub order: Vec<usize>,
    pub signature: Signature,
}

impl SavedModelBundle {
    /// Loads the meta graph tagged `tag` and resolves `signature_key` against
    /// it.
    pub fn load(dir: impl AsRef<Path>, tag: &str, signature_key: &str) -> PortResult<SavedModelBundle> {
        let dir = dir.as_ref();
        ensure!(dir.is_dir(), "{} is not a saved-model directory", dir.display());
        let index = dir.join(VARIABLES_DIR).join(VARIABLES_INDEX);
        ensure!(
            !index.exists(),
            "{} holds variables, only frozen graphs can be packaged",
            dir.display()
        );
        let saved = read_saved_model(dir)?;
        let meta = saved.meta_graph(tag)?;
        let graph = meta.graph()?.clone();
        let order = topological_order(&graph)?;
        let signature = resolve_signature(&graph, &meta.signature_def, signature_key)?;
        debug!(
            "Loaded {} nodes from {}, signature {signature_key}: {} inputs, {} outputs",
            graph.node.len(),
            dir.display(),
            signature.inputs.len(),
            signature.outputs.len()
        );
        Ok(SavedModelBundle { graph, order, signature })
    }
}

fn index(graph: &GraphDef) -> PortResult<HashMap<&str, usize>> {
    let mut index = HashMap::new();
    for (ix, node) in graph.node.iter().enumerate() {
        ensure!(index.insert(node.name.as_str(), ix).is_none(), "Node {} appears twice", node.name);
    }
    Ok(index)
}

fn resolve_signature(
    graph: &GraphDef,
    signatures: &BTreeMap<String, SignatureDef>,
    key: &str,
) -> PortResult<Signature> {
    let index = index(graph)?;
    let signature = signatures.get(key).with_context(|| {
        format!("No signature {key:?} in the saved model (found {:?})", signatures.keys().collect::<Vec<_>>())
    })?;
    let specs = |infos: &BTreeMap<String, TensorInfo>| -> PortResult<Vec<TensorSpec>> {
        infos.iter().map(|(k, info)| tensor_spec(k, info, &index)).collect()
    };
    let signature = Signature { inputs: specs(&signature.inputs)?, outputs: specs(&signature.outputs)? };
    ensure!(!signature.inputs.is_empty() && !signature.outputs.is_empty(), "Signature {key:?} is empty");
    Ok(signature)
}

/// Kahn's algorithm over the node inputs. Fails on dangling inputs and
/// cycles.
pub fn topological_order(graph: &GraphDef) -> PortResult<Vec<usize>> {
    let index = index(graph)?;
    let mut pending = vec![0usize; graph.node.len()];
    let mut consumers = vec![vec![]; graph.node.len()];
    for (ix, node) in graph.node.iter().enumerate() {
        for input in &node.input {
            let &producer = index
                .get(node_name(input))
                .with_context(|| format!("Node {} ({}) consumes unknown tensor {input}", node.name, node.op))?;
            pending[ix] += 1;
            consumers[producer].push(ix);
        }
    }
    let mut ready: Vec<usize> = (0..graph.node.len()).filter(|&ix| pending[ix] == 0).rev().collect();
    let mut order = Vec::with_capacity(graph.node.len());
    while let Some(ix) = ready.pop() {
        order.push(ix);
        for &c in consumers[ix].iter().rev() {
            pending[c] -= 1;
            if pending[c] == 0 {
                ready.push(c);
            }
        }
    }
    if order.len() != graph.node.len() {
        let stuck: Vec<&str> =
            (0..graph.node.len()).filter(|&ix| pending[ix] > 0).map(|ix| graph.node[ix].name.as_str()).collect();
        bail!("Graph has a cycle through {stuck:?}");
    }
    Ok(order)
}
