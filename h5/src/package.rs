//! The packaged model: a frozen graph as a JSON architecture plus one HDF5
//! dataset per weight, in a single file.
use std::collections::HashSet;

use modelport_tensorflow::tensor::{data_type, shape_proto};
use modelport_tensorflow::tfpb;
use modelport_tensorflow::tfpb::tensorflow::attr_value::{ListValue, Value as TfAttr};
use modelport_tensorflow::tfpb::tensorflow::{AttrValue, DataType, GraphDef, NodeDef, TensorProto};

use crate::bundle::{SavedModelBundle, Signature, topological_order};
use crate::hdf5::{self, Dataset, Group, Value};
use crate::internal::*;

pub const PACKAGED_FILENAME: &str = "model.h5";
pub const FORMAT: &str = "modelport";
pub const FORMAT_VERSION: &str = "1.0";
pub const BACKEND: &str = "tensorflow";
pub const MODEL_CONFIG: &str = "model_config";
pub const WEIGHTS_GROUP: &str = "model_weights";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrConfig {
    Str(String),
    Int(i64),
    Float(f32),
    Bool(bool),
    Dtype(String),
    Shape(Vec<i64>),
    /// Key of a dataset under `model_weights/`.
    Weight(String),
    Strs(Vec<String>),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Bools(Vec<bool>),
    Dtypes(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, AttrConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub backend: String,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Clone, Debug)]
pub struct PackageConfig {
    pub tag: String,
    pub signature_key: String,
}

impl Default for PackageConfig {
    fn default() -> PackageConfig {
        PackageConfig { tag: "serve".into(), signature_key: "serving_default".into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PackagedModel {
    pub config: ModelConfig,
    pub signature: Signature,
    pub weights: BTreeMap<String, Tensor>,
}

fn weight_key(node: &NodeDef, attr: &str) -> String {
    if attr == "value" { node.name.clone() } else { format!("{}/{attr}", node.name) }
}

/// Dataset names can not hold `/`: it is escaped, as is `%` itself.
pub fn escape(key: &str) -> String {
    key.replace('%', "%25").replace('/', "%2F")
}

pub fn unescape(name: &str) -> PortResult<String> {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.as_str() {
            "25" => out.push('%'),
            "2F" => out.push('/'),
            _ => bail!("Invalid escape %{code} in {name:?}"),
        }
    }
    Ok(out)
}

fn dtype_name(t: i32) -> PortResult<String> {
    let dt = DataType::from_i32(t).with_context(|| format!("Invalid DataType {t}"))?;
    Ok(crate::dtype::name(DatumType::try_from(dt)?).to_string())
}

fn dtype_proto(name: &str) -> PortResult<i32> {
    Ok(data_type(crate::dtype::parse(name)?).into())
}

fn attr_config(
    node: &NodeDef,
    name: &str,
    value: &AttrValue,
    weights: &mut BTreeMap<String, Tensor>,
) -> PortResult<AttrConfig> {
    let Some(value) = &value.value else { bail!("Empty value") };
    Ok(match value {
        TfAttr::S(bytes) => AttrConfig::Str(String::from_utf8(bytes.clone()).context("Non UTF-8 string")?),
        TfAttr::I(i) => AttrConfig::Int(*i),
        TfAttr::F(f) => AttrConfig::Float(*f),
        TfAttr::B(b) => AttrConfig::Bool(*b),
        TfAttr::Type(t) => AttrConfig::Dtype(dtype_name(*t)?),
        TfAttr::Shape(shape) => {
            ensure!(!shape.unknown_rank, "Shapes of unknown rank are not supported");
            AttrConfig::Shape(shape.dim.iter().map(|d| d.size).collect())
        }
        TfAttr::Tensor(proto) => {
            let key = weight_key(node, name);
            weights.insert(key.clone(), Tensor::try_from(proto)?);
            AttrConfig::Weight(key)
        }
        TfAttr::List(list) => {
            ensure!(list.shape.is_empty() && list.tensor.is_empty(), "Shape and tensor lists are not supported");
            if !list.s.is_empty() {
                let strings = list.s.iter().map(|s| String::from_utf8(s.clone()).context("Non UTF-8 string"));
                AttrConfig::Strs(strings.collect::<PortResult<_>>()?)
            } else if !list.f.is_empty() {
                AttrConfig::Floats(list.f.clone())
            } else if !list.b.is_empty() {
                AttrConfig::Bools(list.b.clone())
            } else if !list.r#type.is_empty() {
                AttrConfig::Dtypes(list.r#type.iter().map(|t| dtype_name(*t)).collect::<PortResult<_>>()?)
            } else {
                AttrConfig::Ints(list.i.clone())
            }
        }
        TfAttr::Placeholder(p) => bail!("Function placeholder {p} can not be frozen"),
    })
}

fn attr_value(attr: &AttrConfig, weights: &BTreeMap<String, Tensor>) -> PortResult<AttrValue> {
    let list = |list: ListValue| AttrValue { value: Some(TfAttr::List(list)) };
    Ok(match attr {
        AttrConfig::Str(s) => s.as_str().into(),
        AttrConfig::Int(i) => (*i).into(),
        AttrConfig::Float(f) => (*f).into(),
        AttrConfig::Bool(b) => (*b).into(),
        AttrConfig::Dtype(t) => AttrValue { value: Some(TfAttr::Type(dtype_proto(t)?)) },
        AttrConfig::Shape(dims) => shape_proto(dims).into(),
        AttrConfig::Weight(key) => {
            let tensor = weights.get(key).with_context(|| format!("Missing weight {key}"))?;
            TensorProto::try_from(tensor)?.into()
        }
        AttrConfig::Strs(s) => list(ListValue { s: s.iter().map(|s| s.as_bytes().to_vec()).collect(), ..ListValue::default() }),
        AttrConfig::Ints(i) => list(ListValue { i: i.clone(), ..ListValue::default() }),
        AttrConfig::Floats(f) => list(ListValue { f: f.clone(), ..ListValue::default() }),
        AttrConfig::Bools(b) => list(ListValue { b: b.clone(), ..ListValue::default() }),
        AttrConfig::Dtypes(t) => {
            list(ListValue { r#type: t.iter().map(|t| dtype_proto(t)).collect::<PortResult<_>>()?, ..ListValue::default() })
        }
    })
}

impl PackagedModel {
    pub fn from_bundle(bundle: &SavedModelBundle) -> PortResult<PackagedModel> {
        let mut weights = BTreeMap::new();
        let mut nodes = Vec::with_capacity(bundle.order.len());
        for &ix in &bundle.order {
            let node = &bundle.graph.node[ix];
            let mut attrs = BTreeMap::new();
            for (name, value) in &node.attr {
                let attr = attr_config(node, name, value, &mut weights)
                    .with_context(|| format!("Node {} ({}), attribute '{name}'", node.name, node.op))?;
                attrs.insert(name.clone(), attr);
            }
            trace!("Packaging {} ({})", node.name, node.op);
            nodes.push(NodeConfig { name: node.name.clone(), op: node.op.clone(), inputs: node.input.clone(), attrs });
        }
        Ok(PackagedModel {
            config: ModelConfig { backend: BACKEND.to_string(), nodes },
            signature: bundle.signature.clone(),
            weights,
        })
    }

    /// Total size of the weights, in bytes.
    pub fn weights_size(&self) -> usize {
        self.weights.values().map(|t| t.len() * t.datum_type().size_of()).sum()
    }

    /// Rebuilds the frozen graph, nodes in topological order.
    pub fn to_graph_def(&self) -> PortResult<GraphDef> {
        let mut graph = tfpb::graph();
        for node in &self.config.nodes {
            let mut def = tfpb::node().name(&node.name).op(&node.op);
            def.input = node.inputs.clone();
            for (name, attr) in &node.attrs {
                let value = attr_value(attr, &self.weights)
                    .with_context(|| format!("Node {} ({}), attribute '{name}'", node.name, node.op))?;
                def.attr.insert(name.clone(), value);
            }
            graph.node.push(def);
        }
        Ok(graph)
    }

    /// Checks that weight references, node inputs and the signature all
    /// resolve.
    pub fn check(&self) -> PortResult<()> {
        ensure!(self.config.backend == BACKEND, "Unsupported backend {:?}", self.config.backend);
        let mut referenced = HashSet::new();
        for node in &self.config.nodes {
            for attr in node.attrs.values() {
                if let AttrConfig::Weight(key) = attr {
                    ensure!(self.weights.contains_key(key), "Node {} refers to missing weight {key}", node.name);
                    referenced.insert(key.as_str());
                }
            }
        }
        if let Some(orphan) = self.weights.keys().find(|k| !referenced.contains(k.as_str())) {
            bail!("Weight {orphan} is not used by any node");
        }
        let graph = self.to_graph_def()?;
        topological_order(&graph)?;
        for spec in self.signature.inputs.iter().chain(&self.signature.outputs) {
            ensure!(
                graph.node.iter().any(|n| n.name == spec.node),
                "Signature tensor {} refers to missing node {}",
                spec.key,
                spec.node
            );
        }
        Ok(())
    }

    pub fn to_hdf5(&self) -> PortResult<Group> {
        let mut root = Group::default();
        root.set_attr("format", FORMAT);
        root.set_attr("format_version", FORMAT_VERSION);
        root.set_attr("backend", BACKEND);
        root.set_attr("producer", format!("modelport {}", env!("CARGO_PKG_VERSION")));
        root.set_attr("signature", serde_json::to_string(&self.signature)?);
        let config = serde_json::to_string(&self.config)?;
        root.add_dataset(MODEL_CONFIG, Dataset::new(Value::String(config)))?;
        let group = root.add_group(WEIGHTS_GROUP)?;
        for (key, tensor) in &self.weights {
            group.add_dataset(&escape(key), Dataset::new(Value::Tensor(tensor.clone())))?;
        }
        Ok(root)
    }

    pub fn from_hdf5(root: &Group) -> PortResult<PackagedModel> {
        let format = root.attr("format")?;
        ensure!(format == FORMAT, "Not a packaged model (format {format:?})");
        let version = root.attr("format_version")?;
        ensure!(version == FORMAT_VERSION, "Unsupported format version {version}");
        let signature: Signature = serde_json::from_str(root.attr("signature")?).context("Parsing signature")?;
        let Value::String(config) = &root.dataset(MODEL_CONFIG)?.value else {
            bail!("{MODEL_CONFIG} is not a string");
        };
        let config: ModelConfig = serde_json::from_str(config).with_context(|| format!("Parsing {MODEL_CONFIG}"))?;
        let mut weights = BTreeMap::new();
        for (name, dataset) in root.group(WEIGHTS_GROUP)?.datasets() {
            let Value::Tensor(tensor) = &dataset.value else { bail!("Weight {name} is not numeric") };
            weights.insert(unescape(name)?, tensor.clone());
        }
        Ok(PackagedModel { config, signature, weights })
    }

    /// Writes the model as an HDF5 file, returning its size.
    pub fn write(&self, path: impl AsRef<Path>) -> PortResult<u64> {
        let path = path.as_ref();
        hdf5::write(path, &self.to_hdf5()?).with_context(|| format!("Writing {}", path.display()))
    }

    /// Reads back and checks a packaged model.
    pub fn load(path: impl AsRef<Path>) -> PortResult<PackagedModel> {
        let path = path.as_ref();
        let model = PackagedModel::from_hdf5(&hdf5::read(path)?).with_context(|| format!("Loading {}", path.display()))?;
        model.check().with_context(|| format!("Checking {}", path.display()))?;
        Ok(model)
    }
}

/// Loads a frozen saved-model directory and writes it to `output` as a
/// single file. The written file is loaded back and returned.
pub fn package(
    saved_model_dir: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &PackageConfig,
) -> PortResult<PackagedModel> {
    let (dir, output) = (saved_model_dir.as_ref(), output.as_ref());
    let bundle = SavedModelBundle::load(dir, &config.tag, &config.signature_key)?;
    let model = PackagedModel::from_bundle(&bundle)?;
    model.check()?;
    let size = model.write(output)?;
    info!(
        "Packaged {} nodes and {} weights ({} bytes of parameters) into {} ({size} bytes)",
        model.config.nodes.len(),
        model.weights.len(),
        model.weights_size(),
        output.display()
    );
    PackagedModel::load(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_names_escape() {
        for key in ["a", "bert/encoder/layer_0/Const", "odd%2Fname", "%/%"] {
            let escaped = escape(key);
            assert!(!escaped.contains('/'));
            assert_eq!(unescape(&escaped).unwrap(), key);
        }
        assert!(unescape("bad%zz").is_err());
    }

    #[test]
    fn attrs_are_externally_tagged() {
        let node = NodeConfig {
            name: "w".into(),
            op: "Const".into(),
            inputs: vec![],
            attrs: BTreeMap::from([
                ("dtype".to_string(), AttrConfig::Dtype("float32".into())),
                ("value".to_string(), AttrConfig::Weight("w".into())),
            ]),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "w", "op": "Const", "attrs": {"dtype": {"dtype": "float32"}, "value": {"weight": "w"}}})
        );
    }

    #[test]
    fn attributes_survive_the_config() {
        let node = tfpb::node()
            .name("n")
            .op("Mean")
            .attr("keep_dims", true)
            .attr("T", DataType::DtFloat)
            .attr("axes", vec![1i64, 2])
            .attr("epsilon", 1e-12f32)
            .attr("value", TensorProto::try_from(&Tensor::vector(&[1f32, 2.])).unwrap());
        let mut weights = BTreeMap::new();
        for (name, value) in &node.attr {
            let config = attr_config(&node, name, value, &mut weights).unwrap();
            let back = attr_value(&config, &weights).unwrap();
            if name == "value" {
                assert_eq!(weights["n"], Tensor::vector(&[1f32, 2.]));
            } else {
                assert_eq!(&back, value, "{name}");
            }
        }
    }

    #[test]
    fn dangling_weights_are_refused() {
        let mut model = PackagedModel {
            config: ModelConfig {
                backend: BACKEND.into(),
                nodes: vec![NodeConfig {
                    name: "w".into(),
                    op: "Const".into(),
                    inputs: vec![],
                    attrs: BTreeMap::from([("value".to_string(), AttrConfig::Weight("w".into()))]),
                }],
            },
            signature: Signature::default(),
            weights: BTreeMap::new(),
        };
        assert!(model.check().is_err());
        model.weights.insert("w".into(), Tensor::scalar(1f32));
        model.check().unwrap();
        model.weights.insert("orphan".into(), Tensor::scalar(1f32));
        assert!(model.check().is_err());
    }
}
