//! Typed model of a ComfyUI API-format workflow.
//!
//! A workflow is a JSON object mapping node ids to nodes:
//!
//! ```json
//! {
//!   "8": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["4", 2] } },
//!   "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0], "filename_prefix": "out" } }
//! }
//! ```
//!
//! Input values are either links to another node's output (`[node_id, index]`)
//! or literals. The shape is decided once at parse time; anything that is not
//! a well-formed two-element link is kept verbatim as a [`InputValue::Literal`].

use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Reference to output `output_index` of node `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub node_id: String,
    pub output_index: u32,
}

impl NodeRef {
    pub fn new(node_id: impl Into<String>, output_index: u32) -> Self {
        Self {
            node_id: node_id.into(),
            output_index,
        }
    }

    /// Parse a canonical link: a two-element array of a string id and a
    /// non-negative integer index.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_array()?.as_slice() {
            [Value::String(id), index] => Some(Self::new(id.clone(), as_index(index)?)),
            _ => None,
        }
    }

    /// Like [`from_value`](Self::from_value) but also accepts an integer node
    /// id, which some workflow exporters emit. The id is normalised to a string.
    pub fn from_candidate(value: &Value) -> Option<Self> {
        if let Some(link) = Self::from_value(value) {
            return Some(link);
        }
        match value.as_array()?.as_slice() {
            [Value::Number(id), index] if id.is_u64() => {
                Some(Self::new(id.to_string(), as_index(index)?))
            }
            _ => None,
        }
    }
}

fn as_index(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|i| u32::try_from(i).ok())
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node_id, self.output_index)
    }
}

impl Serialize for NodeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.node_id)?;
        tuple.serialize_element(&self.output_index)?;
        tuple.end()
    }
}

/// A node input: either a link to another node or an opaque literal.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Link(NodeRef),
    Literal(Value),
}

impl InputValue {
    pub fn as_link(&self) -> Option<&NodeRef> {
        match self {
            Self::Link(link) => Some(link),
            Self::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Link(_) => None,
            Self::Literal(value) => Some(value),
        }
    }
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        match NodeRef::from_value(&value) {
            Some(link) => Self::Link(link),
            None => Self::Literal(value),
        }
    }
}

impl From<NodeRef> for InputValue {
    fn from(link: NodeRef) -> Self {
        Self::Link(link)
    }
}

impl Serialize for InputValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Link(link) => link.serialize(serializer),
            Self::Literal(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}

/// A single workflow node.
///
/// Serialized with the engine's `class_type` field name; `kind` is accepted
/// as an alias on input. Fields other than the kind and inputs (such as
/// `_meta`) are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    #[serde(rename = "class_type")]
    pub kind: String,
    pub inputs: IndexMap<String, InputValue>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inputs: IndexMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;

        let class_type = fields.remove("class_type");
        let alias = fields.remove("kind");
        let kind = match class_type.or(alias) {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(de::Error::custom(format!(
                    "node class_type must be a string, got {other}"
                )))
            }
            None => return Err(de::Error::missing_field("class_type")),
        };

        let inputs = match fields.remove("inputs") {
            Some(Value::Null) | None => IndexMap::new(),
            Some(value) => {
                IndexMap::<String, InputValue>::deserialize(value).map_err(de::Error::custom)?
            }
        };

        Ok(Self {
            kind,
            inputs,
            extra: fields,
        })
    }
}

/// One edge of the graph, as seen from the consuming node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphLink<'a> {
    pub node_id: &'a str,
    pub input: &'a str,
    pub target: &'a NodeRef,
}

/// A workflow: node id to node, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NodeGraph {
    nodes: IndexMap<String, Node>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, returning the node it replaced (if any).
    pub fn insert(&mut self, node_id: impl Into<String>, node: Node) -> Option<Node> {
        self.nodes.insert(node_id.into(), node)
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Ids of nodes whose kind is one of `kinds`, in submission order.
    pub fn nodes_of_kind<'a>(&'a self, kinds: &'a [String]) -> impl Iterator<Item = &'a str> {
        self.iter()
            .filter(move |(_, node)| kinds.iter().any(|k| *k == node.kind))
            .map(|(id, _)| id)
    }

    /// Every link in the graph, in submission order.
    pub fn links(&self) -> impl Iterator<Item = GraphLink<'_>> {
        self.iter().flat_map(|(node_id, node)| {
            node.inputs.iter().filter_map(move |(input, value)| {
                value.as_link().map(|target| GraphLink {
                    node_id,
                    input,
                    target,
                })
            })
        })
    }

    /// Links whose target node does not exist in this graph.
    pub fn dangling_links(&self) -> impl Iterator<Item = GraphLink<'_>> {
        self.links()
            .filter(|link| !self.nodes.contains_key(&link.target.node_id))
    }
}

impl FromIterator<(String, Node)> for NodeGraph {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

impl<'de> Deserialize<'de> for NodeGraph {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct GraphVisitor;

        impl<'de> Visitor<'de> for GraphVisitor {
            type Value = NodeGraph;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object mapping node ids to nodes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<NodeGraph, A::Error> {
                let mut nodes = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, node)) = map.next_entry::<String, Node>()? {
                    if nodes.contains_key(&id) {
                        return Err(de::Error::custom(format!("duplicate node id '{id}'")));
                    }
                    nodes.insert(id, node);
                }
                Ok(NodeGraph { nodes })
            }
        }

        deserializer.deserialize_map(GraphVisitor)
    }
}
