//! Graph definitions as produced by external tooling.
//!
//! A [`Graph`] is plain data: node declarations, edges and partition
//! schemes, addressed by string ids. It is parsed from JSON or TOML and
//! handed to the compiler, which validates it and assigns numeric ids.
//!
//! ```toml
//! name = "orders"
//!
//! [[nodes]]
//! id = "read"
//! type = "generator"
//! config = { rows = 1000, fields = ["id:integer", "customer:string"] }
//!
//! [[nodes]]
//! id = "sum"
//! type = "pass-through"
//! copies = 3
//! partition_scheme = "by-customer"
//!
//! [[edges]]
//! from = "read"
//! to = "sum"
//!
//! [[partition_schemes]]
//! id = "by-customer"
//! partition_ids = ["P0", "P1", "P2"]
//! method = { kind = "hash", keys = ["customer"] }
//! ```

use crate::error::{EngineError, Result, ResultExt};
use crate::pipeline::partition::{Distribution, PartitionScheme};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Scalar or list value in a node's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<i32> for ConfigValue {
    fn from(v: i32) -> Self {
        ConfigValue::Int(v.into())
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::String(v)
    }
}

impl<T: Into<ConfigValue>> From<Vec<T>> for ConfigValue {
    fn from(v: Vec<T>) -> Self {
        ConfigValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Immutable configuration snapshot of one node.
///
/// Cloned into the compiled plan; node implementations only ever see a
/// shared reference to the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeConfig(BTreeMap<String, ConfigValue>);

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfigValue::as_str)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ConfigValue::as_int)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(ConfigValue::as_bool)
    }

    /// String value that must be present.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str(key)
            .ok_or_else(|| EngineError::Config(format!("missing string setting '{}'", key)))
    }

    /// Non-negative integer with a default.
    pub fn count_or(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(ConfigValue::Int(v)) if *v >= 0 => Ok(*v as u64),
            Some(other) => Err(EngineError::Config(format!(
                "setting '{}' must be a non-negative integer, got {:?}",
                key, other
            ))),
        }
    }
}

/// How an edge is carried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTransport {
    /// In-process queue
    #[default]
    Local,
    /// Queue pair joined by a TCP row stream
    Socket,
}

fn default_copies() -> usize {
    1
}

fn is_one(v: &usize) -> bool {
    *v == 1
}

/// One node declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,

    /// Identifier looked up in the node registry
    #[serde(rename = "type")]
    pub node_type: String,

    /// Number of parallel copies
    #[serde(default = "default_copies", skip_serializing_if = "is_one")]
    pub copies: usize,

    /// Id of a scheme in [`Graph::partition_schemes`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_scheme: Option<String>,

    /// Spreading over unpartitioned outputs
    #[serde(default)]
    pub distribution: Distribution,

    #[serde(default, skip_serializing_if = "NodeConfig::is_empty")]
    pub config: NodeConfig,
}

impl NodeDef {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            copies: 1,
            partition_scheme: None,
            distribution: Distribution::default(),
            config: NodeConfig::default(),
        }
    }

    pub fn copies(mut self, copies: usize) -> Self {
        self.copies = copies;
        self
    }

    pub fn partitioned(mut self, scheme: impl Into<String>) -> Self {
        self.partition_scheme = Some(scheme.into());
        self
    }

    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.set(key, value);
        self
    }
}

/// Directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,

    #[serde(default)]
    pub transport: EdgeTransport,

    /// Overrides the engine-wide queue capacity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,

    /// Carries the rows `from` rejects instead of its regular output
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl EdgeDef {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            transport: EdgeTransport::Local,
            capacity: None,
            error: false,
        }
    }

    /// Make this the error edge of `from`.
    pub fn errors(mut self) -> Self {
        self.error = true;
        self
    }

    pub fn socket(mut self) -> Self {
        self.transport = EdgeTransport::Socket;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// A complete graph definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub nodes: Vec<NodeDef>,

    #[serde(default)]
    pub edges: Vec<EdgeDef>,

    #[serde(default)]
    pub partition_schemes: Vec<PartitionScheme>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a definition, choosing the format by extension (`.json` or TOML).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading graph {}", path.display()))?;
        let graph = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_toml_str(&text),
        };
        graph.context(format!("parsing graph {}", path.display()))
    }

    pub fn node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeDef::new(from, to));
        self
    }

    pub fn with_edge(mut self, edge: EdgeDef) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn scheme(mut self, scheme: PartitionScheme) -> Self {
        self.partition_schemes.push(scheme);
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_scheme(&self, id: &str) -> Option<&PartitionScheme> {
        self.partition_schemes.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::partition::PartitionMethod;

    #[test]
    fn test_toml_definition() {
        let text = r#"
            name = "orders"

            [[nodes]]
            id = "read"
            type = "generator"
            config = { rows = 10, fields = ["id:integer"] }

            [[nodes]]
            id = "sum"
            type = "pass-through"
            copies = 2
            partition_scheme = "by-id"

            [[edges]]
            from = "read"
            to = "sum"
            capacity = 16

            [[partition_schemes]]
            id = "by-id"
            partition_ids = ["P0", "P1"]
            method = { kind = "hash", keys = ["id"] }
        "#;
        let graph = Graph::from_toml_str(text).unwrap();
        assert_eq!(graph.name, "orders");
        assert_eq!(graph.nodes[0].copies, 1);
        assert_eq!(graph.nodes[0].config.int("rows"), Some(10));
        assert_eq!(
            graph.nodes[0].config.get("fields").and_then(|v| v.as_list()).map(|l| l.len()),
            Some(1)
        );
        assert_eq!(graph.nodes[1].copies, 2);
        assert_eq!(graph.edges[0].capacity, Some(16));
        assert_eq!(graph.edges[0].transport, EdgeTransport::Local);
        assert_eq!(
            graph.partition_schemes[0].method,
            PartitionMethod::Hash {
                keys: vec!["id".into()]
            }
        );
    }

    #[test]
    fn test_json_round_trip() {
        let graph = Graph::new("g")
            .node(NodeDef::new("a", "generator").with("rows", 5i64))
            .node(NodeDef::new("b", "collector").copies(2))
            .with_edge(EdgeDef::new("a", "b").socket());
        let text = graph.to_json().unwrap();
        assert_eq!(Graph::from_json(&text).unwrap(), graph);
    }

    #[test]
    fn test_error_edge_flag() {
        let graph = Graph::from_toml_str(
            r#"
            [[edges]]
            from = "parse"
            to = "bad-rows"
            error = true
            "#,
        )
        .unwrap();
        assert!(graph.edges[0].error);
        assert!(!graph.to_json().unwrap().contains("\"error\": false"));
        assert!(!EdgeDef::new("a", "b").error);
        assert!(EdgeDef::new("a", "b").errors().error);
    }

    #[test]
    fn test_count_or() {
        let mut config = NodeConfig::new();
        assert_eq!(config.count_or("rows", 3).unwrap(), 3);
        config.set("rows", -1i64);
        assert!(config.count_or("rows", 3).is_err());
        config.set("rows", "many");
        assert!(config.count_or("rows", 3).is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.json");
        std::fs::write(&path, r#"{"name":"j","nodes":[{"id":"a","type":"discard"}]}"#).unwrap();
        let graph = Graph::load(&path).unwrap();
        assert_eq!(graph.name, "j");
        assert!(graph.find_node("a").is_some());

        let missing = Graph::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(missing.to_string().contains("nope.toml"));
    }
}
