//! Node type registry.
//!
//! Maps a type identifier from the graph definition to a constructor. The
//! registry is an explicit value handed to the scheduler; there is no global
//! plugin table.

use crate::error::{EngineError, Result};
use crate::pipeline::node::NodeImpl;
use crate::pipeline::nodes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Builds a fresh node implementation for one copy
pub type NodeFactory = Arc<dyn Fn() -> Box<dyn NodeImpl> + Send + Sync>;

/// Lookup table from node type identifier to factory
#[derive(Clone, Default)]
pub struct NodeRegistry {
    factories: BTreeMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in node types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(nodes::GENERATOR, || Box::new(nodes::GeneratorNode::default()));
        registry.register(nodes::PASS_THROUGH, || Box::new(nodes::PassThroughNode));
        registry.register(nodes::DISCARD, || Box::new(nodes::DiscardNode::default()));
        registry.register(nodes::LOG, || Box::new(nodes::LogNode::default()));
        registry.register(nodes::SOCKET_WRITER, || {
            Box::new(nodes::SocketWriterNode::default())
        });
        registry.register(nodes::SOCKET_READER, || {
            Box::new(nodes::SocketReaderNode::default())
        });
        registry
    }

    /// Register (or replace) a node type.
    pub fn register<F>(&mut self, node_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn NodeImpl> + Send + Sync + 'static,
    {
        self.factories.insert(node_type.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Instantiate a node for `node`, one of the graph's nodes.
    pub fn create(&self, node: &str, node_type: &str) -> Result<Box<dyn NodeImpl>> {
        self.factories
            .get(node_type)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::UnknownNodeType {
                node: node.to_string(),
                node_type: node_type.to_string(),
            })
    }

    /// Registered type identifiers, sorted.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.types()).finish()
    }
}
