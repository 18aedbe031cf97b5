use super::graph::{EdgeTransport, NodeConfig};
use super::id::{EdgeId, NodeId};
use super::partition::{Distribution, PartitionScheme};
use std::sync::Arc;

/// Validated execution plan for a graph.
///
/// Nodes and edges are indexed by [`NodeId`] and [`EdgeId`]; string ids from
/// the definition survive only as names for logging and status.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub name: String,

    /// All nodes, indexed by `NodeId`
    pub nodes: Vec<PlannedNode>,

    /// All edges, indexed by `EdgeId`
    pub edges: Vec<PlannedEdge>,

    /// Node ids in topological order
    pub order: Vec<NodeId>,

    /// Compilation statistics
    pub stats: PlanStats,
}

/// One node of the plan
#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub id: NodeId,
    pub name: String,
    pub node_type: String,
    pub copies: usize,
    pub scheme: Option<Arc<PartitionScheme>>,
    pub distribution: Distribution,
    pub config: Arc<NodeConfig>,

    /// Incoming edges in definition order
    pub inputs: Vec<EdgeId>,

    /// Outgoing edges in definition order
    pub outputs: Vec<EdgeId>,
}

impl PlannedNode {
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Partition id served by `copy`, for partitioned nodes.
    pub fn partition_id(&self, copy: usize) -> Option<&str> {
        self.scheme
            .as_ref()
            .and_then(|s| s.partition_ids.get(copy))
            .map(String::as_str)
    }
}

/// How the copies of an edge's endpoints are joined by queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLayout {
    /// Copy `i` feeds copy `i`; one queue per copy
    Aligned,
    /// Every source copy feeds every target copy
    Full,
}

/// One edge of the plan
#[derive(Debug, Clone)]
pub struct PlannedEdge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub transport: EdgeTransport,
    pub capacity: usize,
    pub layout: EdgeLayout,
    /// Carries rejected rows of `from`
    pub error: bool,
}

impl PlannedEdge {
    /// Number of queues this edge expands to.
    pub fn queue_count(&self, from_copies: usize, to_copies: usize) -> usize {
        match self.layout {
            EdgeLayout::Aligned => from_copies,
            EdgeLayout::Full => from_copies * to_copies,
        }
    }
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    /// Number of nodes in the graph
    pub nodes: usize,

    /// Number of edges in the graph
    pub edges: usize,

    /// Number of copy threads a run will start
    pub copies: usize,

    /// Number of queues a run will allocate
    pub queues: usize,

    /// Number of source nodes (no inputs)
    pub source_nodes: usize,

    /// Number of sink nodes (no outputs)
    pub sink_nodes: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

impl CompiledPlan {
    pub fn node(&self, id: NodeId) -> &PlannedNode {
        &self.nodes[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &PlannedEdge {
        &self.edges[id.index()]
    }

    pub fn find(&self, name: &str) -> Option<&PlannedNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
