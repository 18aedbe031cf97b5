use super::compiled_plan::{CompiledPlan, EdgeLayout, PlanStats, PlannedEdge, PlannedNode};
use super::graph::Graph;
use super::id::{CopyId, EdgeId, NodeId};
use super::registry::NodeRegistry;
use crate::error::{EngineError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Validates a graph definition and compiles it into an execution plan
pub struct GraphCompiler;

impl GraphCompiler {
    /// Compile a graph definition.
    ///
    /// Fails with a validation error if a node id is duplicated, an edge
    /// references an unknown node, a node type is not registered, a
    /// partition scheme does not match its node's copy count, or the node
    /// relation has a cycle. Nothing is allocated for a rejected graph.
    pub fn compile(
        graph: &Graph,
        registry: &NodeRegistry,
        default_capacity: usize,
    ) -> Result<CompiledPlan> {
        let start_time = std::time::Instant::now();

        let index = Self::index_nodes(graph)?;
        let mut nodes = Self::plan_nodes(graph, registry)?;
        let edges = Self::plan_edges(graph, &index, &nodes, default_capacity)?;

        for edge in &edges {
            nodes[edge.from.index()].outputs.push(edge.id);
            nodes[edge.to.index()].inputs.push(edge.id);
        }

        let order = Self::topological_sort(&nodes, &edges)?;

        let stats = PlanStats {
            nodes: nodes.len(),
            edges: edges.len(),
            copies: nodes.iter().map(|n| n.copies).sum(),
            queues: edges
                .iter()
                .map(|e| e.queue_count(nodes[e.from.index()].copies, nodes[e.to.index()].copies))
                .sum(),
            source_nodes: nodes.iter().filter(|n| n.is_source()).count(),
            sink_nodes: nodes.iter().filter(|n| n.is_sink()).count(),
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        tracing::debug!(
            "Compiled graph '{}': {} nodes, {} copies, {} queues",
            graph.name,
            stats.nodes,
            stats.copies,
            stats.queues
        );

        Ok(CompiledPlan {
            name: graph.name.clone(),
            nodes,
            edges,
            order,
            stats,
        })
    }

    /// Map string ids to node ids, rejecting duplicates
    fn index_nodes(graph: &Graph) -> Result<HashMap<&str, NodeId>> {
        let mut index = HashMap::with_capacity(graph.nodes.len());
        for (i, node) in graph.nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(EngineError::InvalidGraph(format!(
                    "node #{} has an empty id",
                    i
                )));
            }
            if index.insert(node.id.as_str(), NodeId(i as u32)).is_some() {
                return Err(EngineError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        Ok(index)
    }

    fn plan_nodes(graph: &Graph, registry: &NodeRegistry) -> Result<Vec<PlannedNode>> {
        let mut scheme_ids = HashSet::new();
        for scheme in &graph.partition_schemes {
            if !scheme_ids.insert(scheme.id.as_str()) {
                return Err(EngineError::InvalidGraph(format!(
                    "duplicate partition scheme '{}'",
                    scheme.id
                )));
            }
        }

        let mut planned = Vec::with_capacity(graph.nodes.len());
        for (i, node) in graph.nodes.iter().enumerate() {
            if !registry.contains(&node.node_type) {
                return Err(EngineError::UnknownNodeType {
                    node: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
            if node.copies == 0 || node.copies > CopyId::MAX_COPIES {
                return Err(EngineError::InvalidGraph(format!(
                    "node '{}' must have between 1 and {} copies, has {}",
                    node.id,
                    CopyId::MAX_COPIES,
                    node.copies
                )));
            }

            let scheme = match &node.partition_scheme {
                None => None,
                Some(id) => {
                    let scheme = graph.find_scheme(id).ok_or_else(|| {
                        EngineError::InvalidGraph(format!(
                            "node '{}' references unknown partition scheme '{}'",
                            node.id, id
                        ))
                    })?;
                    scheme.validate()?;
                    if scheme.partition_count() != node.copies {
                        return Err(EngineError::PartitionMismatch {
                            node: node.id.clone(),
                            scheme: scheme.id.clone(),
                            copies: node.copies,
                            partitions: scheme.partition_count(),
                        });
                    }
                    Some(Arc::new(scheme.clone()))
                }
            };

            planned.push(PlannedNode {
                id: NodeId(i as u32),
                name: node.id.clone(),
                node_type: node.node_type.clone(),
                copies: node.copies,
                scheme,
                distribution: node.distribution,
                config: Arc::new(node.config.clone()),
                inputs: Vec::new(),
                outputs: Vec::new(),
            });
        }
        Ok(planned)
    }

    fn plan_edges(
        graph: &Graph,
        index: &HashMap<&str, NodeId>,
        nodes: &[PlannedNode],
        default_capacity: usize,
    ) -> Result<Vec<PlannedEdge>> {
        let mut seen = HashSet::new();
        let mut with_error_edge = HashSet::new();
        let mut planned = Vec::with_capacity(graph.edges.len());

        for (i, edge) in graph.edges.iter().enumerate() {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| EngineError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: id.to_string(),
                })
            };
            let from = lookup(&edge.from)?;
            let to = lookup(&edge.to)?;

            if from == to {
                return Err(EngineError::Cycle(format!("{} -> {}", edge.from, edge.to)));
            }
            if !seen.insert((from, to)) {
                return Err(EngineError::InvalidGraph(format!(
                    "duplicate edge {} -> {}",
                    edge.from, edge.to
                )));
            }
            if edge.error && !with_error_edge.insert(from) {
                return Err(EngineError::InvalidGraph(format!(
                    "node '{}' has more than one error edge",
                    edge.from
                )));
            }
            if edge.capacity == Some(0) {
                return Err(EngineError::InvalidGraph(format!(
                    "edge {} -> {} has zero capacity",
                    edge.from, edge.to
                )));
            }

            planned.push(PlannedEdge {
                id: EdgeId(i as u32),
                from,
                to,
                transport: edge.transport,
                capacity: edge.capacity.unwrap_or(default_capacity),
                layout: Self::layout(&nodes[from.index()], &nodes[to.index()]),
                error: edge.error,
            });
        }
        Ok(planned)
    }

    /// Copies are joined one to one when both sides run the same number of
    /// copies and the target is not repartitioned by the edge.
    fn layout(from: &PlannedNode, to: &PlannedNode) -> EdgeLayout {
        if from.copies != to.copies || to.copies == 1 {
            return if from.copies == 1 && to.copies == 1 {
                EdgeLayout::Aligned
            } else {
                EdgeLayout::Full
            };
        }
        match (&from.scheme, &to.scheme) {
            (_, None) => EdgeLayout::Aligned,
            (Some(a), Some(b)) if a.id == b.id => EdgeLayout::Aligned,
            _ => EdgeLayout::Full,
        }
    }

    /// Topological sort using Kahn's algorithm; leftovers form a cycle
    fn topological_sort(nodes: &[PlannedNode], edges: &[PlannedEdge]) -> Result<Vec<NodeId>> {
        let n = nodes.len();
        let mut adj = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for edge in edges {
            adj[edge.from.index()].push(edge.to.index());
            in_degree[edge.to.index()] += 1;
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut result = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            result.push(NodeId(node as u32));
            for &neighbor in &adj[node] {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        if result.len() < n {
            let path = Self::find_cycle(&adj, &in_degree);
            let names: Vec<&str> = path.iter().map(|&i| nodes[i].name.as_str()).collect();
            return Err(EngineError::Cycle(names.join(" -> ")));
        }
        Ok(result)
    }

    /// Walk unresolved nodes until one repeats.
    ///
    /// Every node left with a positive in-degree after Kahn's algorithm has a
    /// predecessor that is also unresolved, so following predecessors must
    /// revisit a node.
    fn find_cycle(adj: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
        let n = adj.len();
        let mut pred = vec![None; n];
        for (from, targets) in adj.iter().enumerate() {
            if in_degree[from] == 0 {
                continue;
            }
            for &to in targets {
                if in_degree[to] > 0 && pred[to].is_none() {
                    pred[to] = Some(from);
                }
            }
        }

        let Some(start) = (0..n).find(|&i| in_degree[i] > 0) else {
            return Vec::new();
        };
        let mut position = vec![None; n];
        let mut walk = Vec::new();
        let mut current = start;
        loop {
            if let Some(at) = position[current] {
                let mut cycle: Vec<usize> = walk[at..].to_vec();
                cycle.reverse();
                cycle.push(cycle[0]);
                return cycle;
            }
            position[current] = Some(walk.len());
            walk.push(current);
            match pred[current] {
                Some(p) => current = p,
                None => return walk,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::{EdgeDef, NodeDef};
    use crate::pipeline::partition::{PartitionMethod, PartitionScheme};

    fn registry() -> NodeRegistry {
        NodeRegistry::with_builtins()
    }

    fn hash_scheme(id: &str, partitions: usize) -> PartitionScheme {
        PartitionScheme::new(
            id,
            partitions,
            PartitionMethod::Hash {
                keys: vec!["id".into()],
            },
        )
    }

    #[test]
    fn test_compile_linear() {
        let graph = Graph::new("g")
            .node(NodeDef::new("c", "discard"))
            .node(NodeDef::new("a", "generator"))
            .node(NodeDef::new("b", "pass-through").copies(3))
            .edge("a", "b")
            .edge("b", "c");

        let plan = GraphCompiler::compile(&graph, &registry(), 100).unwrap();
        let names: Vec<_> = plan.order.iter().map(|&id| plan.node(id).name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(plan.stats.copies, 5);
        assert_eq!(plan.stats.queues, 3 + 3);
        assert_eq!(plan.stats.source_nodes, 1);
        assert_eq!(plan.stats.sink_nodes, 1);
        assert_eq!(plan.edges[0].capacity, 100);
    }

    #[test]
    fn test_cycle_reports_path() {
        let graph = Graph::new("g")
            .node(NodeDef::new("src", "generator"))
            .node(NodeDef::new("a", "pass-through"))
            .node(NodeDef::new("b", "pass-through"))
            .edge("src", "a")
            .edge("a", "b")
            .edge("b", "a");

        let err = GraphCompiler::compile(&graph, &registry(), 10).unwrap_err();
        match err {
            EngineError::Cycle(path) => {
                assert!(path == "a -> b -> a" || path == "b -> a -> b", "{}", path)
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let graph = Graph::new("g")
            .node(NodeDef::new("a", "pass-through"))
            .edge("a", "a");
        assert!(matches!(
            GraphCompiler::compile(&graph, &registry(), 10),
            Err(EngineError::Cycle(_))
        ));
    }

    #[test]
    fn test_dangling_edge() {
        let graph = Graph::new("g")
            .node(NodeDef::new("a", "generator"))
            .edge("a", "ghost");
        let err = GraphCompiler::compile(&graph, &registry(), 10).unwrap_err();
        assert!(matches!(err, EngineError::DanglingEdge { ref missing, .. } if missing == "ghost"));
        assert!(err.is_validation());
    }

    #[test]
    fn test_unknown_node_type() {
        let graph = Graph::new("g").node(NodeDef::new("a", "teleporter"));
        assert!(matches!(
            GraphCompiler::compile(&graph, &registry(), 10),
            Err(EngineError::UnknownNodeType { .. })
        ));
    }

    #[test]
    fn test_partition_mismatch() {
        let graph = Graph::new("g")
            .node(NodeDef::new("a", "generator"))
            .node(NodeDef::new("b", "discard").copies(2).partitioned("p"))
            .scheme(hash_scheme("p", 3))
            .edge("a", "b");
        assert!(matches!(
            GraphCompiler::compile(&graph, &registry(), 10),
            Err(EngineError::PartitionMismatch {
                copies: 2,
                partitions: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicates_rejected() {
        let dup_node = Graph::new("g")
            .node(NodeDef::new("a", "generator"))
            .node(NodeDef::new("a", "discard"));
        assert!(GraphCompiler::compile(&dup_node, &registry(), 10).is_err());

        let dup_edge = Graph::new("g")
            .node(NodeDef::new("a", "generator"))
            .node(NodeDef::new("b", "discard"))
            .edge("a", "b")
            .edge("a", "b");
        assert!(GraphCompiler::compile(&dup_edge, &registry(), 10).is_err());
    }

    #[test]
    fn test_one_error_edge_per_node() {
        let graph = Graph::new("g")
            .node(NodeDef::new("a", "generator"))
            .node(NodeDef::new("b", "discard"))
            .node(NodeDef::new("c", "discard"))
            .node(NodeDef::new("d", "discard"))
            .edge("a", "b")
            .with_edge(EdgeDef::new("a", "c").errors());
        let plan = GraphCompiler::compile(&graph, &registry(), 10).unwrap();
        assert!(!plan.edges[0].error);
        assert!(plan.edges[1].error);

        let graph = graph.with_edge(EdgeDef::new("a", "d").errors());
        assert!(GraphCompiler::compile(&graph, &registry(), 10)
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_zero_copies_rejected() {
        let graph = Graph::new("g").node(NodeDef::new("a", "generator").copies(0));
        assert!(GraphCompiler::compile(&graph, &registry(), 10)
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_edge_layouts() {
        let graph = Graph::new("g")
            .node(NodeDef::new("a", "generator").copies(2))
            .node(NodeDef::new("b", "pass-through").copies(2))
            .node(NodeDef::new("c", "pass-through").copies(2).partitioned("p"))
            .node(NodeDef::new("d", "discard").copies(2).partitioned("p"))
            .node(NodeDef::new("e", "discard"))
            .scheme(hash_scheme("p", 2))
            .edge("a", "b")
            .edge("b", "c")
            .edge("c", "d")
            .with_edge(EdgeDef::new("d", "e").capacity(4));

        let plan = GraphCompiler::compile(&graph, &registry(), 10).unwrap();
        let layouts: Vec<_> = plan.edges.iter().map(|e| e.layout).collect();
        assert_eq!(
            layouts,
            vec![
                EdgeLayout::Aligned,
                EdgeLayout::Full,
                EdgeLayout::Aligned,
                EdgeLayout::Full,
            ]
        );
        assert_eq!(plan.stats.queues, 2 + 4 + 2 + 2);
        assert_eq!(plan.edges[3].capacity, 4);
    }
}
