//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod nodes;

use rowflow::config::EngineConfig;
use rowflow::pipeline::{Graph, NodeDef, NodeRegistry, Run, RunStatus, Scheduler};
use std::net::TcpListener;
use std::time::{Duration, Instant};

pub use nodes::Collected;

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Built-in nodes plus the test nodes, with `collect` feeding `sink`.
pub fn registry(sink: &Collected) -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtins();
    nodes::register(&mut registry, sink);
    registry
}

pub fn config(queue_capacity: usize) -> EngineConfig {
    EngineConfig {
        queue_capacity,
        read_poll_interval_ms: 5,
        ..Default::default()
    }
}

pub fn prepare(graph: &Graph, sink: &Collected, queue_capacity: usize) -> Run {
    Scheduler::new(registry(sink), config(queue_capacity))
        .prepare(graph)
        .unwrap()
}

/// Prepare, start and wait for `graph`; returns the final status.
pub fn run_to_end(graph: &Graph, sink: &Collected) -> RunStatus {
    let run = prepare(graph, sink, 100);
    run.start().unwrap();
    run.wait_until_finished();
    run.status()
}

/// Generator of `rows` rows with the given `name:type` fields.
pub fn generator(id: &str, rows: i64, fields: &[&str]) -> NodeDef {
    NodeDef::new(id, "generator")
        .with("rows", rows)
        .with("fields", fields.to_vec())
}

/// A → B → C with the generator producing `rows` rows.
pub fn linear_graph(rows: i64) -> Graph {
    Graph::new("linear")
        .node(generator("a", rows, &["id:integer", "name:string"]))
        .node(NodeDef::new("b", "pass-through"))
        .node(NodeDef::new("c", "collect"))
        .edge("a", "b")
        .edge("b", "c")
}

/// Poll `condition` until it holds or the test timeout passes.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// A local port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}
