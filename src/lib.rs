//! # rowflow: bounded-queue dataflow engine
//!
//! Runs row-oriented data integration graphs. Every node of a graph runs as
//! one or more copies, each on its own thread, and copies exchange rows
//! through bounded queues so a slow consumer throttles its producers instead
//! of exhausting memory.
//!
//! ## Architecture
//!
//! - **Rows**: [`row::Row`] values sharing an immutable [`row::Schema`]
//! - **Pipeline**: graph definition, compilation, queues, node runtime and
//!   the [`pipeline::Scheduler`] that turns a graph into a [`pipeline::Run`]
//! - **Transport**: the wire format and pumps that carry a queue over TCP
//! - **Cluster**: an execution host, its client and distributed runs
//!
//! ## Configuration
//!
//! [`config::EngineConfig`] is read from `engine.toml` in the platform config
//! directory under `rowflow` unless a path is given:
//!
//! - **Linux**: `~/.config/rowflow/engine.toml`
//! - **macOS**: `~/Library/Application Support/rowflow/engine.toml`
//! - **Windows**: `%APPDATA%\rowflow\engine.toml`
//!
//! ## Example
//!
//! ```ignore
//! use rowflow::{EngineConfig, Graph, NodeDef, NodeRegistry, Scheduler};
//!
//! let graph = Graph::new("demo")
//!     .node(NodeDef::new("gen", "generator").with("rows", 1000))
//!     .node(NodeDef::new("out", "discard"))
//!     .edge("gen", "out");
//!
//! let scheduler = Scheduler::new(NodeRegistry::with_builtins(), EngineConfig::default());
//! let run = scheduler.prepare(&graph)?;
//! run.start()?;
//! run.wait_until_finished();
//! println!("{}", run.status().state);
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod row;
pub mod transport;

// Re-export commonly used types
pub use cluster::{DistributedRun, ExecutionHost, HostClient};
pub use config::EngineConfig;
pub use error::{EngineError, Result, TransportKind};
pub use pipeline::{Graph, NodeDef, NodeImpl, NodeRegistry, Run, RunState, RunStatus, Scheduler};
pub use row::{Row, Schema, Value, ValueType};
