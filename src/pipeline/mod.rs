//! Bounded-queue dataflow engine.
//!
//! A [`Graph`] of nodes is compiled into a [`CompiledPlan`], then executed as
//! a [`Run`]: one thread per node copy, joined by bounded [`RowQueue`]s.
//!
//! # Architecture
//!
//! ```text
//! Graph ──► GraphCompiler ──► CompiledPlan ──► Scheduler::prepare ──► Run
//!                                                                      │
//!     [gen.0] ──queue──► [sort.0] ──queue──► [out.0]        CopyRuntime per copy
//!             └─queue──► [sort.1] ──queue──┘                + supervisor thread
//! ```
//!
//! # Design
//!
//! - **Thread per copy**: a slow consumer backs up only the branch feeding it.
//! - **Per-copy routers**: round-robin cursors and partition key indexes are
//!   owned by each producing copy, so routing never takes a lock.
//! - **Explicit context**: the registry and engine config are values passed
//!   to the scheduler; nothing is global.

pub mod compiled_plan;
pub mod compiler;
pub mod executor;
pub mod graph;
pub mod id;
pub mod node;
pub mod nodes;
pub mod partition;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod status;

pub use compiled_plan::{CompiledPlan, EdgeLayout, PlanStats, PlannedEdge, PlannedNode};
pub use compiler::GraphCompiler;
pub use executor::{Run, RunLog, Scheduler};
pub use graph::{ConfigValue, EdgeDef, EdgeTransport, Graph, NodeConfig, NodeDef};
pub use id::{CopyId, EdgeId, NodeId, RunId};
pub use node::{
    Flow, InitContext, InputInfo, NodeImpl, RowIo, ERROR_DESCRIPTION_FIELD, ERROR_NODE_FIELD,
    MAX_REJECTED,
};
pub use partition::{Distribution, OutputRouter, PartitionMethod, PartitionScheme, Target};
pub use queue::{Poll, ReadySignal, RowQueue};
pub use registry::{NodeFactory, NodeRegistry};
pub use runtime::{RunControl, StopSignal};
pub use status::{CopyState, CopyStatus, ErrorKind, RunError, RunState, RunStatus};
