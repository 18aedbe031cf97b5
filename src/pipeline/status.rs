//! Run and copy status reporting.
//!
//! Everything here is a serialisable snapshot; the live counters sit in
//! [`CopyShared`](super::runtime::CopyShared) and are read with relaxed
//! atomics when a snapshot is taken.

use crate::error::{EngineError, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Prepared, not started yet
    Waiting,
    Running,
    Paused,
    /// Every copy reached a normal end of stream
    Finished,
    /// A stop was requested and every copy has exited
    Stopped,
    /// At least one copy failed
    Errored,
}

impl RunState {
    /// Whether the run can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Finished | RunState::Stopped | RunState::Errored
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Waiting => "Waiting",
            RunState::Running => "Running",
            RunState::Paused => "Paused",
            RunState::Finished => "Finished",
            RunState::Stopped => "Stopped",
            RunState::Errored => "Finished (with errors)",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one node copy
///
/// `Created -> Initialized -> Running -> {Finished | Stopped | Errored}`.
/// Disposal is tracked separately so the outcome stays visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CopyState {
    Created = 0,
    Initialized = 1,
    Running = 2,
    Finished = 3,
    Stopped = 4,
    Errored = 5,
}

impl CopyState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CopyState::Initialized,
            2 => CopyState::Running,
            3 => CopyState::Finished,
            4 => CopyState::Stopped,
            5 => CopyState::Errored,
            _ => CopyState::Created,
        }
    }

    /// The copy has left (or never entered) its run loop for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CopyState::Finished | CopyState::Stopped | CopyState::Errored
        )
    }
}

/// Category of a run's first error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The node implementation reported a failure
    Node,
    /// A node broke the queue contract
    Queue,
    /// Network failure, with the transport's own classification
    Transport(TransportKind),
    /// The node implementation panicked
    Panic,
}

/// First error of a run, with the failing node and copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub node: String,
    pub copy: usize,
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    /// Classify an engine error raised inside `node`/`copy`.
    pub fn from_engine(node: impl Into<String>, copy: usize, err: &EngineError) -> Self {
        let kind = if let Some(transport) = err.transport_kind() {
            ErrorKind::Transport(transport)
        } else if err.is_queue_protocol() {
            ErrorKind::Queue
        } else {
            ErrorKind::Node
        };
        Self {
            node: node.into(),
            copy,
            kind,
            message: err.to_string(),
        }
    }

    pub fn panic(node: impl Into<String>, copy: usize, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            copy,
            kind: ErrorKind::Panic,
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport(_))
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.node, self.copy, self.message)
    }
}

/// Counters and state of one node copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyStatus {
    pub node: String,
    pub copy: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_id: Option<String>,
    pub state: CopyState,
    pub disposed: bool,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub rows_skipped: u64,
    pub errors: u64,
    /// Rows waiting in this copy's input queues
    pub input_buffered: usize,
    /// Rows waiting in this copy's output queues
    pub output_buffered: usize,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

/// Snapshot of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub name: String,
    pub state: RunState,
    pub copies: Vec<CopyStatus>,
    pub error: Option<RunError>,
    pub started_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn copies_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a CopyStatus> + 'a {
        self.copies.iter().filter(move |c| c.node == node)
    }

    /// Rows read by all copies of `node`.
    pub fn rows_read(&self, node: &str) -> u64 {
        self.copies_of(node).map(|c| c.rows_read).sum()
    }

    /// Rows written by all copies of `node`.
    pub fn rows_written(&self, node: &str) -> u64 {
        self.copies_of(node).map(|c| c.rows_written).sum()
    }

    /// Rows rejected by all copies of `node`.
    pub fn rows_rejected(&self, node: &str) -> u64 {
        self.copies_of(node).map(|c| c.rows_rejected).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.copies.iter().map(|c| c.errors).sum()
    }
}
