//! Error handling for the rowflow engine
//!
//! This module defines the engine's error taxonomy and a Result alias for use
//! throughout the crate.
//!
//! # Categories
//!
//! - **Validation**: the graph is malformed; raised by `Scheduler::prepare`
//!   before any thread exists.
//! - **Node**: a node implementation failed in `init`, `process_one` or `dispose`.
//! - **Queue protocol**: a node broke the row set contract (schema mismatch,
//!   put after close).
//! - **Transport**: socket failures and lost remote hosts. These carry a
//!   [`TransportKind`] so operators can tell network trouble from logic bugs.

use thiserror::Error;

/// Distinguishes the different ways a cluster link can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportKind {
    /// Read or write on an established socket failed.
    Io,
    /// The peer sent bytes that do not follow the wire format.
    Protocol,
    /// The remote host could not be reached at all.
    Unreachable,
    /// The remote host stopped answering heartbeats.
    HeartbeatTimeout,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Io => "io",
            TransportKind::Protocol => "protocol",
            TransportKind::Unreachable => "unreachable",
            TransportKind::HeartbeatTimeout => "heartbeat timeout",
        };
        f.write_str(s)
    }
}

/// Main error type for rowflow operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// The node relation of a graph contains a cycle
    #[error("Cycle detected in graph: {0}")]
    Cycle(String),

    /// An edge references a node that is not part of the graph
    #[error("Dangling edge {from} -> {to}: unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    /// A partitioned node's copy count disagrees with its partition scheme
    #[error("Node '{node}' has {copies} copies but partition scheme '{scheme}' has {partitions} partitions")]
    PartitionMismatch {
        node: String,
        scheme: String,
        copies: usize,
        partitions: usize,
    },

    /// No constructor is registered for a node type
    #[error("Unknown node type '{node_type}' for node '{node}'")]
    UnknownNodeType { node: String, node_type: String },

    /// Any other structural problem with a graph
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A node implementation reported a failure
    #[error("Node '{node}' copy {copy}: {message}")]
    Node {
        node: String,
        copy: usize,
        message: String,
    },

    /// A row did not match the schema fixed on its queue
    #[error("Schema mismatch on {queue}: {message}")]
    SchemaMismatch { queue: String, message: String },

    /// A put was attempted on a queue that is done or aborted
    #[error("Queue {queue} is closed for writing")]
    QueueClosed { queue: String },

    /// A row value does not fit its field descriptor
    #[error("Row error: {0}")]
    Row(String),

    /// A partition could not be computed for a row
    #[error("Partition error: {0}")]
    Partition(String),

    /// Cluster link failure
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    /// A control request referenced a run the host does not know
    #[error("Unknown run {0}")]
    UnknownRun(u64),

    /// Operation is not allowed in the run's current state
    #[error("Invalid run state: {0}")]
    RunState(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build a transport error of the given kind
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        EngineError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Build a node error
    pub fn node(node: impl Into<String>, copy: usize, message: impl Into<String>) -> Self {
        EngineError::Node {
            node: node.into(),
            copy,
            message: message.into(),
        }
    }

    /// Whether this error was raised before execution began.
    pub fn is_validation(&self) -> bool {
        match self {
            EngineError::Cycle(_)
            | EngineError::DanglingEdge { .. }
            | EngineError::PartitionMismatch { .. }
            | EngineError::UnknownNodeType { .. }
            | EngineError::InvalidGraph(_) => true,
            EngineError::WithContext { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    /// The transport kind, if this is (or wraps) a transport error.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self {
            EngineError::Transport { kind, .. } => Some(*kind),
            EngineError::WithContext { source, .. } => source.transport_kind(),
            _ => None,
        }
    }

    /// Whether this is (or wraps) a put on a closed or aborted queue.
    pub fn is_queue_closed(&self) -> bool {
        match self {
            EngineError::QueueClosed { .. } => true,
            EngineError::WithContext { source, .. } => source.is_queue_closed(),
            _ => false,
        }
    }

    /// Whether this is (or wraps) a row set contract violation.
    pub fn is_queue_protocol(&self) -> bool {
        match self {
            EngineError::SchemaMismatch { .. } | EngineError::QueueClosed { .. } => true,
            EngineError::WithContext { source, .. } => source.is_queue_protocol(),
            _ => false,
        }
    }
}

/// Result type alias for rowflow operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| EngineError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EngineError::Io(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Cycle("a -> b -> a".to_string());
        assert_eq!(err.to_string(), "Cycle detected in graph: a -> b -> a");
    }

    #[test]
    fn test_error_with_context() {
        let err = EngineError::InvalidGraph("test".to_string());
        let with_ctx = err.with_context("Failed to prepare");
        assert!(with_ctx.to_string().contains("Failed to prepare"));
        assert!(with_ctx.is_validation());
    }

    #[test]
    fn test_transport_kind_survives_context() {
        let err = EngineError::transport(TransportKind::HeartbeatTimeout, "no answer")
            .with_context("remote run 3");
        assert_eq!(err.transport_kind(), Some(TransportKind::HeartbeatTimeout));
        assert!(err.to_string().contains("remote run 3"));
    }

    #[test]
    fn test_partition_mismatch_message() {
        let err = EngineError::PartitionMismatch {
            node: "agg".into(),
            scheme: "p4".into(),
            copies: 2,
            partitions: 4,
        };
        assert!(err.to_string().contains("2 copies"));
        assert!(err.to_string().contains("4 partitions"));
        assert!(!err.is_queue_protocol());
    }
}
