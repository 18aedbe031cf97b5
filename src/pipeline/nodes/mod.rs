//! Built-in node types.
//!
//! These carry no business logic; they exist so graphs can be run end to end
//! and rows can cross hosts without custom code.

pub mod discard;
pub mod generator;
pub mod log;
pub mod pass_through;
pub mod socket;

pub use discard::DiscardNode;
pub use generator::GeneratorNode;
pub use log::LogNode;
pub use pass_through::PassThroughNode;
pub use socket::{SocketReaderNode, SocketWriterNode};

pub const GENERATOR: &str = "generator";
pub const PASS_THROUGH: &str = "pass-through";
pub const DISCARD: &str = "discard";
pub const LOG: &str = "log";
pub const SOCKET_WRITER: &str = "socket-writer";
pub const SOCKET_READER: &str = "socket-reader";
