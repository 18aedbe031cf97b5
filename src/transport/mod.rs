//! Cluster transport.
//!
//! Extends the queue abstraction across a process boundary:
//!
//! - [`wire`]: the byte format of schema, row and terminal frames
//! - [`stream`]: buffered row readers/writers over any byte stream
//! - [`pump`]: threads that move rows between a local queue and a socket

pub mod pump;
pub mod stream;
pub mod wire;

pub use pump::{loopback_pair, receive_queue, send_queue};
pub use stream::{Interruptible, RowStreamReader, RowStreamWriter};
