//! Control plane for runs spread over several processes.
//!
//! An [`ExecutionHost`] holds runs submitted by remote coordinators and
//! answers [`Request`]s over TCP. A coordinator talks to it through a
//! [`HostClient`], and watches the remote parts of a job with
//! [`RemoteRunWatcher`]s inside a [`DistributedRun`].
//!
//! Row data never crosses the control plane: sub-graphs exchange rows through
//! `socket-writer`/`socket-reader` nodes using the [`transport`](crate::transport)
//! wire format.

pub mod client;
pub mod host;
pub mod protocol;
pub mod watcher;

pub use client::HostClient;
pub use host::{ExecutionHost, HostServer};
pub use protocol::{Refusal, Request, Response};
pub use watcher::{DistributedRun, DistributedStatus, RemoteControl, RemoteHost, RemoteRunWatcher};
