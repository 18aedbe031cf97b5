//! Control plane messages.
//!
//! Every message is a big-endian `u32` length followed by that many bytes of
//! JSON. A connection carries any number of request/response pairs, strictly
//! alternating.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::graph::Graph;
use crate::pipeline::id::RunId;
use crate::pipeline::status::RunStatus;
use crate::transport::wire::{io_error, protocol};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Largest accepted control message
pub const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

/// Sent by a [`HostClient`](super::HostClient)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Prepare a run; the host's config is used unless one is given.
    Submit {
        graph: Graph,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<EngineConfig>,
    },
    Start { run_id: RunId },
    Status { run_id: RunId },
    Stop { run_id: RunId },
    Pause { run_id: RunId },
    Resume { run_id: RunId },
    /// Heartbeat; answered with the number of runs held.
    Ping,
    Logs { run_id: RunId },
    /// Forget a run, stopping it first if it is still executing.
    Release { run_id: RunId },
}

/// Why the host refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refusal {
    /// The submitted graph failed validation
    Validation,
    UnknownRun,
    /// The run is not in a state that allows the request
    RunState,
    Other,
}

/// Sent by an [`ExecutionHost`](super::ExecutionHost)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Submitted { run_id: RunId },
    Ok,
    Status { status: RunStatus },
    Pong { runs: usize },
    Logs { lines: Vec<String> },
    Error { refusal: Refusal, message: String },
}

impl Response {
    /// Error response describing `err`.
    pub fn refused(err: &EngineError) -> Self {
        let refusal = match err {
            _ if err.is_validation() => Refusal::Validation,
            EngineError::UnknownRun(_) => Refusal::UnknownRun,
            EngineError::RunState(_) => Refusal::RunState,
            _ => Refusal::Other,
        };
        Response::Error {
            refusal,
            message: err.to_string(),
        }
    }
}

/// Write one length-prefixed JSON message and flush.
pub fn write_message<W: Write, T: Serialize>(w: &mut W, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&len| len <= MAX_MESSAGE_LEN)
        .ok_or_else(|| protocol(format!("control message of {} bytes", body.len())))?;
    w.write_all(&len.to_be_bytes()).map_err(io_error)?;
    w.write_all(&body).map_err(io_error)?;
    w.flush().map_err(io_error)
}

/// Read one message. `Ok(None)` means the peer closed the connection
/// cleanly between messages.
pub fn read_message<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_error(e)),
    }
    let len = u32::from_be_bytes(len);
    if len > MAX_MESSAGE_LEN {
        return Err(protocol(format!("control message of {} bytes exceeds limit", len)));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).map_err(io_error)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| protocol(format!("malformed control message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportKind;
    use crate::pipeline::graph::NodeDef;

    #[test]
    fn test_request_json_shape() {
        let json = serde_json::to_string(&Request::Stop { run_id: RunId(4) }).unwrap();
        assert_eq!(json, r#"{"request":"stop","run_id":4}"#);
        let json = serde_json::to_string(&Request::Ping).unwrap();
        assert_eq!(json, r#"{"request":"ping"}"#);
    }

    #[test]
    fn test_message_framing() {
        let request = Request::Submit {
            graph: Graph::new("g").node(NodeDef::new("a", "generator")),
            config: None,
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &request).unwrap();
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);

        let mut reader = buf.as_slice();
        let back: Option<Request> = read_message(&mut reader).unwrap();
        assert_eq!(back, Some(request));
        let end: Option<Request> = read_message(&mut reader).unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{{{");
        let err = read_message::<_, Response>(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportKind::Protocol));
    }

    #[test]
    fn test_refusal_classification() {
        let err = EngineError::Cycle("a -> a".into()).with_context("submit");
        assert!(matches!(
            Response::refused(&err),
            Response::Error { refusal: Refusal::Validation, .. }
        ));
        assert!(matches!(
            Response::refused(&EngineError::UnknownRun(3)),
            Response::Error { refusal: Refusal::UnknownRun, .. }
        ));
    }
}
