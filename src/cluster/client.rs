//! Client side of the control plane.

use super::protocol::{read_message, write_message, Refusal, Request, Response};
use crate::config::{ClusterSettings, EngineConfig};
use crate::error::{EngineError, Result, TransportKind};
use crate::pipeline::graph::Graph;
use crate::pipeline::id::RunId;
use crate::pipeline::status::RunStatus;
use crate::transport::wire::{io_error, protocol};
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// One control connection to an [`ExecutionHost`](super::ExecutionHost)
pub struct HostClient {
    addr: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl HostClient {
    /// Connect using the cluster timeouts: `connect_timeout` to establish
    /// the connection, `heartbeat_timeout` for each answer.
    pub fn connect(addr: &str, settings: &ClusterSettings) -> Result<Self> {
        Self::connect_with(addr, settings.connect_timeout(), settings.heartbeat_timeout())
    }

    pub fn connect_with(
        addr: &str,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self> {
        let unreachable =
            |message: String| EngineError::transport(TransportKind::Unreachable, message);
        let target = addr
            .to_socket_addrs()
            .map_err(io_error)?
            .next()
            .ok_or_else(|| unreachable(format!("{} has no address", addr)))?;
        let stream = TcpStream::connect_timeout(&target, connect_timeout).map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::TimedOut => unreachable(format!("{}: {}", addr, e)),
                _ => io_error(e),
            }
        })?;
        stream.set_read_timeout(Some(reply_timeout)).map_err(io_error)?;
        stream.set_write_timeout(Some(reply_timeout)).map_err(io_error)?;
        stream.set_nodelay(true).map_err(io_error)?;
        tracing::debug!("Connected to execution host {}", target);
        Ok(Self {
            addr: target,
            reader: BufReader::new(stream.try_clone().map_err(io_error)?),
            writer: BufWriter::new(stream),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one request and wait for its answer.
    pub fn call(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.writer, request)?;
        match read_message(&mut self.reader)? {
            Some(response) => Ok(response),
            None => Err(EngineError::transport(
                TransportKind::Io,
                format!("host {} closed the connection", self.addr),
            )),
        }
    }

    /// Like [`HostClient::call`] but turns refusals into errors.
    fn checked(&mut self, request: Request) -> Result<Response> {
        let run_id = match &request {
            Request::Start { run_id }
            | Request::Status { run_id }
            | Request::Stop { run_id }
            | Request::Pause { run_id }
            | Request::Resume { run_id }
            | Request::Logs { run_id }
            | Request::Release { run_id } => Some(*run_id),
            Request::Submit { .. } | Request::Ping => None,
        };
        match self.call(&request)? {
            Response::Error { refusal, message } => Err(match (refusal, run_id) {
                (Refusal::UnknownRun, Some(id)) => EngineError::UnknownRun(id.0),
                (Refusal::Validation, _) => EngineError::InvalidGraph(message),
                _ => EngineError::RunState(message),
            }
            .with_context(format!("host {}", self.addr))),
            response => Ok(response),
        }
    }

    pub fn submit(&mut self, graph: &Graph, config: Option<&EngineConfig>) -> Result<RunId> {
        match self.checked(Request::Submit {
            graph: graph.clone(),
            config: config.cloned(),
        })? {
            Response::Submitted { run_id } => Ok(run_id),
            other => Err(unexpected(&other)),
        }
    }

    pub fn start(&mut self, run_id: RunId) -> Result<()> {
        self.expect_ok(Request::Start { run_id })
    }

    pub fn status(&mut self, run_id: RunId) -> Result<RunStatus> {
        match self.checked(Request::Status { run_id })? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub fn stop(&mut self, run_id: RunId) -> Result<()> {
        self.expect_ok(Request::Stop { run_id })
    }

    pub fn pause(&mut self, run_id: RunId) -> Result<()> {
        self.expect_ok(Request::Pause { run_id })
    }

    pub fn resume(&mut self, run_id: RunId) -> Result<()> {
        self.expect_ok(Request::Resume { run_id })
    }

    /// Heartbeat. Returns the number of runs the host holds.
    pub fn ping(&mut self) -> Result<usize> {
        match self.checked(Request::Ping)? {
            Response::Pong { runs } => Ok(runs),
            other => Err(unexpected(&other)),
        }
    }

    pub fn logs(&mut self, run_id: RunId) -> Result<Vec<String>> {
        match self.checked(Request::Logs { run_id })? {
            Response::Logs { lines } => Ok(lines),
            other => Err(unexpected(&other)),
        }
    }

    pub fn release(&mut self, run_id: RunId) -> Result<()> {
        self.expect_ok(Request::Release { run_id })
    }

    fn expect_ok(&mut self, request: Request) -> Result<()> {
        match self.checked(request)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> EngineError {
    protocol(format!("unexpected response {:?}", response))
}
