//! Socket writer/reader nodes: carry one row stream between hosts.
//!
//! The writer listens on `listen`, the reader connects to `connect`. The
//! handshake (accept/connect plus the schema frame) happens during `init`, so
//! by the time both runs pass their init barriers the reader already knows
//! the layout it must declare downstream.
//!
//! Writer settings: `listen` (required), `accept_timeout_ms` (30000).
//! Reader settings: `connect` (required), `connect_timeout_ms` (30000).

use crate::error::{EngineError, Result, TransportKind};
use crate::pipeline::node::{Flow, InitContext, NodeImpl, RowIo};
use crate::pipeline::runtime::StopSignal;
use crate::row::Schema;
use crate::transport::pump::POLL;
use crate::transport::stream::{Interruptible, RowStreamReader, RowStreamWriter};
use crate::transport::wire::io_error;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

type Link = Interruptible<TcpStream>;

fn stopped() -> EngineError {
    EngineError::transport(TransportKind::Io, "run stopped during handshake")
}

// ==================== Writer ====================

/// Sink that streams its input to one remote `socket-reader`
#[derive(Default)]
pub struct SocketWriterNode {
    writer: Option<RowStreamWriter<Link>>,
}

fn accept(listen: &str, timeout: Duration, stop: &StopSignal) -> Result<TcpStream> {
    let listener = TcpListener::bind(listen).map_err(io_error)?;
    listener.set_nonblocking(true).map_err(io_error)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false).map_err(io_error)?;
                tracing::debug!("Reader connected from {}", peer);
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if stop.is_stopped() {
                    return Err(stopped());
                }
                if Instant::now() >= deadline {
                    return Err(EngineError::transport(
                        TransportKind::Unreachable,
                        format!("no reader connected to {} within {:?}", listen, timeout),
                    ));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(io_error(e)),
        }
    }
}

impl NodeImpl for SocketWriterNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        let schema = ctx.common_input_schema()?;
        let listen = ctx.config.require_str("listen")?;
        let timeout = Duration::from_millis(
            ctx.config
                .count_or("accept_timeout_ms", DEFAULT_HANDSHAKE_TIMEOUT_MS)?,
        );

        let stream = accept(listen, timeout, &ctx.stop)?;
        let mut writer = RowStreamWriter::new(Interruptible::tcp(stream, ctx.stop.clone(), POLL)?);
        writer.write_schema(&schema)?;
        self.writer = Some(writer);
        Ok(None)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| EngineError::Row("socket writer used before init".into()))?;
        match io.read() {
            Some(row) => {
                writer.write(&row)?;
                Ok(Flow::Continue)
            }
            None if io.is_stopped() => Ok(Flow::Done),
            None => {
                writer.finish()?;
                tracing::debug!("Sent {} rows", writer.rows());
                Ok(Flow::Done)
            }
        }
    }

    fn stop_running(&mut self) {
        if let Some(writer) = &self.writer {
            let _ = writer.get_ref().get_ref().shutdown(Shutdown::Both);
        }
    }

    fn dispose(&mut self) -> Result<()> {
        self.writer = None;
        Ok(())
    }
}

// ==================== Reader ====================

/// Source that replays the stream of one remote `socket-writer`
#[derive(Default)]
pub struct SocketReaderNode {
    reader: Option<RowStreamReader<Link>>,
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(io_error)?
        .next()
        .ok_or_else(|| {
            EngineError::transport(
                TransportKind::Unreachable,
                format!("{} resolves to no address", addr),
            )
        })
}

fn connect(addr: &str, timeout: Duration, stop: &StopSignal) -> Result<TcpStream> {
    let target = resolve(addr)?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = remaining.clamp(Duration::from_millis(1), Duration::from_secs(1));
        match TcpStream::connect_timeout(&target, attempt) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if stop.is_stopped() {
                    return Err(stopped());
                }
                if Instant::now() >= deadline {
                    return Err(io_error(e).with_context(format!("connecting to {}", addr)));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

impl NodeImpl for SocketReaderNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        let addr = ctx.config.require_str("connect")?;
        let timeout = Duration::from_millis(
            ctx.config
                .count_or("connect_timeout_ms", DEFAULT_HANDSHAKE_TIMEOUT_MS)?,
        );

        let stream = connect(addr, timeout, &ctx.stop)?;
        let mut reader = RowStreamReader::new(Interruptible::tcp(stream, ctx.stop.clone(), POLL)?);
        let schema = reader.read_schema()?;
        tracing::debug!("Receiving [{}] from {}", schema, addr);
        self.reader = Some(reader);
        Ok(Some(schema))
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| EngineError::Row("socket reader used before init".into()))?;
        match reader.next_row()? {
            Some(row) => {
                io.write(row)?;
                Ok(Flow::Continue)
            }
            None => {
                tracing::debug!("Received {} rows", reader.rows());
                Ok(Flow::Done)
            }
        }
    }

    fn stop_running(&mut self) {
        if let Some(reader) = &self.reader {
            let _ = reader.get_ref().get_ref().shutdown(Shutdown::Both);
        }
    }

    fn dispose(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::runtime::RunControl;

    #[test]
    fn test_connect_refused_is_unreachable() {
        let control = Arc::new(RunControl::new(0, Vec::new()));
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect(
            &format!("127.0.0.1:{}", port),
            Duration::from_millis(100),
            &StopSignal::new(control),
        )
        .unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportKind::Unreachable));
    }

    #[test]
    fn test_accept_gives_up_when_stopped() {
        let control = Arc::new(RunControl::new(0, Vec::new()));
        control.stop();
        let err = accept("127.0.0.1:0", Duration::from_secs(5), &StopSignal::new(control))
            .unwrap_err();
        assert!(err.to_string().contains("run stopped"));
    }
}
