//! Execution host: runs sub-graphs on behalf of remote coordinators.
//!
//! One thread accepts connections; each connection gets its own thread that
//! answers requests until the client hangs up. Runs live in a table keyed by
//! [`RunId`] until they are released, or until they have sat ended (or
//! unstarted) for `cluster.run_retention_secs`.

use super::protocol::{read_message, write_message, Request, Response};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::executor::{Run, Scheduler};
use crate::pipeline::id::RunId;
use crate::pipeline::registry::NodeRegistry;
use crate::transport::wire::io_error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_POLL: Duration = Duration::from_millis(200);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);
const EVICT_EVERY: Duration = Duration::from_secs(1);

/// A run in the host's table
struct HeldRun {
    run: Arc<Run>,
    submitted: Instant,
    /// First time the run was seen ended
    ended: Option<Instant>,
}

impl HeldRun {
    fn expired(&mut self, now: Instant, retention: Duration) -> bool {
        if self.ended.is_none() && self.run.is_finished() {
            self.ended = Some(now);
        }
        let since = match self.ended {
            Some(ended) => ended,
            None if !self.run.is_started() => self.submitted,
            None => return false,
        };
        now.saturating_duration_since(since) >= retention
    }
}

/// Holds runs and answers control requests
pub struct ExecutionHost {
    registry: NodeRegistry,
    config: EngineConfig,
    runs: Mutex<HashMap<RunId, HeldRun>>,
    next_id: AtomicU64,
}

impl ExecutionHost {
    pub fn new(registry: NodeRegistry, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            runs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of runs currently held.
    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    fn run(&self, id: RunId) -> Result<Arc<Run>> {
        self.runs
            .lock()
            .get(&id)
            .map(|held| held.run.clone())
            .ok_or(EngineError::UnknownRun(id.0))
    }

    /// Drop runs past their retention period; returns how many went.
    ///
    /// Unstarted runs count from submission. A run that was stopped but has
    /// not finished its teardown is kept.
    pub fn evict_expired(&self) -> usize {
        let retention = self.config.cluster.run_retention();
        let now = Instant::now();
        let expired: Vec<(RunId, Arc<Run>)> = {
            let mut runs = self.runs.lock();
            let ids: Vec<RunId> = runs
                .iter_mut()
                .filter_map(|(id, held)| held.expired(now, retention).then_some(*id))
                .collect();
            ids.into_iter()
                .filter_map(|id| runs.remove(&id).map(|held| (id, held.run)))
                .collect()
        };
        for (id, run) in &expired {
            run.stop();
            tracing::info!("Evicted {} ('{}') after {:?}", id, run.name(), retention);
        }
        expired.len()
    }

    /// Answer one request.
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Request refused: {}", e);
                Response::refused(&e)
            }
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Submit { graph, config } => {
                let config = config.unwrap_or_else(|| self.config.clone());
                let scheduler = Scheduler::new(self.registry.clone(), config);
                let run = scheduler.prepare(&graph)?;
                let run_id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed));
                tracing::info!("Accepted graph '{}' as {}", graph.name, run_id);
                self.runs.lock().insert(
                    run_id,
                    HeldRun {
                        run: Arc::new(run),
                        submitted: Instant::now(),
                        ended: None,
                    },
                );
                Ok(Response::Submitted { run_id })
            }
            Request::Start { run_id } => {
                self.run(run_id)?.start()?;
                Ok(Response::Ok)
            }
            Request::Status { run_id } => Ok(Response::Status {
                status: self.run(run_id)?.status(),
            }),
            Request::Stop { run_id } => {
                self.run(run_id)?.stop();
                Ok(Response::Ok)
            }
            Request::Pause { run_id } => {
                self.run(run_id)?.pause();
                Ok(Response::Ok)
            }
            Request::Resume { run_id } => {
                self.run(run_id)?.resume();
                Ok(Response::Ok)
            }
            Request::Ping => Ok(Response::Pong {
                runs: self.run_count(),
            }),
            Request::Logs { run_id } => Ok(Response::Logs {
                lines: self.run(run_id)?.log_lines(),
            }),
            Request::Release { run_id } => {
                let run = self
                    .runs
                    .lock()
                    .remove(&run_id)
                    .map(|held| held.run)
                    .ok_or(EngineError::UnknownRun(run_id.0))?;
                if !run.is_finished() {
                    run.stop();
                }
                tracing::info!("Released {}", run_id);
                Ok(Response::Ok)
            }
        }
    }

    /// Listen on `addr` and serve requests on background threads.
    pub fn serve(self: Arc<Self>, addr: &str) -> Result<HostServer> {
        let listener = TcpListener::bind(addr).map_err(io_error)?;
        listener.set_nonblocking(true).map_err(io_error)?;
        let local = listener.local_addr().map_err(io_error)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        tracing::info!("Execution host listening on {}", local);

        let accept = {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("host accept".into())
                .spawn(move || accept_loop(self, listener, shutdown))
                .map_err(EngineError::Io)?
        };

        Ok(HostServer {
            addr: local,
            shutdown,
            accept: Some(accept),
        })
    }
}

fn accept_loop(host: Arc<ExecutionHost>, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    let mut last_sweep = Instant::now();
    while !shutdown.load(Ordering::Acquire) {
        if last_sweep.elapsed() >= EVICT_EVERY {
            host.evict_expired();
            last_sweep = Instant::now();
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("Control connection from {}", peer);
                let (host, shutdown) = (host.clone(), shutdown.clone());
                let spawned = thread::Builder::new()
                    .name(format!("host conn {}", peer))
                    .spawn(move || {
                        if let Err(e) = serve_connection(&host, stream, &shutdown) {
                            tracing::debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(e) => tracing::error!("Cannot serve {}: {}", peer, e),
                }
                connections.retain(|h| !h.is_finished());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    for handle in connections {
        let _ = handle.join();
    }

    // Stop whatever is still executing
    let runs: Vec<_> = host.runs.lock().drain().map(|(_, held)| held.run).collect();
    for run in &runs {
        run.stop();
    }
    for run in &runs {
        run.wait_until_finished();
    }
}

fn serve_connection(host: &ExecutionHost, stream: TcpStream, shutdown: &AtomicBool) -> Result<()> {
    stream.set_nonblocking(false).map_err(io_error)?;
    let mut reader = BufReader::new(stream.try_clone().map_err(io_error)?);
    let mut writer = BufWriter::new(stream);

    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        // Only the length prefix may time out; a started message is read fully
        if reader.buffer().is_empty() && !wait_readable(reader.get_ref(), shutdown)? {
            return Ok(());
        }
        let request: Request = match read_message(&mut reader)? {
            Some(request) => request,
            None => return Ok(()),
        };
        tracing::debug!("Request: {:?}", RequestLabel(&request));
        let response = host.handle(request);
        write_message(&mut writer, &response)?;
    }
}

/// Block until the peer sent something or hung up. `false` on shutdown.
fn wait_readable(stream: &TcpStream, shutdown: &AtomicBool) -> Result<bool> {
    let mut peeked = [0u8; 1];
    stream.set_read_timeout(Some(READ_POLL)).map_err(io_error)?;
    loop {
        match stream.peek(&mut peeked) {
            Ok(_) => {
                stream
                    .set_read_timeout(Some(MESSAGE_TIMEOUT))
                    .map_err(io_error)?;
                return Ok(true);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if shutdown.load(Ordering::Acquire) {
                    return Ok(false);
                }
            }
            Err(e) => return Err(io_error(e)),
        }
    }
}

/// Request without the graph body, for logging
struct RequestLabel<'a>(&'a Request);

impl std::fmt::Debug for RequestLabel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Request::Submit { graph, .. } => write!(f, "Submit({})", graph.name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Handle of a listening host. Dropping it shuts the host down.
pub struct HostServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl HostServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, close connections and stop every held run.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
            tracing::info!("Execution host on {} shut down", self.addr);
        }
    }

    /// Block until the host is shut down from elsewhere.
    pub fn join(mut self) {
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
