//! Heartbeat watching of remote runs, and runs spread over several hosts.
//!
//! A [`RemoteRunWatcher`] polls one remote run's status at the heartbeat
//! interval. Any answer counts as a heartbeat; once the host has been silent
//! for the heartbeat timeout the watcher reports
//! [`TransportKind::HeartbeatTimeout`].
//!
//! A [`DistributedRun`] couples a local [`Run`] with its remote parts: the
//! first error anywhere (local copy, remote copy, lost host) stops all of
//! them.

use super::client::HostClient;
use crate::config::ClusterSettings;
use crate::error::{EngineError, Result, ResultExt, TransportKind};
use crate::pipeline::executor::Run;
use crate::pipeline::graph::Graph;
use crate::pipeline::id::RunId;
use crate::pipeline::status::{ErrorKind, RunError, RunState, RunStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What a watcher needs from a remote host
#[cfg_attr(test, mockall::automock)]
pub trait RemoteControl: Send {
    fn status(&mut self, run_id: RunId) -> Result<RunStatus>;
    fn stop(&mut self, run_id: RunId) -> Result<()>;
    /// Drop the run from the host's table.
    fn release(&mut self, run_id: RunId) -> Result<()>;
}

/// Control connection that reconnects after a failed call.
///
/// A timed-out call may leave an answer in flight, so the connection is
/// dropped on every error rather than reused.
pub struct RemoteHost {
    addr: String,
    settings: ClusterSettings,
    client: Option<HostClient>,
}

impl RemoteHost {
    pub fn new(addr: impl Into<String>, settings: ClusterSettings) -> Self {
        Self {
            addr: addr.into(),
            settings,
            client: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run `f` on a live connection, dropping it if `f` fails.
    pub fn with_client<T>(&mut self, f: impl FnOnce(&mut HostClient) -> Result<T>) -> Result<T> {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => self
                .client
                .insert(HostClient::connect(&self.addr, &self.settings)?),
        };
        let result = f(client);
        if result.is_err() {
            self.client = None;
        }
        result
    }

    /// Submit and start `graph`; returns the remote run id.
    pub fn launch(&mut self, graph: &Graph) -> Result<RunId> {
        self.with_client(|client| {
            let run_id = client.submit(graph, None)?;
            client.start(run_id)?;
            Ok(run_id)
        })
    }
}

impl RemoteControl for RemoteHost {
    fn status(&mut self, run_id: RunId) -> Result<RunStatus> {
        self.with_client(|c| c.status(run_id))
    }

    fn stop(&mut self, run_id: RunId) -> Result<()> {
        self.with_client(|c| c.stop(run_id))
    }

    fn release(&mut self, run_id: RunId) -> Result<()> {
        self.with_client(|c| c.release(run_id))
    }
}

/// Polls one remote run and detects a silent host
pub struct RemoteRunWatcher<C: RemoteControl> {
    control: C,
    run_id: RunId,
    label: String,
    interval: Duration,
    timeout: Duration,
    last_heard: Instant,
    last_status: Option<RunStatus>,
}

impl<C: RemoteControl> RemoteRunWatcher<C> {
    pub fn new(control: C, run_id: RunId, label: impl Into<String>, settings: &ClusterSettings) -> Self {
        Self {
            control,
            run_id,
            label: label.into(),
            interval: settings.heartbeat_interval(),
            timeout: settings.heartbeat_timeout(),
            last_heard: Instant::now(),
            last_status: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn last_status(&self) -> Option<&RunStatus> {
        self.last_status.as_ref()
    }

    /// One heartbeat.
    ///
    /// `Ok(Some(status))` when the host answered, `Ok(None)` when it did not
    /// but is still within the timeout, and a `HeartbeatTimeout` error once
    /// it has been silent for too long. Refusals (e.g. an unknown run) are
    /// returned as they are.
    pub fn poll(&mut self) -> Result<Option<RunStatus>> {
        match self.control.status(self.run_id) {
            Ok(status) => {
                self.last_heard = Instant::now();
                self.last_status = Some(status.clone());
                Ok(Some(status))
            }
            Err(e) if e.transport_kind().is_some() => {
                let silent = self.last_heard.elapsed();
                if silent >= self.timeout {
                    return Err(EngineError::transport(
                        TransportKind::HeartbeatTimeout,
                        format!("{} silent for {:?}: {}", self.label, silent, e),
                    ));
                }
                tracing::debug!("No heartbeat from {}: {}", self.label, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until the remote run ends or `cancel` returns true.
    ///
    /// Returns the final status, or the error that ended the watch.
    pub fn watch(&mut self, cancel: impl Fn() -> bool) -> Result<Option<RunStatus>> {
        loop {
            if let Some(status) = self.poll()? {
                if status.state.is_terminal() {
                    return Ok(Some(status));
                }
            }
            if cancel() {
                return Ok(self.last_status.clone());
            }
            thread::sleep(self.interval);
        }
    }

    /// Ask the remote host to stop the run.
    pub fn stop(&mut self) -> Result<()> {
        self.control.stop(self.run_id)
    }

    /// Tell the host it may forget the run.
    pub fn release(&mut self) -> Result<()> {
        self.control.release(self.run_id)
    }

    fn ended(&self) -> bool {
        self.last_status
            .as_ref()
            .is_some_and(|s| s.state.is_terminal())
    }
}

// ==================== Distributed run ====================

/// How a distributed run ended
#[derive(Debug, Clone, Serialize)]
pub struct DistributedStatus {
    pub local: RunStatus,
    /// Last status heard from each remote part, by label
    pub remotes: Vec<(String, Option<RunStatus>)>,
    pub error: Option<RunError>,
}

impl DistributedStatus {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && self.local.state == RunState::Finished
            && self
                .remotes
                .iter()
                .all(|(_, s)| s.as_ref().is_some_and(|s| s.state == RunState::Finished))
    }
}

struct Failure {
    failed: AtomicBool,
    first: Mutex<Option<RunError>>,
}

impl Failure {
    fn record(&self, error: RunError) {
        let mut first = self.first.lock();
        if first.is_none() {
            tracing::error!("Distributed run failed: {}", error);
            *first = Some(error);
        }
        self.failed.store(true, Ordering::Release);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// A local run plus remote runs, failing together
pub struct DistributedRun<C: RemoteControl + 'static = RemoteHost> {
    local: Arc<Run>,
    remotes: Vec<RemoteRunWatcher<C>>,
}

impl<C: RemoteControl + 'static> DistributedRun<C> {
    pub fn new(local: Run) -> Self {
        Self {
            local: Arc::new(local),
            remotes: Vec::new(),
        }
    }

    /// Add an already started remote run.
    pub fn add_remote(&mut self, watcher: RemoteRunWatcher<C>) {
        self.remotes.push(watcher);
    }

    pub fn local(&self) -> &Run {
        &self.local
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }
}

impl DistributedRun<RemoteHost> {
    /// Submit `graph` to the host at `addr`, start it and watch it.
    ///
    /// Remote parts are started before the local run so their socket
    /// writers are listening by the time local readers connect.
    pub fn launch_remote(
        &mut self,
        addr: &str,
        graph: &Graph,
        settings: &ClusterSettings,
    ) -> Result<RunId> {
        let mut host = RemoteHost::new(addr, settings.clone());
        let run_id = host
            .launch(graph)
            .with_context(|| format!("launching '{}' on {}", graph.name, addr))?;
        let label = format!("{}:{}", addr, run_id);
        tracing::info!("Remote part '{}' started as {}", graph.name, label);
        self.add_remote(RemoteRunWatcher::new(host, run_id, label, settings));
        Ok(run_id)
    }
}

impl<C: RemoteControl + 'static> DistributedRun<C> {
    /// Start the local run and watch everything until it ends.
    pub fn run(self) -> DistributedStatus {
        let failure = Arc::new(Failure {
            failed: AtomicBool::new(false),
            first: Mutex::new(None),
        });

        if let Err(e) = self.local.start() {
            failure.record(RunError::from_engine(self.local.name(), 0, &e));
        }

        let watchers: Vec<JoinHandle<(String, Option<RunStatus>)>> = self
            .remotes
            .into_iter()
            .map(|watcher| {
                let (failure, local) = (failure.clone(), self.local.clone());
                thread::spawn(move || watch_remote(watcher, &failure, &local))
            })
            .collect();

        self.local.wait_until_finished();
        let local = self.local.status();
        if let Some(error) = &local.error {
            failure.record(error.clone());
        }

        let remotes = watchers
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| ("?".to_string(), None)))
            .collect();
        let error = failure.first.lock().clone();
        DistributedStatus {
            local,
            remotes,
            error,
        }
    }
}

/// Watch one remote part until it ends, failing the whole run on errors.
fn watch_remote<C: RemoteControl>(
    mut watcher: RemoteRunWatcher<C>,
    failure: &Failure,
    local: &Run,
) -> (String, Option<RunStatus>) {
    let label = watcher.label().to_string();
    let fail = |error: RunError| {
        failure.record(error);
        local.stop();
    };

    loop {
        if failure.is_failed() {
            if let Err(e) = watcher.stop() {
                tracing::warn!("Could not stop {}: {}", label, e);
            }
            // Wait for the teardown so the report shows how the remote part
            // ended; a silent host ends this at the heartbeat timeout
            if let Err(e) = watcher.watch(|| false) {
                tracing::debug!("{} did not report its end: {}", label, e);
            }
            break;
        }
        match watcher.poll() {
            Ok(Some(status)) if status.state == RunState::Errored => {
                let error = status.error.clone().unwrap_or_else(|| RunError {
                    node: label.clone(),
                    copy: 0,
                    kind: ErrorKind::Node,
                    message: "remote run failed".into(),
                });
                fail(error);
            }
            Ok(Some(status)) if status.state.is_terminal() => break,
            Ok(_) => {}
            Err(e) => {
                fail(RunError::from_engine(&label, 0, &e));
                break;
            }
        }
        if !failure.is_failed() {
            thread::sleep(watcher.interval);
        }
    }

    // A host we lost track of evicts the run after its retention period
    if watcher.ended() {
        match watcher.release() {
            Ok(()) => tracing::debug!("Released {}", label),
            Err(e) => tracing::warn!("Could not release {}: {}", label, e),
        }
    }
    (label, watcher.last_status().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::status::RunState;

    fn settings(interval_ms: u64, timeout_ms: u64) -> ClusterSettings {
        ClusterSettings {
            heartbeat_interval_ms: interval_ms,
            heartbeat_timeout_ms: timeout_ms,
            ..Default::default()
        }
    }

    fn status(state: RunState) -> RunStatus {
        RunStatus {
            name: "remote".into(),
            state,
            copies: Vec::new(),
            error: None,
            started_at: None,
        }
    }

    #[test]
    fn test_answer_is_a_heartbeat() {
        let mut mock = MockRemoteControl::new();
        mock.expect_status()
            .returning(|_| Ok(status(RunState::Running)));
        let mut watcher = RemoteRunWatcher::new(mock, RunId(1), "host-a", &settings(1, 10));
        assert_eq!(watcher.poll().unwrap().unwrap().state, RunState::Running);
    }

    #[test]
    fn test_silence_becomes_heartbeat_timeout() {
        let mut mock = MockRemoteControl::new();
        mock.expect_status()
            .returning(|_| Err(EngineError::transport(TransportKind::Io, "timed out")));
        let mut watcher = RemoteRunWatcher::new(mock, RunId(1), "host-a", &settings(5, 30));

        assert!(watcher.poll().unwrap().is_none());
        thread::sleep(Duration::from_millis(40));
        let err = watcher.poll().unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportKind::HeartbeatTimeout));
        assert!(err.to_string().contains("host-a"));
    }

    #[test]
    fn test_refusal_is_not_silence() {
        let mut mock = MockRemoteControl::new();
        mock.expect_status()
            .returning(|id| Err(EngineError::UnknownRun(id.0)));
        let mut watcher = RemoteRunWatcher::new(mock, RunId(7), "host-a", &settings(5, 30));
        assert!(matches!(watcher.poll(), Err(EngineError::UnknownRun(7))));
    }

    fn local_run(rows: i64) -> Run {
        use crate::config::EngineConfig;
        use crate::pipeline::executor::Scheduler;
        use crate::pipeline::graph::NodeDef;
        use crate::pipeline::registry::NodeRegistry;

        let graph = Graph::new("local")
            .node(NodeDef::new("gen", "generator").with("rows", rows))
            .node(NodeDef::new("out", "discard"))
            .edge("gen", "out");
        Scheduler::new(NodeRegistry::with_builtins(), EngineConfig::default())
            .prepare(&graph)
            .unwrap()
    }

    #[test]
    fn test_finished_remote_is_released() {
        let mut mock = MockRemoteControl::new();
        mock.expect_status()
            .returning(|_| Ok(status(RunState::Finished)));
        mock.expect_release().times(1).returning(|_| Ok(()));

        let mut distributed = DistributedRun::new(local_run(10));
        distributed.add_remote(RemoteRunWatcher::new(mock, RunId(3), "host-a", &settings(1, 100)));
        let report = distributed.run();
        assert!(report.is_success(), "{:?}", report);
    }

    #[test]
    fn test_silent_remote_is_not_released() {
        let mut mock = MockRemoteControl::new();
        mock.expect_status()
            .returning(|_| Err(EngineError::transport(TransportKind::Io, "timed out")));
        mock.expect_release().never();

        let mut distributed = DistributedRun::new(local_run(i64::MAX));
        distributed.add_remote(RemoteRunWatcher::new(mock, RunId(3), "host-a", &settings(1, 20)));
        let report = distributed.run();
        assert_eq!(report.local.state, RunState::Stopped);
        assert_eq!(
            report.error.map(|e| e.kind),
            Some(ErrorKind::Transport(TransportKind::HeartbeatTimeout))
        );
        assert!(report.remotes[0].1.is_none());
    }

    #[test]
    fn test_watch_until_terminal() {
        let mut mock = MockRemoteControl::new();
        let mut calls = 0;
        mock.expect_status().returning(move |_| {
            calls += 1;
            Ok(status(if calls < 3 {
                RunState::Running
            } else {
                RunState::Finished
            }))
        });
        let mut watcher = RemoteRunWatcher::new(mock, RunId(1), "host-a", &settings(1, 100));
        let last = watcher.watch(|| false).unwrap().unwrap();
        assert_eq!(last.state, RunState::Finished);
    }
}
