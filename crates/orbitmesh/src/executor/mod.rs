// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AgentExecutor: orchestrates sessions end to end.
//!
//! One monitor task per live session consumes its adapter's events, feeds
//! the terminal runtime and extractor, persists diffs, and publishes to the
//! hub. The executor itself handles the control surface — start, stop,
//! pause, resume, recovery at startup, health checks, and deadline-bounded
//! shutdown.

pub mod health;
pub mod monitor;
pub mod recovery;

pub use recovery::RecoveryReport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attempt::{AttemptRegistry, RunAttempt};
use crate::config::{Config, SessionOptions};
use crate::extract::{Extractor, ProfileSpec};
use crate::hub::Hub;
use crate::id;
use crate::ledger::{ActivityLedger, ByteLedger};
use crate::provider::{
    LaunchSpec, Provider, ProviderError, ProviderEvent, ProviderFactory, ProviderKind,
};
use crate::screen::ScreenSnapshot;
use crate::session::{Session, SessionState, StateError};
use crate::snapshot::SnapshotProvider;
use crate::store::{BlobStore, StoreError};
use crate::terminal::{TerminalError, TerminalKind, TerminalRuntime};
use crate::wire::{EnvelopeType, InboundMessage, Topic};

/// Upper bound on any single provider operation.
pub(crate) const PROVIDER_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a launch waits for the adapter to report `running`.
pub(crate) const START_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors surfaced by executor operations.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("session not found: {id}")]
    NotFound { id: String },
    #[error("session {id} already exists")]
    AlreadyExists { id: String },
    #[error("session {id} is already terminal ({state})")]
    AlreadyTerminal { id: String, state: SessionState },
    #[error("session {id} is not terminal ({state}); stop it before removal")]
    NotTerminal { id: String, state: SessionState },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
}

/// Input to `start_session`.
#[derive(Debug, Clone, Default)]
pub struct StartSessionRequest {
    /// Explicit session id; generated when absent.
    pub session_id: Option<String>,
    /// Command line for the provider (PTY and native variants).
    pub command: Vec<String>,
    pub options: SessionOptions,
    /// Task reference handed to the session (and to protocol providers as
    /// the first prompt).
    pub task: Option<String>,
    pub title: Option<String>,
    pub cwd: Option<PathBuf>,
    pub provider_id: Option<String>,
    pub agent_id: Option<String>,
    pub project_id: Option<String>,
    /// Extractor rule profiles to match against the launch identity.
    pub profiles: Vec<ProfileSpec>,
}

/// Runtime state of one live session.
pub(crate) struct LiveSession {
    pub entity: Arc<Mutex<Session>>,
    pub provider: Arc<Mutex<Box<dyn Provider>>>,
    pub attempt: Arc<Mutex<RunAttempt>>,
    pub terminal: Option<Arc<TerminalRuntime>>,
    pub cancel: CancellationToken,
    pub monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Report from `shutdown`.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: usize,
    /// Sessions that had to be force-killed past the deadline.
    pub forced: Vec<String>,
}

/// The session execution and streaming core.
pub struct AgentExecutor {
    config: Config,
    store: BlobStore,
    hub: Arc<Hub>,
    factory: ProviderFactory,
    attempts: Arc<AttemptRegistry>,
    live: Arc<RwLock<HashMap<String, Arc<LiveSession>>>>,
    shutdown: CancellationToken,
}

impl AgentExecutor {
    fn build(config: Config, factory: ProviderFactory) -> anyhow::Result<Self> {
        let store = BlobStore::open(config.resolved_base_dir())?;
        let attempts = Arc::new(AttemptRegistry::new(store.clone()));
        Ok(Self {
            config,
            store,
            hub: Arc::new(Hub::new()),
            factory,
            attempts,
            live: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self::build(config, ProviderFactory::with_defaults())?))
    }

    /// Same, with a custom provider factory (tests, embedders).
    pub fn with_factory(config: Config, factory: ProviderFactory) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self::build(config, factory)?))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn attempts(&self) -> &Arc<AttemptRegistry> {
        &self.attempts
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn snapshot_provider(&self) -> SnapshotProvider {
        SnapshotProvider::new(self.store.clone(), Arc::clone(&self.hub))
    }

    /// Process-wide startup: recover prior sessions, then schedule the
    /// health checker and hub heartbeat.
    pub async fn startup(self: &Arc<Self>) -> anyhow::Result<RecoveryReport> {
        let report = recovery::run(self).await?;

        tokio::spawn(health::run(Arc::clone(self), self.shutdown.clone()));
        tokio::spawn(Arc::clone(&self.hub).run_heartbeat(self.shutdown.clone()));

        info!(
            resumed = report.resumed.len(),
            unresumable = report.unresumable.len(),
            warnings = report.warnings.len(),
            "startup recovery complete"
        );
        Ok(report)
    }

    /// Launch a new session. Returns its id once the adapter reports
    /// running; on failure the session lands in `error` and the error is
    /// returned.
    pub async fn start_session(
        self: &Arc<Self>,
        kind: ProviderKind,
        request: StartSessionRequest,
    ) -> Result<String, ExecutorError> {
        // 1-2. Validate and allocate the session id.
        let session_id = match request.session_id {
            Some(ref id) => id::validate(id).map_err(StoreError::from)?.to_owned(),
            None => id::generate(),
        };
        if self.live.read().await.contains_key(&session_id) {
            return Err(ExecutorError::AlreadyExists { id: session_id });
        }
        match self.store.load_session(&session_id) {
            Err(e) if e.is_not_found() => {}
            Ok(_) => return Err(ExecutorError::AlreadyExists { id: session_id }),
            Err(e) => return Err(e.into()),
        }

        let cwd = request
            .cwd
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        // 3. Create and persist the entity.
        let mut session = Session::new(&session_id, kind, cwd.clone());
        session.provider_id = request.provider_id.clone();
        session.agent_id = request.agent_id.clone();
        session.project_id = request.project_id.clone();
        session.current_task = request.task.clone();
        session.command = request.command.clone();
        session.options = request.options.clone();
        if let Some(title) = request.title.clone() {
            session.title = title;
        }
        self.store.save_session(&session)?;

        // 4. Run attempt, persisted before any process exists.
        let attempt = self.attempts.begin(&session_id, kind)?;

        // 5. Construct the adapter.
        let spec = LaunchSpec {
            session_id: session_id.clone(),
            cwd,
            command: request.command.clone(),
            options: request.options.clone(),
            cols: self.config.cols,
            rows: self.config.rows,
            initial_prompt: request.task.clone(),
            resume_from: None,
        };
        let mut provider = match self.factory.create(kind, &spec) {
            Ok(provider) => provider,
            Err(e) => {
                self.fail_launch(&mut session, &attempt, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        // 6. created → starting.
        session.transition(SessionState::Starting, "launch")?;
        self.store.save_session(&session)?;
        self.publish_state(&session, "launch").await;

        // 7-8. Start the adapter and wait for it to come up.
        let cancel = self.shutdown.child_token();
        let started = tokio::time::timeout(START_TIMEOUT, provider.start(cancel.clone())).await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.fail_launch(&mut session, &attempt, &e.to_string()).await?;
                return Err(e.into());
            }
            Err(_) => {
                self.fail_launch(&mut session, &attempt, "start timed out").await?;
                return Err(ExecutorError::Timeout { op: "start", timeout: START_TIMEOUT });
            }
        }

        let mut events = match provider.take_events() {
            Some(events) => events,
            None => {
                self.fail_launch(&mut session, &attempt, "adapter produced no event stream")
                    .await?;
                return Err(ProviderError::Protocol("no event stream".to_owned()).into());
            }
        };

        let first = tokio::time::timeout(START_TIMEOUT, events.recv()).await;
        let mut attempt = attempt;
        match first {
            Ok(Some(ProviderEvent::Started { provider_session_id })) => {
                self.attempts.record_provider_id(&mut attempt, provider_session_id)?;
            }
            Ok(Some(ProviderEvent::Errored { detail })) => {
                self.fail_launch(&mut session, &attempt, &detail).await?;
                return Err(ProviderError::Refused { op: "start", detail }.into());
            }
            Ok(Some(ProviderEvent::Exited { code, signal })) => {
                let detail = format!("exited during start (code={code:?}, signal={signal:?})");
                self.fail_launch(&mut session, &attempt, &detail).await?;
                return Err(ProviderError::Refused { op: "start", detail }.into());
            }
            Ok(Some(_)) | Ok(None) | Err(_) => {
                let detail = "adapter did not report startup".to_owned();
                self.fail_launch(&mut session, &attempt, &detail).await?;
                return Err(ProviderError::Refused { op: "start", detail }.into());
            }
        }

        session.transition(SessionState::Running, "provider-started")?;
        self.store.save_session(&session)?;
        self.publish_state(&session, "provider-started").await;

        // 9. Terminal runtime for terminal-owning providers.
        let terminal = if provider.owns_terminal() {
            let bytelog = ByteLedger::open(&self.store.bytelog_path(&session_id)?)
                .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
            Some(Arc::new(TerminalRuntime::new(
                session_id.clone(),
                session_id.clone(),
                TerminalKind::Pty,
                self.config.cols,
                self.config.rows,
                Some(bytelog),
                provider.terminal_input(),
                self.config.raw_input,
            )))
        } else {
            None
        };

        // 10. Extractor with profile selection; invalid profiles become
        // warning envelopes, the launch proceeds.
        let mut extractor = Extractor::new(&session_id);
        let (launch_command, launch_args) = spec.launch_identity();
        for error in extractor.load_profiles(&request.profiles, &launch_command, &launch_args) {
            warn!(session = %session_id, error = %error, "extractor profile rejected");
            self.hub
                .publish(
                    &Topic::SessionsActivity(session_id.clone()),
                    EnvelopeType::ExtractorWarning,
                    serde_json::json!({ "session": session_id, "detail": error.to_string() }),
                )
                .await;
        }

        let activity = ActivityLedger::open(&self.store.activity_path(&session_id)?)
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;

        // 11-12. Register the live session and spawn its monitor.
        let live = Arc::new(LiveSession {
            entity: Arc::new(Mutex::new(session)),
            provider: Arc::new(Mutex::new(provider)),
            attempt: Arc::new(Mutex::new(attempt)),
            terminal,
            cancel: cancel.clone(),
            monitor: Mutex::new(None),
        });
        self.live.write().await.insert(session_id.clone(), Arc::clone(&live));

        let handle = monitor::spawn(Arc::clone(self), session_id.clone(), Arc::clone(&live), events, extractor, activity);
        *live.monitor.lock().await = Some(handle);

        Ok(session_id)
    }

    /// Mark a failed launch: session to `error`, attempt closed.
    async fn fail_launch(
        &self,
        session: &mut Session,
        attempt: &RunAttempt,
        detail: &str,
    ) -> Result<(), ExecutorError> {
        if session.transition(SessionState::Error, detail).is_ok() {
            self.store.save_session(session)?;
        }
        let mut attempt = attempt.clone();
        self.attempts.finish(&mut attempt, "launch-failed")?;
        self.publish_state(session, detail).await;
        Ok(())
    }

    /// Stop a session: `stopping` transition, graceful adapter stop, then
    /// kill on timeout. The monitor observes the exit and finishes the
    /// bookkeeping.
    pub async fn stop_session(&self, id: &str) -> Result<(), ExecutorError> {
        let live = self.live_session(id).await?;

        {
            let mut session = live.entity.lock().await;
            if session.is_terminal() {
                return Err(ExecutorError::AlreadyTerminal { id: id.to_owned(), state: session.state });
            }
            session.transition(SessionState::Stopping, "stop-requested")?;
            let copy = session.clone();
            drop(session);
            self.store.save_session(&copy)?;
            self.publish_state(&copy, "stop-requested").await;
        }

        let timeout = self.config.shutdown_timeout();
        let stopped = {
            let mut provider = live.provider.lock().await;
            tokio::time::timeout(timeout, provider.stop()).await
        };
        match stopped {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(session = id, error = %e, "graceful stop failed, killing");
                live.provider.lock().await.kill()?;
                Ok(())
            }
            Err(_) => {
                warn!(session = id, "stop deadline exceeded, killing");
                live.provider.lock().await.kill()?;
                Err(ExecutorError::Timeout { op: "stop", timeout })
            }
        }
    }

    pub async fn pause_session(&self, id: &str) -> Result<(), ExecutorError> {
        let live = self.live_session(id).await?;

        {
            let mut session = live.entity.lock().await;
            session.transition(SessionState::Paused, "pause-requested")?;
            let copy = session.clone();
            drop(session);
            self.store.save_session(&copy)?;
            self.publish_state(&copy, "pause-requested").await;
        }

        let result = {
            let mut provider = live.provider.lock().await;
            tokio::time::timeout(PROVIDER_OP_TIMEOUT, provider.pause()).await
        };
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // Provider refusal: roll the entity back to running.
                self.revert_pause(&live, &e).await?;
                Err(e.into())
            }
            Err(_) => Err(ExecutorError::Timeout { op: "pause", timeout: PROVIDER_OP_TIMEOUT }),
        }
    }

    async fn revert_pause(
        &self,
        live: &LiveSession,
        error: &ProviderError,
    ) -> Result<(), ExecutorError> {
        let mut session = live.entity.lock().await;
        let reason = format!("pause refused: {error}");
        if session.transition(SessionState::Running, &reason).is_ok() {
            let copy = session.clone();
            drop(session);
            self.store.save_session(&copy)?;
            self.publish_state(&copy, &reason).await;
        }
        Ok(())
    }

    pub async fn resume_session(&self, id: &str) -> Result<(), ExecutorError> {
        let live = self.live_session(id).await?;

        let result = {
            let mut provider = live.provider.lock().await;
            tokio::time::timeout(PROVIDER_OP_TIMEOUT, provider.resume()).await
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(ExecutorError::Timeout { op: "resume", timeout: PROVIDER_OP_TIMEOUT })
            }
        }

        let mut session = live.entity.lock().await;
        session.transition(SessionState::Running, "resume-requested")?;
        let copy = session.clone();
        drop(session);
        self.store.save_session(&copy)?;
        self.publish_state(&copy, "resume-requested").await;
        Ok(())
    }

    /// Session snapshot: the live entity when running, the stored one
    /// otherwise.
    pub async fn get_session(&self, id: &str) -> Result<Session, ExecutorError> {
        if let Some(live) = self.live.read().await.get(id) {
            return Ok(live.entity.lock().await.clone());
        }
        match self.store.load_session(id) {
            Ok(session) => Ok(session),
            Err(e) if e.is_not_found() => Err(ExecutorError::NotFound { id: id.to_owned() }),
            Err(e) => Err(e.into()),
        }
    }

    /// All sessions, live entities taking precedence over stored rows.
    pub async fn list_sessions(&self) -> Result<(Vec<Session>, Vec<String>), ExecutorError> {
        let outcome = self.store.list_sessions()?;
        let errors = outcome.errors.iter().map(|e| e.to_string()).collect();

        let live = self.live.read().await;
        let mut sessions = Vec::with_capacity(outcome.items.len());
        for stored in outcome.items {
            match live.get(&stored.id) {
                Some(entry) => sessions.push(entry.entity.lock().await.clone()),
                None => sessions.push(stored),
            }
        }
        Ok((sessions, errors))
    }

    pub async fn derive_session_state(&self, id: &str) -> Result<SessionState, ExecutorError> {
        Ok(self.get_session(id).await?.derived_state())
    }

    /// Latest terminal snapshot for a session.
    pub async fn terminal_snapshot(&self, id: &str) -> Result<ScreenSnapshot, ExecutorError> {
        if let Some(live) = self.live.read().await.get(id) {
            if let Some(ref terminal) = live.terminal {
                return Ok(terminal.snapshot().await);
            }
        }
        // Fall back to the persisted record.
        match self.store.load_terminal(id) {
            Ok(record) => Ok(ScreenSnapshot {
                lines: record.last_snapshot.lines,
                cols: record.last_snapshot.cols,
                rows: record.last_snapshot.rows,
                alt_screen: false,
                cursor: Default::default(),
                sequence: record.last_seq,
            }),
            Err(e) if e.is_not_found() => Err(ExecutorError::NotFound { id: id.to_owned() }),
            Err(e) => Err(e.into()),
        }
    }

    /// Deliver dashboard input to a session's terminal.
    pub async fn send_input(
        &self,
        id: &str,
        client: &str,
        message: &InboundMessage,
    ) -> Result<(), ExecutorError> {
        let live = self.live_session(id).await?;
        let terminal = live.terminal.as_ref().ok_or(TerminalError::NoInputSink)?;
        terminal.apply_input(client, message).await?;
        Ok(())
    }

    /// Remove a terminal-state session and everything it owns.
    pub async fn remove_session(&self, id: &str) -> Result<(), ExecutorError> {
        let session = self.get_session(id).await?;
        if !session.is_terminal() {
            return Err(ExecutorError::NotTerminal { id: id.to_owned(), state: session.state });
        }

        self.live.write().await.remove(id);
        self.store.delete_session(id)?;
        let _ = std::fs::remove_file(self.store.activity_path(id)?);
        let _ = std::fs::remove_file(self.store.bytelog_path(id)?);
        match self.store.delete_terminal(id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        // Attempts and their tokens go with the session.
        for attempt in self.store.list_attempts(id)?.items {
            if let Some(ref token) = attempt.resume_token_id {
                let _ = self.store.delete_token(token);
            }
            let _ = self.store.delete_attempt(id, &attempt.attempt_id);
        }
        Ok(())
    }

    /// Graceful process shutdown within `deadline`; stragglers are killed.
    pub async fn shutdown(&self, deadline: Duration) -> anyhow::Result<ShutdownReport> {
        info!("shutdown: cancelling process context");
        self.shutdown.cancel();

        let live: Vec<(String, Arc<LiveSession>)> = {
            let map = self.live.read().await;
            map.iter().map(|(id, live)| (id.clone(), Arc::clone(live))).collect()
        };

        let mut report = ShutdownReport::default();
        let stops = live.iter().map(|(id, entry)| {
            let id = id.clone();
            let entry = Arc::clone(entry);
            async move {
                let result = {
                    let mut provider = entry.provider.lock().await;
                    tokio::time::timeout(deadline, provider.stop()).await
                };
                let forced = !matches!(result, Ok(Ok(())));
                if forced {
                    warn!(session = %id, "shutdown deadline exceeded, killing adapter");
                    let _ = entry.provider.lock().await.kill();
                }
                (id, entry, forced)
            }
        });

        for (id, entry, forced) in futures_join_all(stops).await {
            if forced {
                report.forced.push(id.clone());
            } else {
                report.stopped += 1;
            }

            // Persist final snapshots.
            let session = entry.entity.lock().await.clone();
            self.store.save_session(&session)?;
            if let Some(ref terminal) = entry.terminal {
                self.store.save_terminal(&terminal.to_record().await)?;
            }
            let mut attempt = entry.attempt.lock().await;
            if attempt.is_open() {
                self.attempts.finish(&mut attempt, "shutdown")?;
            }
        }

        self.live.write().await.clear();
        Ok(report)
    }

    pub(crate) async fn live_session(&self, id: &str) -> Result<Arc<LiveSession>, ExecutorError> {
        id::validate(id).map_err(StoreError::from)?;
        match self.live.read().await.get(id) {
            Some(live) => Ok(Arc::clone(live)),
            None => {
                // Distinguish "exists but not live" from "unknown".
                match self.store.load_session(id) {
                    Ok(session) => Err(ExecutorError::AlreadyTerminal {
                        id: id.to_owned(),
                        state: session.state,
                    }),
                    Err(e) if e.is_not_found() => {
                        Err(ExecutorError::NotFound { id: id.to_owned() })
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    pub(crate) async fn live_sessions(&self) -> Vec<(String, Arc<LiveSession>)> {
        let map = self.live.read().await;
        map.iter().map(|(id, live)| (id.clone(), Arc::clone(live))).collect()
    }

    pub(crate) async fn drop_live(&self, id: &str) {
        self.live.write().await.remove(id);
    }

    pub(crate) async fn insert_live(&self, id: String, live: Arc<LiveSession>) {
        self.live.write().await.insert(id, live);
    }

    /// Publish a `sessions.state` envelope for the session's current state.
    pub(crate) async fn publish_state(&self, session: &Session, reason: &str) {
        let (from, to) = session
            .transitions
            .last()
            .map(|t| (t.from.as_str(), t.to.as_str()))
            .unwrap_or(("created", session.state.as_str()));
        self.hub
            .publish(
                &Topic::SessionsState,
                EnvelopeType::SessionsState,
                serde_json::json!({
                    "session": session.id,
                    "from": from,
                    "to": to,
                    "state": session.state.as_str(),
                    "reason": reason,
                    "task": session.current_task,
                }),
            )
            .await;
    }
}

/// Await a set of futures concurrently, collecting their outputs.
///
/// Small local join to avoid pulling a futures crate for one call site.
async fn futures_join_all<F, T>(futures: impl IntoIterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(value) = handle.await {
            results.push(value);
        }
    }
    results
}
