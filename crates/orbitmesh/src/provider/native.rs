// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Native-SDK provider: runs the SDK CLI as a plain subprocess in
//! structured-output mode and parses newline-delimited JSON events from its
//! stdout. No terminal is involved.
//!
//! This variant is resumable: the SDK reports a session id in its first
//! event, and a later launch with `resume_from` re-attaches by passing
//! `--resume <id>`.

use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ledger::MessageKind;

use super::{
    BoxFuture, LaunchSpec, Provider, ProviderError, ProviderEvent, ProviderMetrics, ProviderState,
    ProviderStatus,
};

/// Grace window between SIGTERM and SIGKILL during `stop`.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct Shared {
    state: Mutex<ProviderState>,
    error: Mutex<Option<String>>,
    snippet: Mutex<String>,
    current_task: Mutex<Option<String>>,
    provider_session_id: Mutex<Option<String>>,
    child_pid: AtomicI32,
    bytes_emitted: AtomicU64,
    events_emitted: AtomicU64,
    exited: Notify,
}

impl Shared {
    fn set_state(&self, state: ProviderState) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.state.lock().unwrap();
        *guard = state;
    }
}

/// Subprocess adapter for native-SDK agents.
pub struct NativeProvider {
    spec: LaunchSpec,
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<ProviderEvent>>,
}

impl NativeProvider {
    pub fn build(spec: &LaunchSpec) -> Result<Box<dyn Provider>, ProviderError> {
        if spec.command.is_empty() {
            return Err(ProviderError::Refused {
                op: "start",
                detail: "native provider requires a command".to_owned(),
            });
        }
        Ok(Box::new(Self {
            spec: spec.clone(),
            shared: Arc::new(Shared {
                state: Mutex::new(ProviderState::Starting),
                error: Mutex::new(None),
                snippet: Mutex::new(String::new()),
                current_task: Mutex::new(None),
                provider_session_id: Mutex::new(None),
                child_pid: AtomicI32::new(0),
                bytes_emitted: AtomicU64::new(0),
                events_emitted: AtomicU64::new(0),
                exited: Notify::new(),
            }),
            events_rx: None,
        }))
    }

    fn child_pid(&self) -> Option<Pid> {
        let raw = self.shared.child_pid.load(Ordering::Acquire);
        (raw != 0).then(|| Pid::from_raw(raw))
    }

    fn signal(&self, signal: Signal) -> Result<(), ProviderError> {
        let pid = self.child_pid().ok_or(ProviderError::NotRunning)?;
        kill(pid, signal)
            .map_err(|e| ProviderError::Io(std::io::Error::from_raw_os_error(e as i32)))
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.command[0]);
        cmd.args(&self.spec.command[1..]);
        if let Some(ref model) = self.spec.options.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref id) = self.spec.resume_from {
            cmd.arg("--resume").arg(id);
        }
        if self.spec.options.use_vertex_ai.unwrap_or(false) {
            cmd.env("USE_VERTEX_AI", "1");
            if let Some(ref project) = self.spec.options.vertex_project_id {
                cmd.env("VERTEX_PROJECT_ID", project);
            }
            if let Some(ref location) = self.spec.options.vertex_location {
                cmd.env("VERTEX_LOCATION", location);
            }
        }
        cmd.current_dir(&self.spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl Provider for NativeProvider {
    fn start(&mut self, shutdown: CancellationToken) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            let mut child = self.build_command().spawn().map_err(|e| ProviderError::Refused {
                op: "start",
                detail: format!("spawn failed: {e}"),
            })?;

            let pid = child.id().map(|p| p as i32).unwrap_or(0);
            self.shared.child_pid.store(pid, Ordering::Release);
            self.shared.set_state(ProviderState::Running);

            let stdout = child.stdout.take().ok_or(ProviderError::Protocol(
                "child stdout not captured".to_owned(),
            ))?;

            let (events_tx, events_rx) = mpsc::channel(256);
            self.events_rx = Some(events_rx);

            let shared = Arc::clone(&self.shared);
            tokio::spawn(event_task(child, stdout, events_tx, shared, shutdown));
            Ok(())
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            if self.child_pid().is_none() {
                return Ok(());
            }
            let _ = self.signal(Signal::SIGTERM);
            tokio::select! {
                _ = self.shared.exited.notified() => Ok(()),
                _ = tokio::time::sleep(STOP_GRACE) => {
                    warn!("native child ignored SIGTERM, sending SIGKILL");
                    let _ = self.signal(Signal::SIGKILL);
                    Ok(())
                }
            }
        })
    }

    fn pause(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            self.signal(Signal::SIGSTOP)?;
            self.shared.set_state(ProviderState::Paused);
            Ok(())
        })
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            self.signal(Signal::SIGCONT)?;
            self.shared.set_state(ProviderState::Running);
            Ok(())
        })
    }

    fn kill(&mut self) -> Result<(), ProviderError> {
        self.signal(Signal::SIGKILL)
    }

    fn status(&self) -> ProviderStatus {
        #[allow(clippy::unwrap_used)]
        let state = *self.shared.state.lock().unwrap();
        #[allow(clippy::unwrap_used)]
        let error = self.shared.error.lock().unwrap().clone();
        #[allow(clippy::unwrap_used)]
        let output_snippet = self.shared.snippet.lock().unwrap().clone();
        #[allow(clippy::unwrap_used)]
        let current_task = self.shared.current_task.lock().unwrap().clone();
        ProviderStatus {
            state,
            current_task,
            output_snippet,
            error,
            metrics: ProviderMetrics {
                bytes_emitted: self.shared.bytes_emitted.load(Ordering::Relaxed),
                events_emitted: self.shared.events_emitted.load(Ordering::Relaxed),
            },
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.events_rx.take()
    }

    fn owns_terminal(&self) -> bool {
        false
    }

    fn supports_resume(&self) -> bool {
        true
    }
}

/// Read stdout lines, translate them into provider events, then reap the
/// child and emit the terminal event.
async fn event_task(
    mut child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    events_tx: mpsc::Sender<ProviderEvent>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut started_sent = false;
    let mut term_sent = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        shared.bytes_emitted.fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
                        if let Some(event) = parse_event_line(&line, &shared, &mut started_sent) {
                            shared.events_emitted.fetch_add(1, Ordering::Relaxed);
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("native stdout read failed: {e}");
                        break;
                    }
                }
            }
            _ = shutdown.cancelled(), if !term_sent => {
                let raw = shared.child_pid.load(Ordering::Acquire);
                if raw != 0 {
                    let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                }
                term_sent = true;
                // Keep reading until the child closes stdout.
            }
        }
    }

    // Emit a synthetic Started if the child never announced its session —
    // downstream state handling expects one before Exited.
    if !started_sent {
        let _ = events_tx.send(ProviderEvent::Started { provider_session_id: None }).await;
    }

    let status = child.wait().await;
    let (code, signal) = match status {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            (status.code(), status.signal())
        }
        Err(e) => {
            warn!("native child wait failed: {e}");
            (Some(1), None)
        }
    };

    shared.set_state(ProviderState::Stopped);
    shared.child_pid.store(0, Ordering::Release);
    let _ = events_tx.send(ProviderEvent::Exited { code, signal }).await;
    shared.exited.notify_waiters();
}

/// Translate one stdout JSONL line into a provider event.
///
/// Unknown event types and unparseable lines are skipped — the SDK may add
/// event types we do not consume.
fn parse_event_line(
    line: &str,
    shared: &Shared,
    started_sent: &mut bool,
) -> Option<ProviderEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get("type").and_then(|t| t.as_str())? {
        "session" => {
            let id = value.get("session_id").and_then(|v| v.as_str()).map(str::to_owned);
            #[allow(clippy::unwrap_used)]
            {
                *shared.provider_session_id.lock().unwrap() = id.clone();
            }
            *started_sent = true;
            Some(ProviderEvent::Started { provider_session_id: id })
        }
        "message" => {
            let kind = match value.get("kind").and_then(|v| v.as_str()).unwrap_or("output") {
                "user" => MessageKind::User,
                "system" => MessageKind::System,
                "error" => MessageKind::Error,
                "tool" => MessageKind::Tool,
                _ => MessageKind::Output,
            };
            let contents = value.get("content").and_then(|v| v.as_str()).unwrap_or("").to_owned();
            #[allow(clippy::unwrap_used)]
            {
                let mut snippet = shared.snippet.lock().unwrap();
                snippet.clear();
                snippet.extend(contents.chars().take(256));
            }
            Some(ProviderEvent::Message { kind, contents, raw: Some(value) })
        }
        "delta" => {
            let contents = value.get("content").and_then(|v| v.as_str()).unwrap_or("").to_owned();
            Some(ProviderEvent::OutputDelta { contents })
        }
        "task" => {
            let task = value.get("task").and_then(|v| v.as_str()).map(str::to_owned);
            #[allow(clippy::unwrap_used)]
            {
                *shared.current_task.lock().unwrap() = task.clone();
            }
            Some(ProviderEvent::TaskChanged { task })
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "native_tests.rs"]
mod tests;
