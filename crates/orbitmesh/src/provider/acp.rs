// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sub-agent-protocol provider: drives an agent subprocess speaking
//! newline-delimited JSON-RPC over stdio.
//!
//! Handshake: `initialize` → `session/new` (or `session/load` when
//! recovering and the peer advertises `loadSession`) → optional
//! `session/prompt` with the session's task. Notifications from the agent
//! become provider events; requests the client does not implement are
//! answered with a method-not-found error so the peer never hangs.

use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ledger::MessageKind;

use super::{
    BoxFuture, LaunchSpec, Provider, ProviderError, ProviderEvent, ProviderMetrics, ProviderState,
    ProviderStatus,
};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Request ids for the fixed handshake sequence.
const ID_INITIALIZE: u64 = 1;
const ID_SESSION: u64 = 2;
const ID_PROMPT: u64 = 3;

struct Shared {
    state: Mutex<ProviderState>,
    error: Mutex<Option<String>>,
    snippet: Mutex<String>,
    current_task: Mutex<Option<String>>,
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

/// JSON-RPC stdio adapter for sub-agent-protocol peers.
pub struct AcpProvider {
    spec: LaunchSpec,
    command: Vec<String>,
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<ProviderEvent>>,
    cancel_tx: Option<mpsc::Sender<()>>,
}

impl AcpProvider {
    pub fn build(spec: &LaunchSpec) -> Result<Box<dyn Provider>, ProviderError> {
        let command = match spec.options.acp_command {
            Some(ref cmd) => {
                let mut command = vec![cmd.clone()];
                command.extend(spec.options.acp_args.clone().unwrap_or_default());
                command
            }
            None => spec.command.clone(),
        };
        if command.is_empty() {
            return Err(ProviderError::Refused {
                op: "start",
                detail: "acp provider requires acp_command or a command".to_owned(),
            });
        }
        Ok(Box::new(Self {
            spec: spec.clone(),
            command,
            shared: Arc::new(Shared {
                state: Mutex::new(ProviderState::Starting),
                error: Mutex::new(None),
                snippet: Mutex::new(String::new()),
                current_task: Mutex::new(None),
                child_pid: AtomicI32::new(0),
                bytes_emitted: AtomicU64::new(0),
                events_emitted: AtomicU64::new(0),
                exited: Notify::new(),
            }),
            events_rx: None,
            cancel_tx: None,
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
}

impl Provider for AcpProvider {
    fn start(&mut self, shutdown: CancellationToken) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            let mut child = tokio::process::Command::new(&self.command[0])
                .args(&self.command[1..])
                .current_dir(&self.spec.cwd)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ProviderError::Refused {
                    op: "start",
                    detail: format!("spawn failed: {e}"),
                })?;

            let pid = child.id().map(|p| p as i32).unwrap_or(0);
            self.shared.child_pid.store(pid, Ordering::Release);

            let stdin = child.stdin.take().ok_or(ProviderError::Protocol(
                "child stdin not captured".to_owned(),
            ))?;
            let stdout = child.stdout.take().ok_or(ProviderError::Protocol(
                "child stdout not captured".to_owned(),
            ))?;

            let (events_tx, events_rx) = mpsc::channel(256);
            let (cancel_tx, cancel_rx) = mpsc::channel(1);
            self.events_rx = Some(events_rx);
            self.cancel_tx = Some(cancel_tx);

            let shared = Arc::clone(&self.shared);
            let spec = self.spec.clone();
            tokio::spawn(protocol_task(
                child, stdin, stdout, spec, events_tx, cancel_rx, shared, shutdown,
            ));
            Ok(())
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            if self.child_pid().is_none() {
                return Ok(());
            }
            // Ask the protocol task to send session/cancel, then escalate.
            if let Some(ref cancel_tx) = self.cancel_tx {
                let _ = cancel_tx.try_send(());
            }
            tokio::select! {
                _ = self.shared.exited.notified() => Ok(()),
                _ = tokio::time::sleep(STOP_GRACE) => {
                    warn!("acp peer ignored cancel, sending SIGKILL");
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

/// Drive the JSON-RPC conversation until the peer exits.
#[allow(clippy::too_many_arguments)]
async fn protocol_task(
    mut child: tokio::process::Child,
    mut stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
    spec: LaunchSpec,
    events_tx: mpsc::Sender<ProviderEvent>,
    mut cancel_rx: mpsc::Receiver<()>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut session_id: Option<String> = None;
    let mut load_supported = false;
    let mut started_sent = false;
    let mut term_sent = false;

    let init = json!({
        "jsonrpc": "2.0",
        "id": ID_INITIALIZE,
        "method": "initialize",
        "params": { "protocolVersion": 1 },
    });
    if send_line(&mut stdin, &init, &shared).await.is_err() {
        finish(&mut child, &events_tx, &shared, started_sent).await;
        return;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("acp stdout read failed: {e}");
                        break;
                    }
                };
                shared.bytes_emitted.fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };

                if let Some(id) = message.get("id").and_then(|v| v.as_u64()) {
                    if message.get("method").is_some() {
                        // Request from the agent we do not implement.
                        let reply = json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32601, "message": "method not found" },
                        });
                        let _ = send_line(&mut stdin, &reply, &shared).await;
                        continue;
                    }
                    // Response to one of our requests.
                    match id {
                        ID_INITIALIZE => {
                            load_supported = message
                                .pointer("/result/agentCapabilities/loadSession")
                                .and_then(|v| v.as_bool())
                                .unwrap_or(false);
                            let request = match spec.resume_from {
                                Some(ref prior) if load_supported => json!({
                                    "jsonrpc": "2.0",
                                    "id": ID_SESSION,
                                    "method": "session/load",
                                    "params": { "sessionId": prior, "cwd": spec.cwd },
                                }),
                                _ => json!({
                                    "jsonrpc": "2.0",
                                    "id": ID_SESSION,
                                    "method": "session/new",
                                    "params": { "cwd": spec.cwd },
                                }),
                            };
                            if send_line(&mut stdin, &request, &shared).await.is_err() {
                                break;
                            }
                        }
                        ID_SESSION => {
                            if let Some(err) = message.get("error") {
                                let detail = format!("session setup rejected: {err}");
                                shared.set_state(ProviderState::Error);
                                let _ = events_tx
                                    .send(ProviderEvent::Errored { detail })
                                    .await;
                                break;
                            }
                            session_id = message
                                .pointer("/result/sessionId")
                                .and_then(|v| v.as_str())
                                .map(str::to_owned)
                                .or_else(|| spec.resume_from.clone());
                            shared.set_state(ProviderState::Running);
                            started_sent = true;
                            shared.events_emitted.fetch_add(1, Ordering::Relaxed);
                            let _ = events_tx
                                .send(ProviderEvent::Started {
                                    provider_session_id: session_id.clone(),
                                })
                                .await;

                            if let Some(ref task) = spec.initial_prompt {
                                let prompt = json!({
                                    "jsonrpc": "2.0",
                                    "id": ID_PROMPT,
                                    "method": "session/prompt",
                                    "params": {
                                        "sessionId": session_id.clone(),
                                        "prompt": [ { "type": "text", "text": task } ],
                                    },
                                });
                                if send_line(&mut stdin, &prompt, &shared).await.is_err() {
                                    break;
                                }
                            }
                        }
                        ID_PROMPT => {
                            let reason = message
                                .pointer("/result/stopReason")
                                .and_then(|v| v.as_str())
                                .unwrap_or("end_turn")
                                .to_owned();
                            shared.events_emitted.fetch_add(1, Ordering::Relaxed);
                            let _ = events_tx
                                .send(ProviderEvent::Message {
                                    kind: MessageKind::System,
                                    contents: format!("turn finished: {reason}"),
                                    raw: Some(message),
                                })
                                .await;
                        }
                        _ => {}
                    }
                    continue;
                }

                // Notification.
                if let Some(event) = translate_notification(&message, &shared) {
                    shared.events_emitted.fetch_add(1, Ordering::Relaxed);
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            request = cancel_rx.recv() => {
                match request {
                    Some(()) => {
                        let cancel = json!({
                            "jsonrpc": "2.0",
                            "method": "session/cancel",
                            "params": { "sessionId": session_id.clone() },
                        });
                        let _ = send_line(&mut stdin, &cancel, &shared).await;
                        let raw = shared.child_pid.load(Ordering::Acquire);
                        if raw != 0 {
                            let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                        }
                    }
                    None => {
                        // Adapter handle dropped; terminate the peer.
                        let raw = shared.child_pid.load(Ordering::Acquire);
                        if raw != 0 {
                            let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                        }
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
                // Keep reading until the peer closes stdout.
            }
        }
    }

    finish(&mut child, &events_tx, &shared, started_sent).await;
}

/// Turn a `session/update` notification into a provider event.
fn translate_notification(message: &Value, shared: &Shared) -> Option<ProviderEvent> {
    if message.get("method").and_then(|v| v.as_str()) != Some("session/update") {
        return None;
    }
    let update = message.pointer("/params/update")?;
    match update.get("sessionUpdate").and_then(|v| v.as_str())? {
        "agent_message_chunk" => {
            let text = update.pointer("/content/text").and_then(|v| v.as_str())?;
            #[allow(clippy::unwrap_used)]
            {
                let mut snippet = shared.snippet.lock().unwrap();
                snippet.push_str(text);
                if snippet.len() > 256 {
                    let cut = snippet.len() - 256;
                    let cut = snippet
                        .char_indices()
                        .map(|(i, _)| i)
                        .find(|&i| i >= cut)
                        .unwrap_or(cut);
                    snippet.drain(..cut);
                }
            }
            Some(ProviderEvent::OutputDelta { contents: text.to_owned() })
        }
        "tool_call" => {
            let title = update.get("title").and_then(|v| v.as_str()).unwrap_or("tool call");
            Some(ProviderEvent::Message {
                kind: MessageKind::Tool,
                contents: title.to_owned(),
                raw: Some(update.clone()),
            })
        }
        "plan" => {
            let task = update
                .pointer("/entries/0/content")
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            #[allow(clippy::unwrap_used)]
            {
                *shared.current_task.lock().unwrap() = task.clone();
            }
            Some(ProviderEvent::TaskChanged { task })
        }
        _ => None,
    }
}

async fn send_line(
    stdin: &mut tokio::process::ChildStdin,
    value: &Value,
    shared: &Shared,
) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    let result = stdin.write_all(line.as_bytes()).await;
    if let Err(ref e) = result {
        debug!("acp stdin write failed: {e}");
        #[allow(clippy::unwrap_used)]
        {
            *shared.error.lock().unwrap() = Some(format!("stdin write failed: {e}"));
        }
    }
    result
}

/// Reap the child and emit the terminal event.
async fn finish(
    child: &mut tokio::process::Child,
    events_tx: &mpsc::Sender<ProviderEvent>,
    shared: &Shared,
    started_sent: bool,
) {
    if !started_sent {
        let _ = events_tx.send(ProviderEvent::Started { provider_session_id: None }).await;
    }
    let (code, signal) = match child.wait().await {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            (status.code(), status.signal())
        }
        Err(e) => {
            warn!("acp child wait failed: {e}");
            (Some(1), None)
        }
    };
    shared.set_state(ProviderState::Stopped);
    shared.child_pid.store(0, Ordering::Release);
    let _ = events_tx.send(ProviderEvent::Exited { code, signal }).await;
    shared.exited.notify_waiters();
}

#[cfg(test)]
#[path = "acp_tests.rs"]
mod tests;
