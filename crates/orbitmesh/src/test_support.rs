// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: a scripted stub provider and executor
//! builders over temp directories.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::executor::AgentExecutor;
use crate::provider::{
    BoxFuture, Provider, ProviderError, ProviderEvent, ProviderFactory, ProviderKind,
    ProviderMetrics, ProviderState, ProviderStatus,
};

/// What the stub provider does after `start`.
#[derive(Debug, Clone)]
pub struct StubScript {
    /// Events emitted (after the automatic `Started`).
    pub events: Vec<StubEvent>,
    /// Whether `start` itself fails.
    pub fail_start: bool,
    /// Whether `pause` is refused.
    pub refuse_pause: bool,
    /// Provider-side session id reported by `Started`.
    pub provider_session_id: Option<String>,
}

impl Default for StubScript {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            fail_start: false,
            refuse_pause: false,
            provider_session_id: Some("stub-session".to_owned()),
        }
    }
}

/// A scripted event, optionally delayed.
#[derive(Debug, Clone)]
pub enum StubEvent {
    Emit(StubEmission),
    /// Milliseconds to sleep before the next emission.
    Sleep(u64),
    /// Hold the stream open until `stop`/shutdown.
    HoldUntilStopped,
}

/// Clonable mirror of [`ProviderEvent`] for scripts.
#[derive(Debug, Clone)]
pub enum StubEmission {
    Message { kind: crate::ledger::MessageKind, contents: String },
    OutputDelta { contents: String },
    TaskChanged { task: Option<String> },
    Exited { code: Option<i32> },
    Errored { detail: String },
}

impl StubEmission {
    fn into_event(self) -> ProviderEvent {
        match self {
            Self::Message { kind, contents } => {
                ProviderEvent::Message { kind, contents, raw: None }
            }
            Self::OutputDelta { contents } => ProviderEvent::OutputDelta { contents },
            Self::TaskChanged { task } => ProviderEvent::TaskChanged { task },
            Self::Exited { code } => ProviderEvent::Exited { code, signal: None },
            Self::Errored { detail } => ProviderEvent::Errored { detail },
        }
    }
}

/// Scripted in-process provider for executor tests.
pub struct StubProvider {
    script: StubScript,
    state: Arc<Mutex<ProviderState>>,
    stop_requested: Arc<AtomicBool>,
    stop_signal: Arc<tokio::sync::Notify>,
    events_rx: Option<mpsc::Receiver<ProviderEvent>>,
}

impl StubProvider {
    pub fn new(script: StubScript) -> Self {
        Self {
            script,
            state: Arc::new(Mutex::new(ProviderState::Starting)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(tokio::sync::Notify::new()),
            events_rx: None,
        }
    }

    /// Factory that builds stub providers from a shared script.
    pub fn factory(script: StubScript) -> ProviderFactory {
        let mut factory = ProviderFactory::new();
        for kind in [ProviderKind::Pty, ProviderKind::Native, ProviderKind::Acp] {
            let script = script.clone();
            factory.register(
                kind,
                Arc::new(move |_spec| Ok(Box::new(StubProvider::new(script.clone())) as Box<dyn Provider>)),
            );
        }
        factory
    }

    fn set_state(&self, state: ProviderState) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.state.lock().unwrap();
        *guard = state;
    }
}

impl Provider for StubProvider {
    fn start(&mut self, shutdown: CancellationToken) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            if self.script.fail_start {
                self.set_state(ProviderState::Error);
                return Err(ProviderError::Refused {
                    op: "start",
                    detail: "scripted start failure".to_owned(),
                });
            }
            self.set_state(ProviderState::Running);

            let (tx, rx) = mpsc::channel(64);
            self.events_rx = Some(rx);

            let script = self.script.clone();
            let state = Arc::clone(&self.state);
            let stop_requested = Arc::clone(&self.stop_requested);
            let stop_signal = Arc::clone(&self.stop_signal);

            tokio::spawn(async move {
                let _ = tx
                    .send(ProviderEvent::Started {
                        provider_session_id: script.provider_session_id.clone(),
                    })
                    .await;

                for step in script.events {
                    match step {
                        StubEvent::Sleep(ms) => {
                            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                        }
                        StubEvent::HoldUntilStopped => {
                            let notified = stop_signal.notified();
                            tokio::pin!(notified);
                            notified.as_mut().enable();
                            // Re-check after arming so a stop that landed
                            // before this point is not lost.
                            if !stop_requested.load(Ordering::Acquire) {
                                tokio::select! {
                                    _ = notified => {}
                                    _ = shutdown.cancelled() => {}
                                }
                            }
                            #[allow(clippy::unwrap_used)]
                            {
                                *state.lock().unwrap() = ProviderState::Stopped;
                            }
                            let _ = tx
                                .send(ProviderEvent::Exited { code: Some(0), signal: None })
                                .await;
                            return;
                        }
                        StubEvent::Emit(emission) => {
                            let event = emission.into_event();
                            let terminal = event.is_terminal();
                            if terminal {
                                #[allow(clippy::unwrap_used)]
                                {
                                    *state.lock().unwrap() = ProviderState::Stopped;
                                }
                            }
                            if tx.send(event).await.is_err() || terminal {
                                return;
                            }
                        }
                    }
                }
                // Script exhausted without a terminal event: clean exit.
                #[allow(clippy::unwrap_used)]
                {
                    *state.lock().unwrap() = ProviderState::Stopped;
                }
                let _ = tx.send(ProviderEvent::Exited { code: Some(0), signal: None }).await;
            });
            Ok(())
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            self.stop_requested.store(true, Ordering::Release);
            self.stop_signal.notify_waiters();
            self.set_state(ProviderState::Stopped);
            Ok(())
        })
    }

    fn pause(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            if self.script.refuse_pause {
                return Err(ProviderError::Refused {
                    op: "pause",
                    detail: "scripted refusal".to_owned(),
                });
            }
            self.set_state(ProviderState::Paused);
            Ok(())
        })
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            self.set_state(ProviderState::Running);
            Ok(())
        })
    }

    fn kill(&mut self) -> Result<(), ProviderError> {
        self.stop_requested.store(true, Ordering::Release);
        self.stop_signal.notify_waiters();
        self.set_state(ProviderState::Stopped);
        Ok(())
    }

    fn status(&self) -> ProviderStatus {
        #[allow(clippy::unwrap_used)]
        let state = *self.state.lock().unwrap();
        ProviderStatus {
            state,
            current_task: None,
            output_snippet: String::new(),
            error: None,
            metrics: ProviderMetrics::default(),
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

/// Executor over a temp base dir with a scripted stub factory.
pub fn stub_executor(
    dir: &std::path::Path,
    script: StubScript,
) -> anyhow::Result<Arc<AgentExecutor>> {
    let config = Config::for_base_dir(dir);
    AgentExecutor::with_factory(config, StubProvider::factory(script))
}
