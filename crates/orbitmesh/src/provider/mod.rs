// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provider adapters: the variant-specific drivers behind a session.
//!
//! Every adapter exposes the same capability set — start, stop, pause,
//! resume, kill, status, events — so the executor is written once against
//! [`Provider`] and the variant is chosen at factory time.

pub mod acp;
pub mod native;
pub mod pty;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SessionOptions;
use crate::ledger::MessageKind;

/// Boxed future returned by object-safe provider operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Provider variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Interactive CLI under a PTY. Owns a terminal.
    Pty,
    /// Native-SDK CLI subprocess in structured-output mode.
    Native,
    /// Sub-agent protocol peer over stdio.
    Acp,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pty => "pty",
            Self::Native => "native",
            Self::Acp => "acp",
        }
    }

    /// Parse a kind tag, failing with [`ProviderError::UnknownKind`].
    pub fn parse(kind: &str) -> Result<Self, ProviderError> {
        match kind {
            "pty" => Ok(Self::Pty),
            "native" => Ok(Self::Native),
            "acp" => Ok(Self::Acp),
            other => Err(ProviderError::UnknownKind { kind: other.to_owned() }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter-reported process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Starting,
    Running,
    Paused,
    Stopped,
    Error,
}

/// Counters reported through [`ProviderStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub bytes_emitted: u64,
    pub events_emitted: u64,
}

/// Point-in-time status of an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub state: ProviderState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub output_snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: ProviderMetrics,
}

/// Events emitted by an adapter on its finite event channel.
///
/// The channel closes after a terminal event (`Exited` or `Errored`).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The provider finished starting. Carries the provider-side session id
    /// when the variant has one (used for resume).
    Started { provider_session_id: Option<String> },
    /// Raw terminal bytes (PTY variant only).
    Output(bytes::Bytes),
    /// A complete structured message.
    Message { kind: MessageKind, contents: String, raw: Option<serde_json::Value> },
    /// An incremental output fragment to concatenate onto the feed tail.
    OutputDelta { contents: String },
    /// The provider's notion of the current task changed.
    TaskChanged { task: Option<String> },
    /// Clean process exit.
    Exited { code: Option<i32>, signal: Option<i32> },
    /// Adapter-level failure.
    Errored { detail: String },
}

impl ProviderEvent {
    /// Whether this event terminates the event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Errored { .. })
    }
}

/// Input delivered to a terminal-owning provider.
#[derive(Debug)]
pub enum TerminalInput {
    /// Raw bytes for the PTY master.
    Write(bytes::Bytes),
    /// Window-size change (`TIOCSWINSZ` on the master fd).
    Resize { cols: u16, rows: u16 },
}

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider kind: {kind}")]
    UnknownKind { kind: String },
    #[error("provider refused {op}: {detail}")]
    Refused { op: &'static str, detail: String },
    #[error("provider is not running")]
    NotRunning,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Everything an adapter needs to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: String,
    pub cwd: PathBuf,
    /// Command line to run. For the acp variant this is derived from
    /// `options.acp_command` / `options.acp_args` when present.
    pub command: Vec<String>,
    pub options: SessionOptions,
    pub cols: u16,
    pub rows: u16,
    /// Task text handed to protocol-speaking variants as the first prompt.
    pub initial_prompt: Option<String>,
    /// Provider-side session id to re-attach to, when recovering.
    pub resume_from: Option<String>,
}

impl LaunchSpec {
    pub fn new(session_id: impl Into<String>, cwd: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            command,
            options: SessionOptions::default(),
            cols: 200,
            rows: 50,
            initial_prompt: None,
            resume_from: None,
        }
    }

    /// The launch identity the extractor matches rule profiles against.
    pub fn launch_identity(&self) -> (String, Vec<String>) {
        let command = self.command.first().cloned().unwrap_or_default();
        let args = self.command.iter().skip(1).cloned().collect();
        (command, args)
    }
}

/// Uniform adapter capability set. Object-safe for `Box<dyn Provider>`.
///
/// Adapters must be safe to cancel via the token handed to [`start`];
/// `stop` must return within the executor's shutdown window or the executor
/// falls back to [`kill`].
pub trait Provider: Send + 'static {
    /// Spawn the underlying process and begin emitting events.
    fn start(&mut self, shutdown: CancellationToken) -> BoxFuture<'_, Result<(), ProviderError>>;

    /// Graceful shutdown.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), ProviderError>>;

    /// Suspend execution (PTY: `SIGSTOP` to the process group).
    fn pause(&mut self) -> BoxFuture<'_, Result<(), ProviderError>>;

    /// Resume a paused provider.
    fn resume(&mut self) -> BoxFuture<'_, Result<(), ProviderError>>;

    /// Forceful, synchronous termination. Last resort.
    fn kill(&mut self) -> Result<(), ProviderError>;

    /// Current adapter status.
    fn status(&self) -> ProviderStatus;

    /// Take the event channel. Yields `None` after the first call.
    ///
    /// The channel is finite: the adapter closes it after a terminal event.
    fn take_events(&mut self) -> Option<mpsc::Receiver<ProviderEvent>>;

    /// Whether this variant drives a PTY and therefore owns a terminal.
    fn owns_terminal(&self) -> bool;

    /// Sender for PTY-side input, when the variant owns a terminal.
    fn terminal_input(&self) -> Option<mpsc::Sender<TerminalInput>> {
        None
    }

    /// Whether the variant can re-attach to an in-flight provider session
    /// after a control-plane restart.
    fn supports_resume(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("dyn Provider").field("status", &self.status()).finish()
    }
}

/// Builder function registered per kind.
pub type ProviderBuilder =
    Arc<dyn Fn(&LaunchSpec) -> Result<Box<dyn Provider>, ProviderError> + Send + Sync>;

/// Factory mapping provider kinds to adapter builders.
///
/// Registered once at process start; `create` never blocks.
#[derive(Clone, Default)]
pub struct ProviderFactory {
    builders: HashMap<ProviderKind, ProviderBuilder>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the three built-in variants registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(ProviderKind::Pty, Arc::new(|spec| pty::PtyProvider::build(spec)));
        factory.register(ProviderKind::Native, Arc::new(|spec| native::NativeProvider::build(spec)));
        factory.register(ProviderKind::Acp, Arc::new(|spec| acp::AcpProvider::build(spec)));
        factory
    }

    pub fn register(&mut self, kind: ProviderKind, builder: ProviderBuilder) {
        self.builders.insert(kind, builder);
    }

    /// Construct an adapter for `kind`, or fail with `UnknownKind`.
    pub fn create(
        &self,
        kind: ProviderKind,
        spec: &LaunchSpec,
    ) -> Result<Box<dyn Provider>, ProviderError> {
        match self.builders.get(&kind) {
            Some(builder) => builder(spec),
            None => Err(ProviderError::UnknownKind { kind: kind.as_str().to_owned() }),
        }
    }
}

impl fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderFactory").field("kinds", &self.builders.keys().collect::<Vec<_>>()).finish()
    }
}
