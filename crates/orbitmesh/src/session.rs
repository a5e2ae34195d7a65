// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session entity and its state machine.
//!
//! A session is one supervised agent execution. Its current state is always
//! derivable from the transition list: `state == transitions.last().to`, or
//! [`SessionState::Created`] when the list is empty. All mutation goes
//! through [`Session::transition`], which rejects illegal moves without
//! touching the entity.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderKind;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl SessionState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from → to` is a legal state-machine edge.
///
/// ```text
/// created → starting → running ⇄ paused → stopping → stopped
/// ```
///
/// `error` is reachable from any non-terminal state.
pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (Created, Starting) => true,
        (Starting, Running) => true,
        (Running, Paused) | (Paused, Running) => true,
        (Running, Stopping) | (Paused, Stopping) => true,
        (Stopping, Stopped) => true,
        (from, Error) => !from.is_terminal(),
        _ => false,
    }
}

/// Errors from state-machine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid transition: {from} → {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// One recorded state change. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: String,
    pub timestamp_ms: u64,
}

/// A supervised agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub provider_kind: ProviderKind,
    /// Preferred provider-config id, when one was selected at start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub title: String,
    /// Launch command line, kept for recovery and the extractor's launch
    /// identity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "is_default_options")]
    pub options: crate::config::SessionOptions,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub state: SessionState,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Session {
    /// Create a new session in the `created` state.
    pub fn new(id: impl Into<String>, provider_kind: ProviderKind, cwd: impl Into<PathBuf>) -> Self {
        let now = now_ms();
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            provider_kind,
            provider_id: None,
            agent_id: None,
            cwd: cwd.into(),
            project_id: None,
            command: Vec::new(),
            options: Default::default(),
            created_at_ms: now,
            updated_at_ms: now,
            current_task: None,
            state: SessionState::Created,
            transitions: Vec::new(),
        }
    }

    /// Apply a state transition, appending it to the transition list.
    ///
    /// Illegal transitions fail without mutating the entity.
    pub fn transition(
        &mut self,
        to: SessionState,
        reason: impl Into<String>,
    ) -> Result<&Transition, StateError> {
        let from = self.state;
        if !can_transition(from, to) {
            return Err(StateError::InvalidTransition { from, to });
        }
        let now = now_ms();
        self.transitions.push(Transition { from, to, reason: reason.into(), timestamp_ms: now });
        self.state = to;
        self.updated_at_ms = now;
        Ok(&self.transitions[self.transitions.len() - 1])
    }

    /// Recompute the current state from the transition list.
    ///
    /// Equals `state` for any entity mutated only through [`transition`];
    /// used after restore to verify the snapshot invariant.
    pub fn derived_state(&self) -> SessionState {
        self.transitions.last().map(|t| t.to).unwrap_or(SessionState::Created)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

fn is_default_options(options: &crate::config::SessionOptions) -> bool {
    *options == crate::config::SessionOptions::default()
}

/// Current UTC time as milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
