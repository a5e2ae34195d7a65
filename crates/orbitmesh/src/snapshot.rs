// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot provider: a consistent initial state for freshly subscribed
//! clients.
//!
//! A client connects, takes an initial state, then subscribes to the hub
//! and drops every streamed event whose id it already saw — `hub_seq` and
//! the per-entry `event_id` make the dedupe deterministic. This is also the
//! re-sync path after a backpressure drop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hub::Hub;
use crate::ledger::{fold_messages, Message};
use crate::session::{now_ms, Session};
use crate::store::BlobStore;
use crate::terminal::TerminalRecord;

/// Initial view of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session: Session,
    pub messages: Vec<Message>,
    /// Corrupt activity lines skipped while folding, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupt_lines: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalRecord>,
}

/// Consistent initial state served to a new subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialState {
    pub sessions: Vec<SessionView>,
    /// Hub sequence at capture time; streamed envelopes with `seq` at or
    /// below this are already reflected here.
    pub hub_seq: u64,
    pub captured_at_ms: u64,
    /// List-scan faults surfaced alongside the good rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Serves initial state from the store, stamped with the hub sequence.
pub struct SnapshotProvider {
    store: BlobStore,
    hub: Arc<Hub>,
}

impl SnapshotProvider {
    pub fn new(store: BlobStore, hub: Arc<Hub>) -> Self {
        Self { store, hub }
    }

    /// Initial state for every known session, or a single one when `filter`
    /// names it.
    pub fn initial_state(&self, filter: Option<&str>) -> anyhow::Result<InitialState> {
        // Capture the hub sequence before reading, so anything published
        // during the read is newer than this snapshot and survives dedupe.
        let hub_seq = self.hub.current_seq();

        let (sessions, errors) = match filter {
            Some(id) => (vec![self.load_session_or_legacy(id)?], Vec::new()),
            None => {
                let outcome = self.store.list_sessions()?;
                let errors = outcome.errors.iter().map(|e| e.to_string()).collect();
                (outcome.items, errors)
            }
        };

        let mut views = Vec::with_capacity(sessions.len());
        for session in sessions {
            views.push(self.session_view(session)?);
        }

        Ok(InitialState { sessions: views, hub_seq, captured_at_ms: now_ms(), errors })
    }

    fn session_view(&self, session: Session) -> anyhow::Result<SessionView> {
        let activity_path = self.store.activity_path(&session.id)?;
        let (messages, corruption) = fold_messages(&activity_path, &session.id)?;
        if let Some(ref corruption) = corruption {
            debug!(session = %session.id, corrupt = corruption.corrupt, "activity fold skipped corrupt lines");
        }

        let terminal = match self.store.load_terminal(&session.id) {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        Ok(SessionView {
            session,
            messages,
            corrupt_lines: corruption.map(|c| c.corrupt),
            terminal,
        })
    }

    /// Messages for one session, folded from its activity ledger.
    ///
    /// Callers prefer the rebuilt messages when any were recovered and
    /// surface the corruption error only when nothing could be.
    pub fn messages(
        &self,
        session: &str,
    ) -> anyhow::Result<(Vec<Message>, Option<crate::ledger::CorruptionError>)> {
        let path = self.store.activity_path(session)?;
        Ok(fold_messages(&path, session)?)
    }

    /// Load a session snapshot, falling back to the legacy gzip blob when no
    /// live snapshot exists.
    fn load_session_or_legacy(&self, id: &str) -> anyhow::Result<Session> {
        match self.store.load_session(id) {
            Ok(session) => Ok(session),
            Err(e) if e.is_not_found() => {
                let value = self.store.load_legacy_snapshot(id)?;
                Ok(serde_json::from_value(value)?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
