// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run-attempt registry: one persisted row per session launch, plus the
//! single-use resume tokens that let a restart re-attach to an in-flight
//! provider.
//!
//! An attempt is persisted *before* its provider process starts, so a crash
//! at any point leaves an open attempt behind for recovery to find. The
//! process `boot_id` changes every start, which is how recovery tells a
//! previous generation's attempts from its own.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id;
use crate::provider::ProviderKind;
use crate::session::now_ms;
use crate::store::{BlobStore, ListEntryError, StoreError};

/// Terminal reason stamped on attempts whose session could not be resumed.
pub const REASON_RECOVERED_UNRESUMABLE: &str = "recovered-unresumable";
/// Terminal reason stamped on attempts resumed into a new process.
pub const REASON_RECOVERED_RESUMED: &str = "recovered-resumed";

/// How long a resume token stays valid.
const TOKEN_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Minimum gap between persisted heartbeat updates per attempt.
const HEARTBEAT_PERSIST_GAP_MS: u64 = 1_000;

/// One execution attempt of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAttempt {
    pub attempt_id: String,
    pub session_id: String,
    pub provider_kind: ProviderKind,
    /// Provider-side session id, once the adapter reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token_id: Option<String>,
    pub heartbeat_at_ms: u64,
    pub boot_id: String,
}

impl RunAttempt {
    /// Whether the attempt has not yet been closed out.
    pub fn is_open(&self) -> bool {
        self.ended_at_ms.is_none()
    }
}

/// Single-use credential to re-attach to an unfinished attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub token_id: String,
    pub session_id: String,
    pub attempt_id: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
}

/// Why a resume token could not be consumed.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("resume token expired")]
    Expired,
    #[error("resume token already consumed")]
    Consumed,
    #[error("resume token revoked: {reason}")]
    Revoked { reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registry of run attempts and resume tokens, persisted through the store.
pub struct AttemptRegistry {
    store: BlobStore,
    boot_id: String,
    heartbeat_persisted: Mutex<HashMap<String, u64>>,
}

impl AttemptRegistry {
    pub fn new(store: BlobStore) -> Self {
        Self {
            store,
            boot_id: id::generate(),
            heartbeat_persisted: Mutex::new(HashMap::new()),
        }
    }

    /// This process generation's boot id.
    pub fn boot_id(&self) -> &str {
        &self.boot_id
    }

    /// Create and persist a new attempt, with its resume token, before any
    /// provider process starts.
    pub fn begin(
        &self,
        session_id: &str,
        provider_kind: ProviderKind,
    ) -> Result<RunAttempt, StoreError> {
        let now = now_ms();
        let token = ResumeToken {
            token_id: id::generate(),
            session_id: session_id.to_owned(),
            attempt_id: String::new(), // filled in below
            created_at_ms: now,
            expires_at_ms: now + TOKEN_TTL_MS,
            consumed_at_ms: None,
            revoked_at_ms: None,
            revoked_reason: None,
        };
        let attempt = RunAttempt {
            attempt_id: id::generate(),
            session_id: session_id.to_owned(),
            provider_kind,
            provider_id: None,
            started_at_ms: now,
            ended_at_ms: None,
            terminal_reason: None,
            interruption_reason: None,
            wait_kind: None,
            wait_ref: None,
            resume_token_id: Some(token.token_id.clone()),
            heartbeat_at_ms: now,
            boot_id: self.boot_id.clone(),
        };
        let token = ResumeToken { attempt_id: attempt.attempt_id.clone(), ..token };

        self.store.save_attempt(&attempt)?;
        self.store.save_token(&token)?;
        Ok(attempt)
    }

    /// Record the provider-side session id once the adapter reports it.
    pub fn record_provider_id(
        &self,
        attempt: &mut RunAttempt,
        provider_id: Option<String>,
    ) -> Result<(), StoreError> {
        attempt.provider_id = provider_id;
        self.store.save_attempt(attempt)
    }

    /// Bump the heartbeat timestamp, persisting at most once per second.
    pub fn heartbeat(&self, attempt: &mut RunAttempt) -> Result<(), StoreError> {
        let now = now_ms();
        attempt.heartbeat_at_ms = now;

        let should_persist = {
            #[allow(clippy::unwrap_used)] // no poisoning: holders never panic
            let mut persisted = self.heartbeat_persisted.lock().unwrap();
            match persisted.get(&attempt.attempt_id) {
                Some(&last) if now.saturating_sub(last) < HEARTBEAT_PERSIST_GAP_MS => false,
                _ => {
                    persisted.insert(attempt.attempt_id.clone(), now);
                    true
                }
            }
        };
        if should_persist {
            self.store.save_attempt(attempt)?;
        }
        Ok(())
    }

    /// Close out an attempt with a terminal reason.
    pub fn finish(
        &self,
        attempt: &mut RunAttempt,
        terminal_reason: &str,
    ) -> Result<(), StoreError> {
        attempt.ended_at_ms = Some(now_ms());
        attempt.terminal_reason = Some(terminal_reason.to_owned());
        self.store.save_attempt(attempt)?;

        // A finished attempt can never be resumed; retire its token.
        if let Some(token_id) = attempt.resume_token_id.clone() {
            let _ = self.revoke_token(&token_id, "attempt finished");
        }
        #[allow(clippy::unwrap_used)]
        self.heartbeat_persisted.lock().unwrap().remove(&attempt.attempt_id);
        Ok(())
    }

    /// Attempts with no `ended_at`, across all sessions. Each represents a
    /// potentially resumable session at startup.
    pub fn open_attempts(&self) -> Result<(Vec<RunAttempt>, Vec<ListEntryError>), StoreError> {
        let outcome = self.store.list_all_attempts()?;
        let open = outcome.items.into_iter().filter(RunAttempt::is_open).collect();
        Ok((open, outcome.errors))
    }

    /// Consume a resume token. Single use: a second consume fails, as does
    /// consuming an expired or revoked token.
    pub fn consume_token(&self, token_id: &str) -> Result<ResumeToken, TokenError> {
        let mut token = self.store.load_token(token_id)?;
        if let Some(ref reason) = token.revoked_reason {
            return Err(TokenError::Revoked { reason: reason.clone() });
        }
        if token.revoked_at_ms.is_some() {
            return Err(TokenError::Revoked { reason: String::new() });
        }
        if token.consumed_at_ms.is_some() {
            return Err(TokenError::Consumed);
        }
        let now = now_ms();
        if now >= token.expires_at_ms {
            return Err(TokenError::Expired);
        }
        token.consumed_at_ms = Some(now);
        self.store.save_token(&token)?;
        Ok(token)
    }

    /// Revoke a token with a reason. Idempotent.
    pub fn revoke_token(&self, token_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut token = match self.store.load_token(token_id) {
            Ok(token) => token,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if token.revoked_at_ms.is_some() {
            return Ok(());
        }
        token.revoked_at_ms = Some(now_ms());
        token.revoked_reason = Some(reason.to_owned());
        self.store.save_token(&token)
    }
}

#[cfg(test)]
#[path = "attempt_tests.rs"]
mod tests;
