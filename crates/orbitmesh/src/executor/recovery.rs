// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup recovery: rebuild runtime state from the ledgers and registries
//! left behind by the previous process generation.
//!
//! Every open run attempt is either resumed through its adapter's resume
//! capability (with its single-use token) or closed out with the session in
//! `error`. Byte ledgers replay through a fresh terminal runtime so the
//! last screen survives the restart, and a fresh `sessions.state` envelope
//! goes out either way.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::attempt::{RunAttempt, REASON_RECOVERED_RESUMED, REASON_RECOVERED_UNRESUMABLE};
use crate::extract::Extractor;
use crate::ledger::{ActivityLedger, ByteLedger};
use crate::provider::{LaunchSpec, ProviderEvent, ProviderKind};
use crate::session::{can_transition, Session, SessionState};
use crate::terminal::{TerminalKind, TerminalRuntime};

use super::{monitor, AgentExecutor, LiveSession, START_TIMEOUT};

/// What startup recovery did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Sessions re-attached to their in-flight providers.
    pub resumed: Vec<String>,
    /// Sessions moved to `error` (unresumable or stale).
    pub unresumable: Vec<String>,
    /// Non-fatal faults encountered along the way.
    pub warnings: Vec<String>,
}

pub(crate) async fn run(executor: &Arc<AgentExecutor>) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let sessions = executor.store().list_sessions()?;
    for error in &sessions.errors {
        report.warnings.push(format!("session list: {error}"));
    }

    let (open_attempts, attempt_errors) = executor.attempts().open_attempts()?;
    for error in &attempt_errors {
        report.warnings.push(format!("attempt list: {error}"));
    }

    let mut attempted_sessions: std::collections::HashSet<String> =
        std::collections::HashSet::new();

    for mut attempt in open_attempts {
        attempted_sessions.insert(attempt.session_id.clone());

        if attempt.boot_id == executor.attempts().boot_id() {
            // Same-generation attempts cannot exist at startup; treat as
            // corrupt bookkeeping.
            report.warnings.push(format!(
                "attempt {} claims the current boot id; closing it",
                attempt.attempt_id
            ));
            executor.attempts().finish(&mut attempt, REASON_RECOVERED_UNRESUMABLE)?;
            continue;
        }

        let session = match executor.store().load_session(&attempt.session_id) {
            Ok(session) => session,
            Err(e) => {
                report.warnings.push(format!(
                    "attempt {} references unloadable session {}: {e}",
                    attempt.attempt_id, attempt.session_id
                ));
                executor.attempts().finish(&mut attempt, REASON_RECOVERED_UNRESUMABLE)?;
                continue;
            }
        };

        match try_resume(executor, session, &mut attempt).await {
            Ok(session_id) => {
                info!(session = %session_id, "resumed session after restart");
                report.resumed.push(session_id);
            }
            Err(ResumeFailure { session, detail }) => {
                if let Some(ref detail) = detail {
                    report.warnings.push(format!("session {}: {detail}", session.id));
                }
                mark_unresumable(executor, session, &mut attempt).await?;
                report.unresumable.push(attempt.session_id.clone());
            }
        }
    }

    // Non-terminal sessions with no open attempt are stale: the previous
    // process died between persisting state and its attempt bookkeeping.
    for session in sessions.items {
        if session.is_terminal() || attempted_sessions.contains(&session.id) {
            continue;
        }
        if session.state == SessionState::Created {
            // Never launched; leave it alone.
            continue;
        }
        let mut session = session;
        if session.transition(SessionState::Error, "recovered-stale").is_ok() {
            executor.store().save_session(&session)?;
        }
        replay_terminal(executor, &session.id, &mut Vec::new()).await;
        executor.publish_state(&session, "recovered-stale").await;
        report.unresumable.push(session.id.clone());
    }

    Ok(report)
}

struct ResumeFailure {
    session: Session,
    detail: Option<String>,
}

/// Try to re-attach to an attempt's in-flight provider.
async fn try_resume(
    executor: &Arc<AgentExecutor>,
    mut session: Session,
    attempt: &mut RunAttempt,
) -> Result<String, ResumeFailure> {
    let fail = |session: Session, detail: Option<String>| ResumeFailure { session, detail };

    // PTY children died with the previous process; absence of a resume
    // capability means unresumable, never a guess.
    if attempt.provider_kind == ProviderKind::Pty {
        return Err(fail(session, None));
    }
    let Some(provider_session_id) = attempt.provider_id.clone() else {
        return Err(fail(session, None));
    };

    // The token is the proof of the right to re-attach.
    let Some(token_id) = attempt.resume_token_id.clone() else {
        return Err(fail(session, None));
    };
    if let Err(e) = executor.attempts().consume_token(&token_id) {
        return Err(fail(session, Some(format!("resume token rejected: {e}"))));
    }

    let spec = LaunchSpec {
        session_id: session.id.clone(),
        cwd: session.cwd.clone(),
        command: session.command.clone(),
        options: session.options.clone(),
        cols: executor.config().cols,
        rows: executor.config().rows,
        initial_prompt: None,
        resume_from: Some(provider_session_id),
    };

    let mut provider = match executor.factory.create(attempt.provider_kind, &spec) {
        Ok(provider) => provider,
        Err(e) => return Err(fail(session, Some(format!("adapter construction failed: {e}")))),
    };
    if !provider.supports_resume() {
        return Err(fail(session, None));
    }

    let cancel = executor.shutdown_token().child_token();
    if let Err(e) =
        tokio::time::timeout(START_TIMEOUT, provider.start(cancel.clone())).await.map_err(
            |_| "resume start timed out".to_owned(),
        ).and_then(|r| r.map_err(|e| e.to_string()))
    {
        return Err(fail(session, Some(format!("resume start failed: {e}"))));
    }

    let Some(mut events) = provider.take_events() else {
        return Err(fail(session, Some("adapter produced no event stream".to_owned())));
    };
    let started = tokio::time::timeout(START_TIMEOUT, events.recv()).await;
    let provider_session_id = match started {
        Ok(Some(ProviderEvent::Started { provider_session_id })) => provider_session_id,
        other => {
            let _ = provider.kill();
            return Err(fail(
                session,
                Some(format!("adapter did not report resume startup: {other:?}")),
            ));
        }
    };

    // Attempt bookkeeping: the old attempt ends resumed, a new one begins.
    if let Err(e) = executor.attempts().finish(attempt, REASON_RECOVERED_RESUMED) {
        warn!(session = %session.id, error = %e, "failed to close resumed attempt");
    }
    let new_attempt = match executor.attempts().begin(&session.id, attempt.provider_kind) {
        Ok(mut new_attempt) => {
            let _ = executor
                .attempts()
                .record_provider_id(&mut new_attempt, provider_session_id);
            new_attempt
        }
        Err(e) => return Err(fail(session, Some(format!("new attempt failed: {e}")))),
    };

    // Align the entity with reality: the provider is running again.
    if session.state != SessionState::Running {
        if can_transition(session.state, SessionState::Running) {
            let _ = session.transition(SessionState::Running, "recovered-resume");
        } else {
            let _ = provider.kill();
            return Err(fail(session, Some("session state does not admit resume".to_owned())));
        }
    }
    if let Err(e) = executor.store().save_session(&session) {
        return Err(fail(session, Some(format!("session persist failed: {e}"))));
    }

    let session_id = session.id.clone();
    let mut extractor = Extractor::new(&session_id);
    let (launch_command, launch_args) = spec.launch_identity();
    // Recovery keeps whatever profiles the store carries for this provider.
    let profiles = load_stored_profiles(executor);
    let _ = extractor.load_profiles(&profiles, &launch_command, &launch_args);

    let activity = match ActivityLedger::open(
        &executor.store().activity_path(&session_id).map_err(|e| fail_clone(&session, &e.to_string()))?,
    ) {
        Ok(activity) => activity,
        Err(e) => return Err(fail(session, Some(format!("activity ledger open failed: {e}")))),
    };

    let live = Arc::new(LiveSession {
        entity: Arc::new(Mutex::new(session.clone())),
        provider: Arc::new(Mutex::new(provider)),
        attempt: Arc::new(Mutex::new(new_attempt)),
        terminal: None,
        cancel,
        monitor: Mutex::new(None),
    });
    executor.insert_live(session_id.clone(), Arc::clone(&live)).await;

    let handle = monitor::spawn(
        Arc::clone(executor),
        session_id.clone(),
        Arc::clone(&live),
        events,
        extractor,
        activity,
    );
    *live.monitor.lock().await = Some(handle);

    executor.publish_state(&session, "recovered-resume").await;
    Ok(session_id)
}

// Helper so the ? above can build a ResumeFailure without moving `session`.
fn fail_clone(session: &Session, detail: &str) -> ResumeFailure {
    ResumeFailure { session: session.clone(), detail: Some(detail.to_owned()) }
}

/// Close out an unresumable attempt: session to `error`, attempt ended,
/// terminal rebuilt from the byte ledger, state republished.
async fn mark_unresumable(
    executor: &Arc<AgentExecutor>,
    mut session: Session,
    attempt: &mut RunAttempt,
) -> anyhow::Result<()> {
    executor.attempts().finish(attempt, REASON_RECOVERED_UNRESUMABLE)?;

    if !session.is_terminal()
        && session.transition(SessionState::Error, REASON_RECOVERED_UNRESUMABLE).is_ok()
    {
        executor.store().save_session(&session)?;
    }

    let mut warnings = Vec::new();
    replay_terminal(executor, &session.id, &mut warnings).await;
    for warning in warnings {
        warn!(session = %session.id, "{warning}");
    }

    executor.publish_state(&session, REASON_RECOVERED_UNRESUMABLE).await;
    Ok(())
}

/// Replay a session's byte ledger through a fresh terminal runtime and
/// persist the reconstructed snapshot.
async fn replay_terminal(
    executor: &Arc<AgentExecutor>,
    session_id: &str,
    warnings: &mut Vec<String>,
) {
    let path = match executor.store().bytelog_path(session_id) {
        Ok(path) => path,
        Err(e) => {
            warnings.push(format!("bytelog path: {e}"));
            return;
        }
    };
    if !path.exists() {
        return;
    }

    let outcome = match ByteLedger::replay(&path) {
        Ok(outcome) => outcome,
        Err(e) => {
            warnings.push(format!("bytelog replay failed: {e}"));
            return;
        }
    };
    if outcome.truncated {
        warnings.push("bytelog had a truncated trailing frame".to_owned());
    }

    let runtime = TerminalRuntime::new(
        session_id.to_owned(),
        session_id.to_owned(),
        TerminalKind::Pty,
        executor.config().cols,
        executor.config().rows,
        None,
        None,
        false,
    );
    runtime.apply_replay(&outcome.frames).await;

    if let Err(e) = executor.store().save_terminal(&runtime.to_record().await) {
        warnings.push(format!("terminal record persist failed: {e}"));
    }
}

/// Extractor profiles persisted in provider configs, if any.
fn load_stored_profiles(executor: &AgentExecutor) -> Vec<crate::extract::ProfileSpec> {
    let configs = match executor.store().load_provider_configs() {
        Ok(configs) => configs,
        Err(_) => return Vec::new(),
    };
    let mut profiles = Vec::new();
    for config in configs {
        if let Some(value) = config.extra.get("extractor_profiles") {
            if let Ok(mut specs) =
                serde_json::from_value::<Vec<crate::extract::ProfileSpec>>(value.clone())
            {
                profiles.append(&mut specs);
            }
        }
    }
    profiles
}
