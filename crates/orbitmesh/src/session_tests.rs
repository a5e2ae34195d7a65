// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use yare::parameterized;

use crate::provider::ProviderKind;

use super::*;

fn running_session() -> Session {
    let mut s = Session::new("s1", ProviderKind::Pty, "/tmp");
    s.transition(SessionState::Starting, "start").unwrap();
    s.transition(SessionState::Running, "spawned").unwrap();
    s
}

#[parameterized(
    created_starting = { SessionState::Created, SessionState::Starting },
    starting_running = { SessionState::Starting, SessionState::Running },
    running_paused = { SessionState::Running, SessionState::Paused },
    paused_running = { SessionState::Paused, SessionState::Running },
    running_stopping = { SessionState::Running, SessionState::Stopping },
    paused_stopping = { SessionState::Paused, SessionState::Stopping },
    stopping_stopped = { SessionState::Stopping, SessionState::Stopped },
    created_error = { SessionState::Created, SessionState::Error },
    running_error = { SessionState::Running, SessionState::Error },
    stopping_error = { SessionState::Stopping, SessionState::Error },
)]
fn legal_edges(from: SessionState, to: SessionState) {
    assert!(can_transition(from, to), "{from} → {to} should be legal");
}

#[parameterized(
    created_running = { SessionState::Created, SessionState::Running },
    running_stopped = { SessionState::Running, SessionState::Stopped },
    stopped_running = { SessionState::Stopped, SessionState::Running },
    error_running = { SessionState::Error, SessionState::Running },
    stopped_error = { SessionState::Stopped, SessionState::Error },
    error_error = { SessionState::Error, SessionState::Error },
    paused_stopped = { SessionState::Paused, SessionState::Stopped },
    starting_paused = { SessionState::Starting, SessionState::Paused },
)]
fn illegal_edges(from: SessionState, to: SessionState) {
    assert!(!can_transition(from, to), "{from} → {to} should be illegal");
}

#[test]
fn full_lifecycle_records_six_transitions() {
    let mut s = Session::new("s1", ProviderKind::Pty, "/tmp");
    for (to, reason) in [
        (SessionState::Starting, "start"),
        (SessionState::Running, "spawned"),
        (SessionState::Paused, "pause"),
        (SessionState::Running, "resume"),
        (SessionState::Stopping, "stop"),
        (SessionState::Stopped, "exited"),
    ] {
        s.transition(to, reason).unwrap();
    }

    assert_eq!(s.transitions.len(), 6);
    assert_eq!(s.state, SessionState::Stopped);
    assert_eq!(s.derived_state(), SessionState::Stopped);
    assert!(s.is_terminal());
}

#[test]
fn illegal_transition_does_not_mutate() {
    let mut s = running_session();
    let before = s.clone();

    let err = s.transition(SessionState::Stopped, "shortcut").unwrap_err();
    assert_eq!(
        err,
        StateError::InvalidTransition { from: SessionState::Running, to: SessionState::Stopped }
    );
    assert_eq!(s.state, before.state);
    assert_eq!(s.transitions, before.transitions);
    assert_eq!(s.updated_at_ms, before.updated_at_ms);
}

#[test]
fn state_matches_last_transition() {
    let s = running_session();
    assert_eq!(s.state, s.transitions.last().map(|t| t.to).unwrap());
}

#[test]
fn fresh_session_derives_created() {
    let s = Session::new("s1", ProviderKind::Native, "/work");
    assert_eq!(s.derived_state(), SessionState::Created);
    assert!(s.transitions.is_empty());
}

#[test]
fn snapshot_round_trip_preserves_derived_state() -> anyhow::Result<()> {
    let mut s = running_session();
    s.current_task = Some("build the thing".into());
    s.title = "my session".into();

    let json = serde_json::to_string(&s)?;
    let restored: Session = serde_json::from_str(&json)?;

    assert_eq!(restored.state, SessionState::Running);
    assert_eq!(restored.derived_state(), restored.state);
    assert_eq!(restored.transitions.len(), s.transitions.len());
    assert_eq!(restored.current_task.as_deref(), Some("build the thing"));
    Ok(())
}

#[test]
fn transition_reason_is_recorded() {
    let s = running_session();
    assert_eq!(s.transitions[0].reason, "start");
    assert_eq!(s.transitions[1].reason, "spawned");
    assert!(s.transitions.iter().all(|t| t.timestamp_ms > 0));
}
