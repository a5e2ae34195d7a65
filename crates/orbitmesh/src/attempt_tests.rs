// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::provider::ProviderKind;
use crate::store::BlobStore;

use super::*;

fn registry(dir: &std::path::Path) -> AttemptRegistry {
    AttemptRegistry::new(BlobStore::open(dir).unwrap())
}

#[test]
fn begin_persists_attempt_and_token() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = BlobStore::open(tmp.path())?;
    let registry = AttemptRegistry::new(store.clone());

    let attempt = registry.begin("sess-1", ProviderKind::Pty)?;
    assert!(attempt.is_open());
    assert_eq!(attempt.boot_id, registry.boot_id());

    let loaded = store.load_attempt("sess-1", &attempt.attempt_id)?;
    assert_eq!(loaded, attempt);

    let token_id = attempt.resume_token_id.as_deref().unwrap();
    let token = store.load_token(token_id)?;
    assert_eq!(token.attempt_id, attempt.attempt_id);
    assert_eq!(token.session_id, "sess-1");
    assert!(token.expires_at_ms > token.created_at_ms);
    Ok(())
}

#[test]
fn open_attempts_excludes_finished() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = registry(tmp.path());

    let _open = registry.begin("sess-open", ProviderKind::Native)?;
    let mut done = registry.begin("sess-done", ProviderKind::Native)?;
    registry.finish(&mut done, "stopped")?;

    let (open, errors) = registry.open_attempts()?;
    assert!(errors.is_empty());
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].session_id, "sess-open");
    Ok(())
}

#[test]
fn finish_stamps_reason_and_revokes_token() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = BlobStore::open(tmp.path())?;
    let registry = AttemptRegistry::new(store.clone());

    let mut attempt = registry.begin("sess-1", ProviderKind::Pty)?;
    registry.finish(&mut attempt, REASON_RECOVERED_UNRESUMABLE)?;

    assert!(attempt.ended_at_ms.is_some());
    assert_eq!(attempt.terminal_reason.as_deref(), Some(REASON_RECOVERED_UNRESUMABLE));

    let token_id = attempt.resume_token_id.as_deref().unwrap();
    let token = store.load_token(token_id)?;
    assert!(token.revoked_at_ms.is_some());
    Ok(())
}

#[test]
fn token_is_single_use() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = registry(tmp.path());

    let attempt = registry.begin("sess-1", ProviderKind::Acp)?;
    let token_id = attempt.resume_token_id.clone().unwrap();

    let consumed = registry.consume_token(&token_id)?;
    assert!(consumed.consumed_at_ms.is_some());

    let err = registry.consume_token(&token_id).unwrap_err();
    assert!(matches!(err, TokenError::Consumed));
    Ok(())
}

#[test]
fn revoked_token_cannot_be_consumed() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = registry(tmp.path());

    let attempt = registry.begin("sess-1", ProviderKind::Acp)?;
    let token_id = attempt.resume_token_id.clone().unwrap();

    registry.revoke_token(&token_id, "operator request")?;
    // Revoking again is a no-op.
    registry.revoke_token(&token_id, "again")?;

    let err = registry.consume_token(&token_id).unwrap_err();
    assert!(matches!(err, TokenError::Revoked { ref reason } if reason == "operator request"));
    Ok(())
}

#[test]
fn expired_token_cannot_be_consumed() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = BlobStore::open(tmp.path())?;
    let registry = AttemptRegistry::new(store.clone());

    let attempt = registry.begin("sess-1", ProviderKind::Native)?;
    let token_id = attempt.resume_token_id.clone().unwrap();

    let mut token = store.load_token(&token_id)?;
    token.expires_at_ms = 1;
    store.save_token(&token)?;

    let err = registry.consume_token(&token_id).unwrap_err();
    assert!(matches!(err, TokenError::Expired));
    Ok(())
}

#[test]
fn heartbeat_updates_timestamp() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = BlobStore::open(tmp.path())?;
    let registry = AttemptRegistry::new(store.clone());

    let mut attempt = registry.begin("sess-1", ProviderKind::Pty)?;
    let before = attempt.heartbeat_at_ms;
    std::thread::sleep(std::time::Duration::from_millis(5));
    registry.heartbeat(&mut attempt)?;
    assert!(attempt.heartbeat_at_ms >= before);

    // Rapid heartbeats are throttled to one persist per second, but the
    // in-memory timestamp still advances.
    let t1 = attempt.heartbeat_at_ms;
    registry.heartbeat(&mut attempt)?;
    assert!(attempt.heartbeat_at_ms >= t1);
    Ok(())
}

#[test]
fn boot_id_differs_per_registry() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = BlobStore::open(tmp.path())?;
    let first = AttemptRegistry::new(store.clone());
    let second = AttemptRegistry::new(store);
    assert_ne!(first.boot_id(), second.boot_id());
    Ok(())
}

#[test]
fn attempt_round_trips_through_json() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry = registry(tmp.path());
    let mut attempt = registry.begin("sess-1", ProviderKind::Pty)?;
    attempt.wait_kind = Some("process".to_owned());
    attempt.wait_ref = Some("1234".to_owned());
    attempt.interruption_reason = Some("sigkill".to_owned());

    let json = serde_json::to_string(&attempt)?;
    let restored: RunAttempt = serde_json::from_str(&json)?;
    assert_eq!(restored, attempt);
    Ok(())
}
