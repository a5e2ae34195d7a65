// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenario specs exercising the core through its library API:
//! ledger folding, corruption tolerance, state-machine legality,
//! backpressure, crash recovery, and atomic persistence.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use orbitmesh::attempt::AttemptRegistry;
use orbitmesh::hub::Hub;
use orbitmesh::ledger::{
    fold_messages, ActivityLedger, ByteLedger, MessageKind, Projection, DIRECTION_OUT,
};
use orbitmesh::provider::ProviderKind;
use orbitmesh::session::{Session, SessionState};
use orbitmesh::terminal::{TerminalKind, TerminalRuntime};
use orbitmesh::test_support::{stub_executor, StubScript};
use orbitmesh::wire::{EnvelopeType, Topic};

use orbitmesh_specs::SpecEnv;

// -- S1: deterministic fold ---------------------------------------------------

#[test]
fn s1_deterministic_fold() -> anyhow::Result<()> {
    let env = SpecEnv::new()?;
    let store = env.store()?;
    let path = store.activity_path("session-log-order")?;

    let ts = 1_700_000_000_000u64;
    let mut ledger = ActivityLedger::open(&path)?;
    ledger.append_at(ts, Projection::Append, MessageKind::User, "hello", None)?;
    ledger.append_at(
        ts + 1_000,
        Projection::AppendRaw,
        MessageKind::Output,
        "a",
        Some(serde_json::json!({"chunk": 1})),
    )?;
    ledger.append_at(ts + 2_000, Projection::AppendOutputDelta, MessageKind::Output, "b", None)?;
    ledger.append_at(ts + 3_000, Projection::Append, MessageKind::Error, "boom", None)?;

    let (messages, corruption) = fold_messages(&path, "session-log-order")?;
    assert!(corruption.is_none());
    assert_eq!(messages.len(), 3);
    assert_eq!((messages[0].kind, messages[0].contents.as_str()), (MessageKind::User, "hello"));
    assert_eq!((messages[1].kind, messages[1].contents.as_str()), (MessageKind::Output, "ab"));
    assert_eq!((messages[2].kind, messages[2].contents.as_str()), (MessageKind::Error, "boom"));
    Ok(())
}

// -- S2: tolerate corruption --------------------------------------------------

#[test]
fn s2_tolerate_corruption() -> anyhow::Result<()> {
    let env = SpecEnv::new()?;
    let store = env.store()?;
    let path = store.activity_path("session-corrupt")?;

    {
        let mut ledger = ActivityLedger::open(&path)?;
        ledger.append(Projection::Append, MessageKind::User, "first", None)?;
    }
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"not json\n")?;
    }
    {
        let mut ledger = ActivityLedger::open(&path)?;
        ledger.append(Projection::Append, MessageKind::Output, "second", None)?;
    }

    let (messages, corruption) = fold_messages(&path, "session-corrupt")?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].contents, "first");
    assert_eq!(messages[1].contents, "second");

    let corruption = corruption.ok_or_else(|| anyhow::anyhow!("expected corruption error"))?;
    assert_eq!(corruption.corrupt, 1);
    Ok(())
}

// -- S3: state-machine legality -----------------------------------------------

#[test]
fn s3_state_machine_legality() -> anyhow::Result<()> {
    let env = SpecEnv::new()?;
    let store = env.store()?;

    let mut session = Session::new("legality", ProviderKind::Pty, "/work");
    for (to, reason) in [
        (SessionState::Starting, "start"),
        (SessionState::Running, "spawned"),
        (SessionState::Paused, "pause"),
        (SessionState::Running, "resume"),
        (SessionState::Stopping, "stop"),
        (SessionState::Stopped, "exited"),
    ] {
        session.transition(to, reason)?;
    }
    store.save_session(&session)?;

    let restored = store.load_session("legality")?;
    assert_eq!(restored.transitions.len(), 6);
    assert_eq!(restored.state, SessionState::Stopped);
    assert_eq!(restored.derived_state(), SessionState::Stopped);

    // The illegal shortcut fails and mutates nothing.
    let mut running = Session::new("shortcut", ProviderKind::Pty, "/work");
    running.transition(SessionState::Starting, "start")?;
    running.transition(SessionState::Running, "spawned")?;
    let before = running.clone();

    assert!(running.transition(SessionState::Stopped, "shortcut").is_err());
    assert_eq!(running.state, before.state);
    assert_eq!(running.transitions, before.transitions);
    Ok(())
}

// -- S4: backpressure drop ----------------------------------------------------

#[tokio::test]
async fn s4_backpressure_drop() -> anyhow::Result<()> {
    let hub = Hub::new();

    let mut fast = hub.subscribe(&[Topic::SessionsState], 65).await;
    let slow = hub.subscribe(&[Topic::SessionsState], 64).await;

    for i in 0..65 {
        hub.publish(&Topic::SessionsState, EnvelopeType::SessionsState, serde_json::json!({"i": i}))
            .await;
    }

    // A received all 65 in order.
    let mut last_seq = 0;
    for i in 0..65 {
        let envelope = fast
            .receiver
            .try_recv()
            .map_err(|e| anyhow::anyhow!("fast subscriber missing envelope {i}: {e}"))?;
        assert_eq!(envelope.payload["i"], i);
        assert!(envelope.seq > last_seq);
        last_seq = envelope.seq;
    }

    // B was unregistered at the overflow; publishing to it is now a no-op.
    assert_eq!(hub.subscriber_count().await, 1);
    assert!(!hub.unsubscribe(slow.id).await);
    hub.publish(&Topic::SessionsState, EnvelopeType::SessionsState, serde_json::json!({"late": 1}))
        .await;
    assert_eq!(hub.subscriber_count().await, 1);
    Ok(())
}

// -- S5: crash recovery -------------------------------------------------------

#[tokio::test]
async fn s5_crash_recovery_replays_byte_ledger() -> anyhow::Result<()> {
    let env = SpecEnv::new()?;
    let store = env.store()?;

    // Pre-crash state, exactly as a dead process leaves it: a running
    // session snapshot, an open attempt from an older boot, and PTY bytes
    // in the ledger.
    let mut session = Session::new("crashed", ProviderKind::Pty, "/work");
    session.command = vec!["agent".to_owned()];
    session.transition(SessionState::Starting, "start")?;
    session.transition(SessionState::Running, "spawned")?;
    store.save_session(&session)?;

    let old_registry = AttemptRegistry::new(store.clone());
    let attempt = old_registry.begin("crashed", ProviderKind::Pty)?;
    assert!(attempt.is_open());

    {
        let mut bytelog = ByteLedger::open(&store.bytelog_path("crashed")?)?;
        bytelog.append(DIRECTION_OUT, 1, b"line one\r\n")?;
        bytelog.append(DIRECTION_OUT, 2, b"line two, \xe2\x98\x85 starred\r\n")?;
    }

    // The snapshot the dead process would have shown.
    let expected = {
        let runtime =
            TerminalRuntime::new("crashed", "crashed", TerminalKind::Pty, 200, 50, None, None, false);
        let frames = ByteLedger::replay(&store.bytelog_path("crashed")?)?.frames;
        runtime.apply_replay(&frames).await;
        runtime.snapshot().await
    };

    // Restart: a fresh executor over the same base dir.
    let executor = stub_executor(env.base(), StubScript::default())?;
    let report = executor.startup().await?;
    assert_eq!(report.unresumable, vec!["crashed".to_owned()]);

    // The session recovered to error, the attempt was closed with a
    // recovery reason.
    let recovered = executor.get_session("crashed").await?;
    assert_eq!(recovered.state, SessionState::Error);

    let attempts = store.list_attempts("crashed")?.items;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].ended_at_ms.is_some());
    let reason = attempts[0].terminal_reason.clone().unwrap_or_default();
    assert!(reason.starts_with("recovered-"), "reason was {reason:?}");

    // The reconstructed terminal matches the pre-crash screen line for line.
    let record = store.load_terminal("crashed")?;
    assert_eq!(record.last_snapshot.lines, expected.lines);

    executor.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn s5_resumable_attempt_comes_back_running() -> anyhow::Result<()> {
    let env = SpecEnv::new()?;
    let store = env.store()?;

    let mut session = Session::new("resumable", ProviderKind::Native, "/work");
    session.command = vec!["stub".to_owned()];
    session.transition(SessionState::Starting, "start")?;
    session.transition(SessionState::Running, "spawned")?;
    store.save_session(&session)?;

    let old_registry = AttemptRegistry::new(store.clone());
    let mut attempt = old_registry.begin("resumable", ProviderKind::Native)?;
    old_registry.record_provider_id(&mut attempt, Some("sdk-77".to_owned()))?;

    let executor = stub_executor(env.base(), StubScript {
        events: vec![orbitmesh::test_support::StubEvent::HoldUntilStopped],
        ..StubScript::default()
    })?;
    let report = executor.startup().await?;
    assert_eq!(report.resumed, vec!["resumable".to_owned()]);

    let recovered = executor.get_session("resumable").await?;
    assert_eq!(recovered.state, SessionState::Running);

    // Old attempt closed as resumed; a fresh one is open.
    let attempts = store.list_attempts("resumable")?.items;
    let closed: Vec<_> = attempts.iter().filter(|a| a.ended_at_ms.is_some()).collect();
    let open: Vec<_> = attempts.iter().filter(|a| a.is_open()).collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].terminal_reason.as_deref(), Some("recovered-resumed"));
    assert_eq!(open.len(), 1);

    executor.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

// -- S6: atomic write ---------------------------------------------------------

#[test]
fn s6_atomic_write_leaves_no_temp_files() -> anyhow::Result<()> {
    let env = SpecEnv::new()?;
    let store = env.store()?;

    let mut session = Session::new("atomic", ProviderKind::Pty, "/work");
    session.transition(SessionState::Starting, "start")?;
    store.save_session(&session)?;

    let registry = AttemptRegistry::new(store.clone());
    registry.begin("atomic", ProviderKind::Pty)?;

    store.save_legacy_snapshot("atomic", &serde_json::json!({"legacy": true}))?;
    store.save_projects(&[])?;

    // No .tmp anywhere under the base dir; every file is exactly 0600.
    let mut stack = vec![env.base().to_owned()];
    let mut files = 0usize;
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".tmp"), "leftover temp file {path:?}");
            if path.is_dir() {
                stack.push(path);
            } else {
                files += 1;
                let mode = entry.metadata()?.permissions().mode() & 0o777;
                assert_eq!(mode, 0o600, "mode of {path:?}");
            }
        }
    }
    assert!(files >= 4, "expected the saved blobs on disk, found {files}");
    Ok(())
}
