// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tokio::sync::mpsc;
use yare::parameterized;

use crate::ledger::ByteLedger;
use crate::wire::InboundMessage;

use super::*;

fn runtime() -> TerminalRuntime {
    TerminalRuntime::new("t1", "s1", TerminalKind::Pty, 80, 24, None, None, false)
}

fn runtime_with_input() -> (TerminalRuntime, mpsc::Receiver<TerminalInput>) {
    let (tx, rx) = mpsc::channel(16);
    let rt = TerminalRuntime::new("t1", "s1", TerminalKind::Pty, 80, 24, None, Some(tx), false);
    (rt, rx)
}

#[tokio::test]
async fn output_becomes_diff_events() -> anyhow::Result<()> {
    let rt = runtime();
    let (_, mut rx) = rt.subscribe(DEFAULT_DIFF_BUFFER).await;

    rt.apply_output(b"hello").await?;

    let event = rx.try_recv()?;
    match event {
        TerminalEvent::Diff { first_row, ref lines, .. } => {
            assert_eq!(first_row, 0);
            assert!(lines[0].contains("hello"));
        }
        other => anyhow::bail!("expected diff, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn event_seq_is_strictly_increasing() -> anyhow::Result<()> {
    let rt = runtime();
    let (_, mut rx) = rt.subscribe(DEFAULT_DIFF_BUFFER).await;

    rt.apply_output(b"one").await?;
    rt.apply_output(b" two\x07").await?;
    rt.emit_snapshot().await;

    let mut last = 0;
    while let Ok(event) = rx.try_recv() {
        assert!(event.seq() > last, "seq {} not > {last}", event.seq());
        last = event.seq();
    }
    assert!(last >= 3);
    Ok(())
}

#[tokio::test]
async fn bytes_are_teed_to_the_ledger() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("t.ptylog");
    let bytelog = ByteLedger::open(&path)?;
    let rt = TerminalRuntime::new("t1", "s1", TerminalKind::Pty, 80, 24, Some(bytelog), None, false);

    rt.apply_output(b"persisted").await?;

    let outcome = ByteLedger::replay(&path)?;
    assert_eq!(outcome.frames.len(), 1);
    assert_eq!(outcome.frames[0].payload, b"persisted");
    Ok(())
}

#[tokio::test]
async fn replay_rebuilds_screen_without_reappending() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("t.ptylog");

    {
        let bytelog = ByteLedger::open(&path)?;
        let rt =
            TerminalRuntime::new("t1", "s1", TerminalKind::Pty, 80, 24, Some(bytelog), None, false);
        rt.apply_output(b"before crash").await?;
    }

    let outcome = ByteLedger::replay(&path)?;
    let rt = runtime();
    rt.apply_replay(&outcome.frames).await;

    let snapshot = rt.snapshot().await;
    assert!(snapshot.lines[0].contains("before crash"));

    // Replay must not have grown the ledger.
    let again = ByteLedger::replay(&path)?;
    assert_eq!(again.frames.len(), outcome.frames.len());
    Ok(())
}

#[tokio::test]
async fn slow_watcher_is_dropped() -> anyhow::Result<()> {
    let rt = runtime();
    let (id, _rx) = rt.subscribe(1).await;

    // Two damaging writes: the second emit overflows the 1-slot queue.
    rt.apply_output(b"first\r\n").await?;
    rt.apply_output(b"second\r\n").await?;

    assert!(!rt.unsubscribe(id).await, "watcher should have been dropped");
    Ok(())
}

#[tokio::test]
async fn snapshot_event_carries_screen() -> anyhow::Result<()> {
    let rt = runtime();
    rt.apply_output(b"snapshot me").await?;
    let (_, mut rx) = rt.subscribe(DEFAULT_DIFF_BUFFER).await;

    rt.emit_snapshot().await;

    match rx.try_recv()? {
        TerminalEvent::Snapshot { snapshot, .. } => {
            assert!(snapshot.lines[0].contains("snapshot me"));
        }
        other => anyhow::bail!("expected snapshot, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn record_reflects_current_state() -> anyhow::Result<()> {
    let rt = runtime();
    rt.apply_output(b"recorded").await?;

    let record = rt.to_record().await;
    assert_eq!(record.id, "t1");
    assert_eq!(record.session_id, "s1");
    assert_eq!(record.kind, TerminalKind::Pty);
    assert_eq!(record.last_seq, rt.last_seq());
    assert!(record.last_snapshot.lines[0].contains("recorded"));

    let json = serde_json::to_string(&record)?;
    let restored: TerminalRecord = serde_json::from_str(&json)?;
    assert_eq!(restored, record);
    Ok(())
}

#[tokio::test]
async fn text_input_reaches_provider_and_records_writer() -> anyhow::Result<()> {
    let (rt, mut input_rx) = runtime_with_input();

    rt.apply_input("client-7", &InboundMessage::Text { text: "ls\n".into() }).await?;

    match input_rx.try_recv()? {
        TerminalInput::Write(data) => assert_eq!(&data[..], b"ls\n"),
        other => anyhow::bail!("expected write, got {other:?}"),
    }
    assert_eq!(rt.last_writer().as_deref(), Some("client-7"));
    Ok(())
}

#[tokio::test]
async fn resize_input_resizes_screen_and_forwards() -> anyhow::Result<()> {
    let (rt, mut input_rx) = runtime_with_input();

    rt.apply_input("c", &InboundMessage::Resize { cols: 100, rows: 30 }).await?;

    assert!(matches!(input_rx.try_recv()?, TerminalInput::Resize { cols: 100, rows: 30 }));
    let snapshot = rt.snapshot().await;
    assert_eq!((snapshot.cols, snapshot.rows), (100, 30));
    Ok(())
}

#[tokio::test]
async fn raw_input_is_rejected_unless_enabled() -> anyhow::Result<()> {
    let (rt, _input_rx) = runtime_with_input();
    let err = rt
        .apply_input("c", &InboundMessage::Raw { data: "\x1b[200~".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, TerminalError::RawInputDisabled));

    let (tx, mut rx) = mpsc::channel(4);
    let rt = TerminalRuntime::new("t2", "s1", TerminalKind::Pty, 80, 24, None, Some(tx), true);
    rt.apply_input("c", &InboundMessage::Raw { data: "ok".into() }).await?;
    assert!(matches!(rx.try_recv()?, TerminalInput::Write(_)));
    Ok(())
}

#[tokio::test]
async fn input_without_sink_fails() {
    let rt = runtime();
    let err = rt.apply_input("c", &InboundMessage::Text { text: "x".into() }).await.unwrap_err();
    assert!(matches!(err, TerminalError::NoInputSink));
}

#[parameterized(
    enter = { "enter", &[], b"\r" as &[u8] },
    escape = { "escape", &[], b"\x1b" },
    up = { "up", &[], b"\x1b[A" },
    delete = { "delete", &[], b"\x1b[3~" },
    ctrl_c = { "c", &["ctrl"], b"\x03" },
    ctrl_z = { "z", &["ctrl"], b"\x1a" },
    plain_char = { "a", &[], b"a" },
)]
fn key_encoding(key: &str, modifiers: &[&str], expected: &[u8]) {
    let modifiers: Vec<String> = modifiers.iter().map(|s| s.to_string()).collect();
    let message = InboundMessage::Key { key: key.to_owned(), modifiers };
    let bytes = encode_input(&message, false).unwrap();
    assert_eq!(&bytes[..], expected);
}

#[test]
fn unknown_key_is_typed_error() {
    let message = InboundMessage::Key { key: "hyperspace".to_owned(), modifiers: vec![] };
    let err = encode_input(&message, false).unwrap_err();
    assert!(matches!(err, TerminalError::UnknownKey { .. }));
}

#[test]
fn control_actions_encode() {
    let message = InboundMessage::Control { action: "interrupt".into() };
    assert_eq!(&encode_input(&message, false).unwrap()[..], b"\x03");

    let message = InboundMessage::Control { action: "warp".into() };
    assert!(matches!(
        encode_input(&message, false).unwrap_err(),
        TerminalError::UnknownControl { .. }
    ));
}
