// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serial_test::serial;
use tokio_util::sync::CancellationToken;

use super::*;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn drain_until_exit(events: &mut tokio::sync::mpsc::Receiver<ProviderEvent>) -> Vec<ProviderEvent> {
    let mut collected = Vec::new();
    loop {
        let event = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .ok()
            .flatten();
        match event {
            Some(event) => {
                let terminal = event.is_terminal();
                collected.push(event);
                if terminal {
                    break;
                }
            }
            None => break,
        }
    }
    collected
}

#[tokio::test]
#[serial] // forks real children and delivers process-group signals
async fn echo_emits_output_and_exit() -> anyhow::Result<()> {
    let spec = LaunchSpec::new(
        "pty-echo",
        std::env::temp_dir(),
        vec!["/bin/echo".to_owned(), "pty-marker".to_owned()],
    );
    let mut provider = PtyProvider::build(&spec).map_err(|e| anyhow::anyhow!("{e}"))?;
    provider
        .start(CancellationToken::new())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut events = provider.take_events().ok_or_else(|| anyhow::anyhow!("no events"))?;
    let collected = drain_until_exit(&mut events).await;

    assert!(matches!(collected.first(), Some(ProviderEvent::Started { .. })));
    let output: Vec<u8> = collected
        .iter()
        .filter_map(|e| match e {
            ProviderEvent::Output(data) => Some(data.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("pty-marker"), "output was {text:?}");
    assert!(matches!(collected.last(), Some(ProviderEvent::Exited { code: Some(0), .. })));
    Ok(())
}

#[tokio::test]
#[serial]
async fn status_reports_stopped_after_exit() -> anyhow::Result<()> {
    let spec = LaunchSpec::new("pty-true", std::env::temp_dir(), vec!["/bin/true".to_owned()]);
    let mut provider = PtyProvider::build(&spec).map_err(|e| anyhow::anyhow!("{e}"))?;
    provider
        .start(CancellationToken::new())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut events = provider.take_events().ok_or_else(|| anyhow::anyhow!("no events"))?;
    drain_until_exit(&mut events).await;

    let status = provider.status();
    assert_eq!(status.state, ProviderState::Stopped);
    Ok(())
}

#[tokio::test]
#[serial]
async fn input_reaches_the_child() -> anyhow::Result<()> {
    let spec = LaunchSpec::new("pty-cat", std::env::temp_dir(), vec!["/bin/cat".to_owned()]);
    let mut provider = PtyProvider::build(&spec).map_err(|e| anyhow::anyhow!("{e}"))?;
    provider
        .start(CancellationToken::new())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let input = provider.terminal_input().ok_or_else(|| anyhow::anyhow!("no input sender"))?;
    input
        .send(TerminalInput::Write(bytes::Bytes::from_static(b"round-trip\n")))
        .await?;
    // EOT makes cat exit.
    input.send(TerminalInput::Write(bytes::Bytes::from_static(b"\x04"))).await?;

    let mut events = provider.take_events().ok_or_else(|| anyhow::anyhow!("no events"))?;
    let collected = drain_until_exit(&mut events).await;

    let output: Vec<u8> = collected
        .iter()
        .filter_map(|e| match e {
            ProviderEvent::Output(data) => Some(data.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(String::from_utf8_lossy(&output).contains("round-trip"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn shutdown_token_terminates_child() -> anyhow::Result<()> {
    let spec = LaunchSpec::new(
        "pty-sleep",
        std::env::temp_dir(),
        vec!["/bin/sleep".to_owned(), "60".to_owned()],
    );
    let mut provider = PtyProvider::build(&spec).map_err(|e| anyhow::anyhow!("{e}"))?;
    let shutdown = CancellationToken::new();
    provider.start(shutdown.clone()).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut events = provider.take_events().ok_or_else(|| anyhow::anyhow!("no events"))?;
    shutdown.cancel();
    let collected = drain_until_exit(&mut events).await;

    assert!(matches!(collected.last(), Some(ProviderEvent::Exited { .. })));
    Ok(())
}

#[test]
fn build_rejects_empty_command() {
    let spec = LaunchSpec::new("pty-none", "/tmp", vec![]);
    let err = PtyProvider::build(&spec).map(|_| ()).unwrap_err();
    assert!(matches!(err, ProviderError::Refused { op: "start", .. }));
}
