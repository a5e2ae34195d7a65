// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY provider: spawns the session command on a pseudo-terminal via
//! `forkpty` and streams raw output as provider events.
//!
//! Pause and resume map to `SIGSTOP`/`SIGCONT` on the child's process
//! group. PTY sessions cannot be re-attached after a control-plane restart;
//! recovery replays the byte ledger instead.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    BoxFuture, LaunchSpec, Provider, ProviderError, ProviderEvent, ProviderMetrics, ProviderState,
    ProviderStatus, TerminalInput,
};

/// How long `stop` waits for a graceful exit before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Tail of recent output kept for `status().output_snippet`.
const SNIPPET_LEN: usize = 256;

/// PTY master fd registered with the tokio reactor.
///
/// All I/O goes through readiness guards: a `WouldBlock` clears the guard's
/// readiness and the loop re-arms instead of spinning. The fd is switched
/// to non-blocking mode on construction, before the reactor ever sees it.
struct Master {
    afd: AsyncFd<OwnedFd>,
}

impl Master {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(&fd, FcntlArg::F_GETFL).map_err(errno_to_io)?;
        let nonblocking = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(&fd, FcntlArg::F_SETFL(nonblocking)).map_err(errno_to_io)?;
        Ok(Self { afd: AsyncFd::new(fd)? })
    }

    /// Read the next chunk of child output into `buf`.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.afd.readable().await?;
            if let Ok(result) =
                guard.try_io(|fd| nix::unistd::read(fd, buf).map_err(errno_to_io))
            {
                return result;
            }
        }
    }

    /// Write all of `data` to the child, advancing through short writes.
    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let mut guard = self.afd.writable().await?;
            if let Ok(written) =
                guard.try_io(|fd| nix::unistd::write(fd.get_ref(), rest).map_err(errno_to_io))
            {
                rest = &rest[written?..];
            }
        }
        Ok(())
    }
}

impl AsRawFd for Master {
    fn as_raw_fd(&self) -> RawFd {
        self.afd.as_raw_fd()
    }
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Fields shared between the adapter handle and its I/O task.
struct Shared {
    state: Mutex<ProviderState>,
    error: Mutex<Option<String>>,
    snippet: Mutex<String>,
    child_pid: AtomicI32,
    bytes_emitted: AtomicU64,
    events_emitted: AtomicU64,
    exited: Notify,
}

impl Shared {
    fn set_state(&self, state: ProviderState) {
        #[allow(clippy::unwrap_used)] // no poisoning: holders never panic
        let mut guard = self.state.lock().unwrap();
        *guard = state;
    }

    fn push_snippet(&self, data: &[u8]) {
        #[allow(clippy::unwrap_used)]
        let mut snippet = self.snippet.lock().unwrap();
        snippet.push_str(&String::from_utf8_lossy(data));
        if snippet.len() > SNIPPET_LEN {
            let cut = snippet.len() - SNIPPET_LEN;
            let cut = snippet
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= cut)
                .unwrap_or(cut);
            snippet.drain(..cut);
        }
    }
}

/// PTY-backed provider adapter.
pub struct PtyProvider {
    spec: LaunchSpec,
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<ProviderEvent>>,
    input_tx: Option<mpsc::Sender<TerminalInput>>,
}

impl PtyProvider {
    /// Factory entry point.
    pub fn build(spec: &LaunchSpec) -> Result<Box<dyn Provider>, ProviderError> {
        if spec.command.is_empty() {
            return Err(ProviderError::Refused {
                op: "start",
                detail: "pty provider requires a command".to_owned(),
            });
        }
        Ok(Box::new(Self {
            spec: spec.clone(),
            shared: Arc::new(Shared {
                state: Mutex::new(ProviderState::Starting),
                error: Mutex::new(None),
                snippet: Mutex::new(String::new()),
                child_pid: AtomicI32::new(0),
                bytes_emitted: AtomicU64::new(0),
                events_emitted: AtomicU64::new(0),
                exited: Notify::new(),
            }),
            events_rx: None,
            input_tx: None,
        }))
    }

    fn child_pid(&self) -> Option<Pid> {
        let raw = self.shared.child_pid.load(Ordering::Acquire);
        (raw != 0).then(|| Pid::from_raw(raw))
    }

    /// Signal the child's process group (negative pid) so grandchildren are
    /// covered too.
    fn signal_group(&self, signal: Signal) -> Result<(), ProviderError> {
        let pid = self.child_pid().ok_or(ProviderError::NotRunning)?;
        kill(Pid::from_raw(-pid.as_raw()), signal)
            .map_err(|e| ProviderError::Io(std::io::Error::from_raw_os_error(e as i32)))
    }

    /// Spawn the child on a fresh PTY.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    fn spawn_child(
        spec: &LaunchSpec,
    ) -> anyhow::Result<(Master, Pid)> {
        let winsize = Winsize {
            ws_col: spec.cols,
            ws_row: spec.rows,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("ORBITMESH", "1");
                let _ = std::env::set_current_dir(&spec.cwd);

                let c_args: Vec<CString> = spec
                    .command
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;

                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                let master = Master::new(master).context("master fd setup failed")?;
                Ok((master, child))
            }
        }
    }
}

impl Provider for PtyProvider {
    fn start(&mut self, shutdown: CancellationToken) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            let (master, child) = Self::spawn_child(&self.spec)
                .map_err(|e| ProviderError::Refused { op: "start", detail: format!("{e:#}") })?;

            self.shared.child_pid.store(child.as_raw(), Ordering::Release);
            self.shared.set_state(ProviderState::Running);

            let (events_tx, events_rx) = mpsc::channel(256);
            let (input_tx, input_rx) = mpsc::channel(256);
            self.events_rx = Some(events_rx);
            self.input_tx = Some(input_tx);

            let _ = events_tx.send(ProviderEvent::Started { provider_session_id: None }).await;

            let shared = Arc::clone(&self.shared);
            tokio::spawn(io_task(master, child, events_tx, input_rx, shared, shutdown));
            Ok(())
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            if self.child_pid().is_none() {
                return Ok(());
            }
            let _ = self.signal_group(Signal::SIGHUP);

            tokio::select! {
                _ = self.shared.exited.notified() => Ok(()),
                _ = tokio::time::sleep(STOP_GRACE) => {
                    warn!("pty child did not exit within {STOP_GRACE:?}, sending SIGKILL");
                    let _ = self.signal_group(Signal::SIGKILL);
                    tokio::select! {
                        _ = self.shared.exited.notified() => Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            Err(ProviderError::Refused {
                                op: "stop",
                                detail: "child unresponsive to SIGKILL".to_owned(),
                            })
                        }
                    }
                }
            }
        })
    }

    fn pause(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            self.signal_group(Signal::SIGSTOP)?;
            self.shared.set_state(ProviderState::Paused);
            Ok(())
        })
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            self.signal_group(Signal::SIGCONT)?;
            self.shared.set_state(ProviderState::Running);
            Ok(())
        })
    }

    fn kill(&mut self) -> Result<(), ProviderError> {
        self.signal_group(Signal::SIGKILL)
    }

    fn status(&self) -> ProviderStatus {
        #[allow(clippy::unwrap_used)]
        let state = *self.shared.state.lock().unwrap();
        #[allow(clippy::unwrap_used)]
        let error = self.shared.error.lock().unwrap().clone();
        #[allow(clippy::unwrap_used)]
        let output_snippet = self.shared.snippet.lock().unwrap().clone();
        ProviderStatus {
            state,
            current_task: None,
            output_snippet,
            error,
            metrics: ProviderMetrics {
                bytes_emitted: self.shared.bytes_emitted.load(Ordering::Relaxed),
                events_emitted: self.shared.events_emitted.load(Ordering::Relaxed),
            },
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.events_rx.take()
    }

    fn owns_terminal(&self) -> bool {
        true
    }

    fn terminal_input(&self) -> Option<mpsc::Sender<TerminalInput>> {
        self.input_tx.clone()
    }
}

impl Drop for PtyProvider {
    fn drop(&mut self) {
        // Best-effort: make sure no orphaned child outlives the adapter.
        if let Some(pid) = self.child_pid() {
            let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGHUP);
            let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}

/// Pump PTY output into the event channel and input onto the master fd.
///
/// Runs until the child closes its side (EOF/EIO) or the shutdown token
/// fires, then reaps the child and emits the terminal `Exited` event.
async fn io_task(
    master: Master,
    child: Pid,
    events_tx: mpsc::Sender<ProviderEvent>,
    mut input_rx: mpsc::Receiver<TerminalInput>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; 8192];
    let mut hup_sent = false;
    let mut input_closed = false;

    loop {
        tokio::select! {
            result = master.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        shared.bytes_emitted.fetch_add(n as u64, Ordering::Relaxed);
                        shared.events_emitted.fetch_add(1, Ordering::Relaxed);
                        shared.push_snippet(&data);
                        if events_tx.send(ProviderEvent::Output(data)).await.is_err() {
                            break;
                        }
                    }
                    // EIO means the slave side closed — normal child exit.
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                    Err(e) => {
                        let detail = format!("pty read failed: {e}");
                        set_error(&shared, &detail);
                        let _ = events_tx.send(ProviderEvent::Errored { detail }).await;
                        shared.exited.notify_waiters();
                        return;
                    }
                }
            }
            input = input_rx.recv(), if !input_closed => {
                match input {
                    Some(TerminalInput::Write(data)) => {
                        if let Err(e) = master.write_all(&data).await {
                            debug!("pty write failed: {e}");
                        }
                    }
                    Some(TerminalInput::Resize { cols, rows }) => {
                        if let Err(e) = resize_master(&master, cols, rows) {
                            debug!("pty resize failed: {e}");
                        }
                    }
                    None => {
                        // All input senders dropped — keep draining output.
                        input_closed = true;
                    }
                }
            }
            _ = shutdown.cancelled(), if !hup_sent => {
                debug!("shutdown: sending SIGHUP to pty child group");
                let _ = kill(Pid::from_raw(-child.as_raw()), Signal::SIGHUP);
                hup_sent = true;
            }
        }
    }

    // Reap on a blocking thread to avoid stalling the runtime.
    let status = tokio::task::spawn_blocking(move || wait_for_exit(child)).await;
    let (code, signal) = match status {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!("waitpid failed: {e}");
            (Some(1), None)
        }
        Err(e) => {
            warn!("reap task failed: {e}");
            (Some(1), None)
        }
    };

    shared.set_state(ProviderState::Stopped);
    shared.child_pid.store(0, Ordering::Release);
    let _ = events_tx.send(ProviderEvent::Exited { code, signal }).await;
    shared.exited.notify_waiters();
}

fn set_error(shared: &Shared, detail: &str) {
    shared.set_state(ProviderState::Error);
    #[allow(clippy::unwrap_used)]
    let mut error = shared.error.lock().unwrap();
    *error = Some(detail.to_owned());
}

// TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
#[allow(unsafe_code)]
fn resize_master(master: &Master, cols: u16, rows: u16) -> io::Result<()> {
    let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window size
    // on the PTY master fd. The Winsize struct is properly initialized.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Block until the child exits, returning `(code, signal)`.
fn wait_for_exit(pid: Pid) -> anyhow::Result<(Option<i32>, Option<i32>)> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok((Some(code), None)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok((None, Some(sig as i32))),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => return Ok((None, None)),
            Err(e) => anyhow::bail!("waitpid failed: {e}"),
        }
    }
}

#[cfg(test)]
#[path = "pty_tests.rs"]
mod tests;
