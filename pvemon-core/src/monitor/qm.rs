//! `qm monitor <vmid>` session client.

use super::deferred::DeferredCloseRegistry;
use super::{MonitorClient, MonitorCommand, SessionCommandResult, SessionHandle, VmId};
use crate::error::{PvemonError, Result};
use crate::observability::metrics::{counter_name, MONITOR_FAILURES_TOTAL, MONITOR_SESSIONS_TOTAL};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument, warn};

/// Prompt printed by `qm monitor` when it is ready for input.
pub const PROMPT: &str = "qm>";

/// Session client that spawns one `qm monitor` process per command.
pub struct QmMonitorClient {
    program: String,
    timeout: Duration,
    close_timeout: Duration,
    deferred: Option<Arc<DeferredCloseRegistry>>,
}

impl QmMonitorClient {
    /// `deferred` receives sessions that fail to close. When `None`, a
    /// teardown failure is returned as the error of the call.
    pub fn new(
        program: impl Into<String>,
        timeout: Duration,
        close_timeout: Duration,
        deferred: Option<Arc<DeferredCloseRegistry>>,
    ) -> Self {
        Self { program: program.into(), timeout, close_timeout, deferred }
    }
}

#[async_trait]
impl MonitorClient for QmMonitorClient {
    #[instrument(skip(self), fields(vm_id = %vmid, command = %command))]
    async fn run(&self, vmid: &VmId, command: MonitorCommand) -> Result<SessionCommandResult> {
        let mut session = QmSession::spawn(&self.program, vmid)?;
        let outcome = session.exchange(command, self.timeout).await;

        let raw_text = finish_session(session, outcome, self.close_timeout, self.deferred.as_deref()).await?;
        debug!(bytes = raw_text.len(), "monitor command completed");
        metrics::counter!(counter_name(MONITOR_SESSIONS_TOTAL), "command" => command.as_str()).increment(1);
        Ok(SessionCommandResult::new(vmid.clone(), command, raw_text))
    }
}

/// Close `session` and settle the outcome of the command that ran on it.
///
/// A session that fails to close goes to `deferred` when one is given, and
/// the command outcome is returned unchanged. Without a registry the close
/// error replaces a successful outcome; a failed command keeps its own error.
pub async fn finish_session<S, T>(
    mut session: S,
    outcome: Result<T>,
    close_timeout: Duration,
    deferred: Option<&DeferredCloseRegistry>,
) -> Result<T>
where
    S: SessionHandle + 'static,
{
    if let Err(close_err) = session.close(close_timeout).await {
        match deferred {
            Some(registry) => registry.defer(Box::new(session)),
            None if outcome.is_ok() => return Err(close_err),
            None => warn!(vm_id = %session.vmid(), error = %close_err, "failed to terminate monitor session"),
        }
    }
    outcome
}

/// One running `qm monitor` process.
pub struct QmSession {
    vmid: VmId,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl QmSession {
    pub fn spawn(program: &str, vmid: &VmId) -> Result<Self> {
        let mut child = Command::new(program)
            .arg("monitor")
            .arg(vmid.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                metrics::counter!(counter_name(MONITOR_FAILURES_TOTAL), "reason" => "spawn_failed")
                    .increment(1);
                PvemonError::SessionSpawn { vmid: vmid.to_string(), source: e }
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self { vmid: vmid.clone(), child, stdin, stdout })
    }

    pub async fn exchange(&mut self, command: MonitorCommand, timeout: Duration) -> Result<String> {
        let (Some(stdin), Some(stdout)) = (self.stdin.as_mut(), self.stdout.as_mut()) else {
            return Err(PvemonError::SessionClosed { vmid: self.vmid.to_string() });
        };
        exchange(&self.vmid, stdout, stdin, command, timeout).await
    }
}

#[async_trait]
impl SessionHandle for QmSession {
    fn vmid(&self) -> &VmId {
        &self.vmid
    }

    /// Close stdin so `qm` exits on EOF, then kill it if it is still alive
    /// after `timeout`.
    async fn close(&mut self, timeout: Duration) -> Result<()> {
        self.stdin.take();
        self.stdout.take();

        if let Ok(Ok(status)) = tokio::time::timeout(timeout, self.child.wait()).await {
            debug!(vm_id = %self.vmid, %status, "monitor session exited");
            return Ok(());
        }

        if let Err(e) = self.child.start_kill() {
            return Err(PvemonError::TeardownFailure {
                vmid: self.vmid.to_string(),
                reason: format!("kill failed: {}", e),
            });
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PvemonError::TeardownFailure {
                vmid: self.vmid.to_string(),
                reason: format!("wait failed: {}", e),
            }),
            Err(_) => {
                metrics::counter!(counter_name(MONITOR_FAILURES_TOTAL), "reason" => "teardown").increment(1);
                Err(PvemonError::TeardownFailure {
                    vmid: self.vmid.to_string(),
                    reason: format!("process still running {:?} after kill", timeout),
                })
            }
        }
    }
}

/// Run one command over an already-open monitor stream.
///
/// Waits for the prompt, sends `command`, and returns everything printed
/// before the next prompt, trimmed. Each prompt wait has its own `timeout`.
pub async fn exchange<R, W>(
    vmid: &VmId,
    reader: &mut R,
    writer: &mut W,
    command: MonitorCommand,
    timeout: Duration,
) -> Result<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pending = Vec::new();
    read_until_prompt(vmid, reader, &mut pending, timeout, "pre-command").await?;

    let line = format!("{}\n", command.as_str());
    let io_err = |e| PvemonError::SessionIo { vmid: vmid.to_string(), source: e };
    writer.write_all(line.as_bytes()).await.map_err(io_err)?;
    writer.flush().await.map_err(io_err)?;

    let output = read_until_prompt(vmid, reader, &mut pending, timeout, "post-command").await?;
    Ok(strip_echo(&output, command).trim().to_string())
}

async fn read_until_prompt<R>(
    vmid: &VmId,
    reader: &mut R,
    pending: &mut Vec<u8>,
    timeout: Duration,
    phase: &'static str,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let wait = async {
        loop {
            if let Some(pos) = find_prompt(pending) {
                let before = String::from_utf8_lossy(&pending[..pos]).into_owned();
                pending.drain(..pos + PROMPT.len());
                return Ok(before);
            }
            let mut chunk = [0u8; 4096];
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| PvemonError::SessionIo { vmid: vmid.to_string(), source: e })?;
            if n == 0 {
                return Err(PvemonError::SessionClosed { vmid: vmid.to_string() });
            }
            pending.extend_from_slice(&chunk[..n]);
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => {
            metrics::counter!(counter_name(MONITOR_FAILURES_TOTAL), "reason" => "timeout").increment(1);
            Err(PvemonError::SessionTimeout { vmid: vmid.to_string(), phase, timeout })
        }
    }
}

fn find_prompt(buf: &[u8]) -> Option<usize> {
    buf.windows(PROMPT.len()).position(|w| w == PROMPT.as_bytes())
}

/// Drop the command line if the terminal echoed it back.
fn strip_echo(output: &str, command: MonitorCommand) -> &str {
    let trimmed = output.trim_start();
    match trimmed.split_once('\n') {
        Some((first, rest)) if first.trim() == command.as_str() => rest,
        None if trimmed.trim() == command.as_str() => "",
        _ => output,
    }
}
