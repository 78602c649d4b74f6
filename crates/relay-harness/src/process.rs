//! Tracking of external processes spawned by a test.
//!
//! Each test owns one [`ProcessLedger`]. Every process it starts is
//! registered there and is guaranteed a termination attempt at teardown:
//! SIGTERM, a short grace period, SIGKILL, then a blocking reap.
//!
//! Use [`ProcessLedger::scoped`] to run a test body so that teardown happens
//! on every exit path, panics included:
//!
//! ```no_run
//! # use relay_harness::process::{ProcessLedger, ProcessRecord};
//! # async fn demo() -> relay_harness::Result<()> {
//! ProcessLedger::scoped(async |ledger| -> relay_harness::Result<()> {
//!     let mut cmd = tokio::process::Command::new("cat");
//!     let cat = ledger.track(ProcessRecord::spawn("cat", &mut cmd)?);
//!     assert!(ledger[cat].exit_code().is_none());
//!     Ok(())
//! })
//! .await
//! # }
//! ```

use std::ops::{Index, IndexMut};
use std::panic::AssertUnwindSafe;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::error::{HarnessError, Result};

/// Time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(100);

/// Process-specific facts learnt while it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessMeta {
    /// Internal buffer sizes (A->B, B->A) as reported by a relay.
    pub buf_sizes: Option<(usize, usize)>,
    /// Socket buffer sizes (SND, RCV) requested from a relay.
    pub skt_buf_sizes: Option<(usize, usize)>,
    /// Receive buffer negotiated by an endpoint process.
    pub rcv_buf: Option<usize>,
}

/// One spawned process and everything observed from its output.
pub struct ProcessRecord {
    name: String,
    child: Child,
    stdout: Option<ChildStdout>,
    script: Vec<Bytes>,
    meta: ProcessMeta,
    exit: Option<ExitStatus>,
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .field("fragments", &self.script.len())
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl ProcessRecord {
    /// Wrap an already spawned child. Its stdout, if piped, becomes the
    /// stream the partial reader drains.
    pub fn new(name: impl Into<String>, mut child: Child) -> Self {
        let stdout = child.stdout.take();
        Self {
            name: name.into(),
            child,
            stdout,
            script: Vec::new(),
            meta: ProcessMeta::default(),
            exit: None,
        }
    }

    /// Spawn `cmd` with stdout piped, stdin closed and kill-on-drop set.
    pub fn spawn(name: impl Into<String>, cmd: &mut Command) -> Result<Self> {
        let name = name.into();
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(%name, pid = ?child.id(), "spawned process");
        Ok(Self::new(name, child))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, `None` once the process was reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Output fragments in the order they were read.
    pub fn script(&self) -> &[Bytes] {
        &self.script
    }

    /// The script joined into one byte sequence.
    pub fn script_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        for fragment in &self.script {
            out.extend_from_slice(fragment);
        }
        out.freeze()
    }

    /// The script as text, lossily decoded.
    pub fn script_text(&self) -> String {
        String::from_utf8_lossy(&self.script_bytes()).into_owned()
    }

    /// Forget everything observed so far (used after a dump).
    pub fn clear_script(&mut self) {
        self.script.clear();
    }

    pub fn meta(&self) -> &ProcessMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut ProcessMeta {
        &mut self.meta
    }

    /// Exit status, once the process was waited on.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Exit code, once the process was waited on and exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|status| status.code())
    }

    /// The piped stdout together with the script it feeds, borrowed apart so
    /// each chunk can be recorded as soon as it is read.
    pub(crate) fn output(&mut self) -> Option<(&mut ChildStdout, &mut Vec<Bytes>)> {
        let stdout = self.stdout.as_mut()?;
        Some((stdout, &mut self.script))
    }

    /// Wait for the process to exit, failing after `timeout`.
    ///
    /// A process that hangs is a defect of the thing under test; the caller
    /// is expected to fail the test, not retry.
    pub async fn wait(&mut self, timeout: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = tokio::time::timeout(timeout, self.child.wait())
            .await
            .map_err(|_| HarnessError::Timeout {
                process: self.name.clone(),
                after: timeout,
            })??;
        tracing::debug!(name = %self.name, code = ?status.code(), "process exited");
        self.exit = Some(status);
        Ok(status)
    }

    /// Ask the process to terminate gracefully.
    fn terminate(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: plain kill(2); the pid belongs to our unreaped child.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    /// Best-effort terminate/kill/reap. Never fails.
    async fn reap(&mut self, grace: Duration) {
        if self.exit.is_some() {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit = Some(status);
            return;
        }

        if let Err(e) = self.terminate() {
            tracing::debug!(name = %self.name, error = %e, "terminate failed");
        }
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            tracing::debug!(name = %self.name, code = ?status.code(), "terminated");
            self.exit = Some(status);
            return;
        }

        if let Err(e) = self.child.start_kill() {
            tracing::debug!(name = %self.name, error = %e, "kill failed");
        }
        match self.child.wait().await {
            Ok(status) => {
                tracing::debug!(name = %self.name, "killed");
                self.exit = Some(status);
            }
            Err(e) => tracing::debug!(name = %self.name, error = %e, "reap failed"),
        }
    }
}

/// Handle to a process registered in a [`ProcessLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(usize);

/// Every process spawned by one test invocation.
pub struct ProcessLedger {
    records: Vec<ProcessRecord>,
    grace: Duration,
}

impl Default for ProcessLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLedger {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            records: Vec::new(),
            grace,
        }
    }

    /// Run `body` with a fresh ledger and tear it down afterwards.
    ///
    /// Teardown runs whether the body returns normally, returns early with an
    /// error, or panics; a panic is resumed once every process is reaped.
    pub async fn scoped<F, T>(body: F) -> T
    where
        F: AsyncFnOnce(&mut ProcessLedger) -> T,
    {
        let mut ledger = ProcessLedger::new();
        let outcome = AssertUnwindSafe(body(&mut ledger)).catch_unwind().await;
        ledger.teardown().await;
        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Register a process. The returned id addresses it in this ledger.
    pub fn track(&mut self, record: ProcessRecord) -> ProcessId {
        tracing::debug!(name = %record.name, pid = ?record.pid(), "tracking process");
        self.records.push(record);
        ProcessId(self.records.len() - 1)
    }

    pub fn get(&self, id: ProcessId) -> Option<&ProcessRecord> {
        self.records.get(id.0)
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut ProcessRecord> {
        self.records.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.iter()
    }

    /// Wait for one tracked process, see [`ProcessRecord::wait`].
    pub async fn wait(&mut self, id: ProcessId, timeout: Duration) -> Result<ExitStatus> {
        self[id].wait(timeout).await
    }

    /// Terminate, kill and reap every tracked process that is still running.
    ///
    /// Failures are logged and swallowed: cleanup never fails a test.
    pub async fn teardown(&mut self) {
        let grace = self.grace;
        for record in &mut self.records {
            record.reap(grace).await;
        }
        tracing::debug!(processes = self.records.len(), "teardown complete");
    }
}

impl Index<ProcessId> for ProcessLedger {
    type Output = ProcessRecord;

    fn index(&self, id: ProcessId) -> &ProcessRecord {
        &self.records[id.0]
    }
}

impl IndexMut<ProcessId> for ProcessLedger {
    fn index_mut(&mut self, id: ProcessId) -> &mut ProcessRecord {
        &mut self.records[id.0]
    }
}

impl Drop for ProcessLedger {
    fn drop(&mut self) {
        for record in &mut self.records {
            if record.exit.is_none() && record.child.id().is_some() {
                tracing::warn!(name = %record.name, "ledger dropped without teardown, killing");
                let _ = record.child.start_kill();
            }
        }
    }
}
