//! Incremental, non-blocking draining of a process's standard output.
//!
//! The relay under test prints what it forwards as it forwards it. The test
//! driver cannot block on that stream (the relay may have nothing more to say
//! right now), so each read is bounded by a short wait and an idle budget
//! decides when to give up for now. Calling [`drain`] again later picks up
//! whatever was printed in between.

use std::io::ErrorKind;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::error::{HarnessError, Result};
use crate::process::ProcessRecord;

/// Tuning of one [`drain`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainConfig {
    /// Maximum bytes per read.
    pub chunk_size: usize,
    /// Empty reads tolerated before returning.
    pub max_idle_attempts: u32,
    /// How long one read may wait for data.
    pub idle_wait: Duration,
    /// Idle budget re-armed after a successful read: more output is likely
    /// on its way.
    pub retries_after_data: u32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            max_idle_attempts: 5,
            idle_wait: Duration::from_millis(10),
            retries_after_data: 3,
        }
    }
}

impl DrainConfig {
    pub fn new(chunk_size: usize, max_idle_attempts: u32) -> Self {
        Self {
            chunk_size,
            max_idle_attempts,
            ..Self::default()
        }
    }
}

/// Append whatever `process` printed since the last call to its script.
///
/// Returns the number of bytes appended. Never blocks for longer than the
/// idle budget allows once the stream goes quiet; an exhausted (EOF) stream
/// behaves like a quiet one.
pub async fn drain(process: &mut ProcessRecord, config: &DrainConfig) -> Result<usize> {
    let name = process.name().to_string();
    let Some((stdout, script)) = process.output() else {
        return Err(HarnessError::NoOutputStream { process: name });
    };

    let mut buf = vec![0u8; config.chunk_size.max(1)];
    let mut appended = 0;
    let mut retries = config.max_idle_attempts;

    while retries > 0 {
        match tokio::time::timeout(config.idle_wait, stdout.read(&mut buf)).await {
            Ok(Ok(0)) => {
                // EOF returns immediately; pace it like a quiet stream.
                retries -= 1;
                tokio::time::sleep(config.idle_wait).await;
            }
            Ok(Ok(n)) => {
                script.push(Bytes::copy_from_slice(&buf[..n]));
                appended += n;
                retries = config.retries_after_data.max(1);
            }
            Ok(Err(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                retries -= 1;
                tokio::time::sleep(config.idle_wait).await;
            }
            Ok(Err(e)) => {
                // What was read so far is already in the script.
                tracing::debug!(%name, appended, error = %e, "drain failed");
                return Err(e.into());
            }
            Err(_elapsed) => retries -= 1,
        }
    }

    if appended > 0 {
        tracing::trace!(%name, appended, "drained output");
    }
    Ok(appended)
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use tokio::process::Command;

    use super::*;

    fn quick() -> DrainConfig {
        DrainConfig {
            chunk_size: 4,
            max_idle_attempts: 3,
            idle_wait: Duration::from_millis(10),
            retries_after_data: 2,
        }
    }

    #[tokio::test]
    async fn drain_collects_output_in_small_chunks() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'A -> B sent 4 bytes\\n'; sleep 5"]);
        let mut proc = ProcessRecord::spawn("printer", &mut cmd).unwrap();

        let mut total = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while total < 20 && Instant::now() < deadline {
            total += drain(&mut proc, &quick()).await.unwrap();
        }

        assert_eq!(proc.script_text(), "A -> B sent 4 bytes\n");
        assert!(proc.script().len() >= 5, "chunk size caps each fragment");
    }

    #[tokio::test]
    async fn drain_without_new_output_changes_nothing() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf hi; sleep 5"]);
        let mut proc = ProcessRecord::spawn("quiet", &mut cmd).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while proc.script_text() != "hi" && Instant::now() < deadline {
            drain(&mut proc, &quick()).await.unwrap();
        }
        let fragments = proc.script().len();

        let started = Instant::now();
        assert_eq!(drain(&mut proc, &quick()).await.unwrap(), 0);
        assert_eq!(drain(&mut proc, &quick()).await.unwrap(), 0);
        assert_eq!(proc.script().len(), fragments);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn interrupted_drain_keeps_what_it_read() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "while true; do printf x; sleep 0.002; done"]);
        let mut proc = ProcessRecord::spawn("chatty", &mut cmd).unwrap();
        let config = DrainConfig {
            idle_wait: Duration::from_millis(100),
            ..quick()
        };

        // A stream that never goes quiet keeps drain busy until it is cut off.
        let cut = tokio::time::timeout(Duration::from_millis(300), drain(&mut proc, &config)).await;
        assert!(cut.is_err());

        let script = proc.script_text();
        assert!(!script.is_empty(), "bytes read before the cut were dropped");
        assert!(script.bytes().all(|b| b == b'x'));
    }

    #[tokio::test]
    async fn drain_after_eof_is_bounded() {
        let mut cmd = Command::new("true");
        let mut proc = ProcessRecord::spawn("true", &mut cmd).unwrap();

        let started = Instant::now();
        assert_eq!(drain(&mut proc, &quick()).await.unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(proc.script().is_empty());
    }

    #[tokio::test]
    async fn drain_needs_a_piped_stdout() {
        let child = Command::new("true").spawn().unwrap();
        let mut proc = ProcessRecord::new("unpiped", child);

        assert!(matches!(
            drain(&mut proc, &quick()).await,
            Err(HarnessError::NoOutputStream { .. })
        ));
    }
}
