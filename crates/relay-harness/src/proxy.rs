//! Command line of the relay under test.
//!
//! The relay is opaque: it is told which two addresses to bridge and how to
//! size its buffers, and the harness only ever looks at its standard output
//! and exit code.
//!
//! ```text
//! relay -A <addr> -B <addr> [-b <a2b>:<b2a>] [-z <snd>:<rcv>] [-o] [-c]
//! ```

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use tokio::process::Command;

use crate::error::{HarnessError, Result};
use crate::intercept;
use crate::process::ProcessRecord;

/// Relay's internal buffer size when `-b` is not given.
pub const DEFAULT_BUF_SIZE: usize = 2048;

/// File the relay writes A->B traffic to in dump-to-file mode.
pub const A_TO_B_DUMP: &str = "AtoB.dump";
/// File the relay writes B->A traffic to in dump-to-file mode.
pub const B_TO_A_DUMP: &str = "BtoA.dump";

/// A pair of positive sizes, given as `n` (both) or `a:b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePair(pub usize, pub usize);

impl SizePair {
    pub fn new(first: usize, second: usize) -> Result<Self> {
        if first == 0 || second == 0 {
            return Err(HarnessError::Configuration(format!(
                "buffer sizes must be positive, got {}:{}",
                first, second
            )));
        }
        Ok(Self(first, second))
    }

    /// The same size for both.
    pub fn both(size: usize) -> Result<Self> {
        Self::new(size, size)
    }

    fn arg(self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

impl FromStr for SizePair {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let size = |raw: &str| {
            raw.trim().parse::<usize>().map_err(|_| {
                HarnessError::Configuration(format!("invalid size {:?} in {:?}", raw, s))
            })
        };
        match s.split_once(':') {
            Some((first, second)) => Self::new(size(first)?, size(second)?),
            None => Self::both(size(s)?),
        }
    }
}

/// Builder for one run of the relay.
#[derive(Debug, Clone)]
pub struct ProxyCommand {
    program: PathBuf,
    source_port: u16,
    destination_port: u16,
    buf_sizes: Option<SizePair>,
    skt_buf_sizes: Option<SizePair>,
    to_file: bool,
    colorless: bool,
    working_dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl ProxyCommand {
    /// Bridge `source_port` (the relay listens, A connects) to
    /// `destination_port` (B listens, the relay connects).
    pub fn new(program: impl AsRef<Path>, source_port: u16, destination_port: u16) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            source_port,
            destination_port,
            buf_sizes: None,
            skt_buf_sizes: None,
            to_file: false,
            colorless: false,
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Internal buffer sizes, A->B then B->A (`-b`).
    pub fn buf_sizes(mut self, sizes: SizePair) -> Self {
        self.buf_sizes = Some(sizes);
        self
    }

    /// Socket buffer sizes, SND then RCV (`-z`).
    pub fn skt_buf_sizes(mut self, sizes: SizePair) -> Self {
        self.skt_buf_sizes = Some(sizes);
        self
    }

    /// Also write the intercepted traffic to the dump files (`-o`).
    pub fn to_file(mut self, enabled: bool) -> Self {
        self.to_file = enabled;
        self
    }

    /// Ask the relay not to color its output (`-c`).
    pub fn colorless(mut self, enabled: bool) -> Self {
        self.colorless = enabled;
        self
    }

    /// Directory the relay runs in, where dump files land.
    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Extra environment variable for the relay process.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Arguments passed to the relay.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-A".into(),
            format!("127.0.0.1:{}", self.source_port).into(),
            "-B".into(),
            format!("127.0.0.1:{}", self.destination_port).into(),
        ];
        if let Some(sizes) = self.buf_sizes {
            args.push("-b".into());
            args.push(sizes.arg().into());
        }
        if let Some(sizes) = self.skt_buf_sizes {
            args.push("-z".into());
            args.push(sizes.arg().into());
        }
        if self.to_file {
            args.push("-o".into());
        }
        if self.colorless {
            args.push("-c".into());
        }
        args
    }

    /// Where the dump files of a `-o` run end up.
    pub fn dump_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.working_dir.clone().unwrap_or_default();
        (dir.join(A_TO_B_DUMP), dir.join(B_TO_A_DUMP))
    }

    /// Start the relay. Its stderr goes to ours, its stdout is drained.
    pub fn spawn(&self) -> Result<ProcessRecord> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tracing::info!(
            program = %self.program.display(),
            args = ?self.args(),
            "spawning relay"
        );
        let mut record = ProcessRecord::spawn("relay", &mut cmd)?;
        record.meta_mut().skt_buf_sizes = self.skt_buf_sizes.map(|s| (s.0, s.1));
        Ok(record)
    }
}

/// Fill in the relay's metadata from what it printed so far.
///
/// Returns the buffer sizes once the relay reported them.
pub fn learn_buf_sizes(relay: &mut ProcessRecord) -> Option<(usize, usize)> {
    if relay.meta().buf_sizes.is_none() {
        let sizes = intercept::parse(&relay.script_text()).buf_sizes;
        relay.meta_mut().buf_sizes = sizes;
    }
    relay.meta().buf_sizes
}
