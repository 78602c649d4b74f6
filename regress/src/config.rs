//! Settings of a regression run, read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use relay_harness::{HarnessError, Result};

/// Path of the relay binary under test.
pub const RELAY_BIN: &str = "RELAY_BIN";
/// Integer multiplier applied to every pacing sleep.
pub const RELAY_SLEEP_SCALE: &str = "RELAY_SLEEP_SCALE";
/// Seconds a process gets to exit when a scenario waits for it.
pub const RELAY_WAIT_TIMEOUT_SECS: &str = "RELAY_WAIT_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegressConfig {
    pub relay_bin: PathBuf,
    pub sleep_scale: u32,
    pub wait_timeout: Duration,
    /// Extra environment for every relay process.
    pub relay_env: Vec<(String, String)>,
}

impl RegressConfig {
    pub fn new(relay_bin: impl Into<PathBuf>) -> Self {
        Self {
            relay_bin: relay_bin.into(),
            sleep_scale: 1,
            wait_timeout: Duration::from_secs(10),
            relay_env: Vec::new(),
        }
    }

    pub fn with_relay_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.relay_env.push((key.into(), value.into()));
        self
    }

    /// Read the configuration from the process environment.
    ///
    /// `Ok(None)` when no relay binary is configured.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RegressConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(bin) = lookup(RELAY_BIN).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let mut config = Self::new(bin);

        if let Some(raw) = lookup(RELAY_SLEEP_SCALE) {
            config.sleep_scale = parse_positive(RELAY_SLEEP_SCALE, &raw)?;
        }
        if let Some(raw) = lookup(RELAY_WAIT_TIMEOUT_SECS) {
            config.wait_timeout =
                Duration::from_secs(parse_positive(RELAY_WAIT_TIMEOUT_SECS, &raw)?.into());
        }
        Ok(Some(config))
    }

    /// `base` stretched by the sleep scale.
    pub fn scaled(&self, base: Duration) -> Duration {
        base * self.sleep_scale
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u32> {
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(HarnessError::Configuration(format!(
            "{} must be a positive integer, got {:?}",
            key, raw
        ))),
    }
}
