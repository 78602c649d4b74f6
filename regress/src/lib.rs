//! Regression scenarios for a TCP relay.
//!
//! Each scenario puts the relay between two loopback endpoints, pushes
//! traffic through it and reconciles three points of view: the source, the
//! destination and the relay's own intercepted log. Scenarios are plain
//! async functions over a [`Scenario`] context and a [`ProcessLedger`]; the
//! `regress` test target turns each of them into a trial against a real
//! relay, and `stub_relay` runs them against the `stub-relay` binary.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use relay_harness::report::Narrator;
use relay_harness::{
    Consumed, DrainConfig, Endpoint, HarnessError, ProcessLedger, ProcessRecord, ProxyCommand,
    Result, Shutdown, Verdict, drain, intercept, ports, verify,
};

pub mod config;
pub mod scenarios;

pub use config::RegressConfig;

/// Pause between steps that only need the other side to get scheduled.
pub const SETTLE: Duration = Duration::from_millis(1);

/// Attempts at connecting to the relay's listening side.
const CONNECT_ATTEMPTS: u32 = 50;

/// Attempts at finding a free port for the destination.
const BIND_ATTEMPTS: usize = 16;

/// What a verdict has to be for a check to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Exact,
    /// Exact or truncated; the tail may have been lost on teardown.
    Prefix,
}

impl Expect {
    pub fn accepts(self, verdict: Verdict) -> bool {
        match self {
            Expect::Exact => verdict.is_exact(),
            Expect::Prefix => verdict.is_prefix(),
        }
    }
}

/// Send `payload` from one endpoint, consume it on the other, then look at
/// what the relay printed about it.
pub async fn send(
    from: &mut Endpoint,
    to: &mut Endpoint,
    relay: &mut ProcessRecord,
    drain_config: &DrainConfig,
    payload: impl Into<Bytes>,
) -> Result<Consumed> {
    let payload = payload.into();
    let len = payload.len();
    from.send(payload).await?;
    let consumed = to.consume(len).await?;
    drain(relay, drain_config).await?;
    Ok(consumed)
}

/// Two endpoints bridged by a running relay.
#[derive(Debug)]
pub struct Bridge {
    /// Source side, connected to the relay.
    pub a: Endpoint,
    /// Destination side, accepted from the relay.
    pub b: Endpoint,
    pub relay: relay_harness::ProcessId,
    /// Where the relay writes its dump files, if it was asked to.
    pub relay_cmd: ProxyCommand,
}

/// State of one scenario run: pacing, narrative and collected failures.
#[derive(Debug)]
pub struct Scenario {
    config: RegressConfig,
    narrator: Narrator,
    drain: DrainConfig,
    failures: Vec<String>,
    dumps: String,
}

impl Scenario {
    pub fn new(config: RegressConfig) -> Self {
        Self {
            config,
            narrator: Narrator::new(),
            drain: DrainConfig::default(),
            failures: Vec::new(),
            dumps: String::new(),
        }
    }

    pub fn config(&self) -> &RegressConfig {
        &self.config
    }

    pub fn drain_config(&self) -> &DrainConfig {
        &self.drain
    }

    pub fn narrator(&self) -> &Narrator {
        &self.narrator
    }

    pub fn say(&self, text: &str) {
        self.narrator.harn(text);
    }

    /// Sleep for `base`, stretched by the configured scale.
    pub async fn pause(&self, base: Duration) {
        tokio::time::sleep(self.config.scaled(base)).await;
    }

    /// Relay command line bridging the two ports.
    pub fn relay(&self, a_port: u16, b_port: u16) -> ProxyCommand {
        self.config.relay_env.iter().fold(
            ProxyCommand::new(&self.config.relay_bin, a_port, b_port),
            |cmd, (key, value)| cmd.env(key, value),
        )
    }

    /// Drain whatever the relay printed since the last look.
    pub async fn observe(&self, relay: &mut ProcessRecord) -> Result<usize> {
        drain(relay, &self.drain).await
    }

    /// Start the relay between a fresh destination and a fresh source.
    ///
    /// The destination listens first since the relay connects to it before
    /// it accepts the source.
    pub async fn bridge(
        &self,
        ledger: &mut ProcessLedger,
        rcv_buf: usize,
        customize: impl FnOnce(ProxyCommand) -> ProxyCommand,
    ) -> Result<Bridge> {
        let (b_port, mut b) = ports::bind_retry(BIND_ATTEMPTS, |port| {
            Endpoint::new(relay_harness::Mode::Listen(port), rcv_buf)
        })
        .await?;
        let a_port = ports::distinct_from(b_port);
        self.pause(SETTLE).await;

        let relay_cmd = customize(self.relay(a_port, b_port));
        let relay = ledger.track(relay_cmd.spawn()?);
        self.say(&format!("relay bridging A:{} to B:{}", a_port, b_port));

        // The relay's stdout is block buffered until it forwards something,
        // so its progress lines cannot tell when it listens. Retry instead.
        let a = self.connect_retry(a_port, rcv_buf).await?;
        self.pause(SETTLE).await;
        b.accept().await?;
        self.observe(&mut ledger[relay]).await?;

        Ok(Bridge {
            a,
            b,
            relay,
            relay_cmd,
        })
    }

    async fn connect_retry(&self, port: u16, rcv_buf: usize) -> Result<Endpoint> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Endpoint::new(relay_harness::Mode::Connect(port), rcv_buf).await {
                Err(HarnessError::Io(e))
                    if e.kind() == std::io::ErrorKind::ConnectionRefused
                        && attempt < CONNECT_ATTEMPTS =>
                {
                    tracing::debug!(port, attempt, "relay not accepting yet");
                    self.pause(Duration::from_millis(20)).await;
                }
                other => return other,
            }
        }
    }

    /// Run endpoint I/O, failing with [`HarnessError::Stalled`] once the
    /// wait timeout passes without it completing.
    pub async fn within<T>(&self, what: &str, io: impl Future<Output = Result<T>>) -> Result<T> {
        let window = self.config.wait_timeout;
        match tokio::time::timeout(window, io).await {
            Ok(done) => done,
            Err(_elapsed) => Err(HarnessError::Stalled {
                what: what.to_string(),
                after: window,
            }),
        }
    }

    /// Read `endpoint` until the relay passes its peer's close on.
    ///
    /// Returns the bytes that arrived on the way; they are in the received
    /// ledger, so anything the relay delivered twice fails the verdict.
    pub async fn read_to_end(&self, name: &str, endpoint: &mut Endpoint) -> Result<usize> {
        let late = self
            .within(&format!("reading {} to the end", name), endpoint.consume_to_end())
            .await?;
        if late > 0 {
            self.say(&format!("{} received {} more bytes before the close", name, late));
        }
        Ok(late)
    }

    /// End an exchange: half-close both writers, read both sides to the end,
    /// then close the read sides too.
    pub async fn close_exchange(&self, bridge: &mut Bridge) -> Result<()> {
        bridge.a.shutdown(Shutdown::Write)?;
        bridge.b.shutdown(Shutdown::Write)?;
        for (name, endpoint) in [("B", &mut bridge.b), ("A", &mut bridge.a)] {
            self.read_to_end(name, endpoint).await?;
            endpoint.shutdown(Shutdown::Read)?;
        }
        Ok(())
    }

    /// Record a verdict; it fails the scenario unless `expect` accepts it.
    pub fn check(&mut self, label: &str, verdict: Verdict, expect: Expect) {
        self.narrator.verdict(label, &verdict);
        if !expect.accepts(verdict) {
            self.failures.push(relay_harness::report::verdict_line(label, &verdict));
        }
    }

    /// Fail the scenario with `what` unless `ok`.
    pub fn require(&mut self, ok: bool, what: impl Into<String>) {
        if !ok {
            let what = what.into();
            self.narrator.harn(&format!("requirement failed: {}", what));
            self.failures.push(what);
        }
    }

    /// Print an endpoint's ledgers and keep them for the failure report.
    pub fn dump_endpoint(&mut self, name: &str, endpoint: &Endpoint) {
        let dump = relay_harness::report::dump_endpoint(name, endpoint);
        self.narrator.harn(&dump);
        self.dumps.push_str(&dump);
    }

    /// Print the relay's output and keep it for the failure report.
    pub fn dump_relay(&mut self, relay: &ProcessRecord) {
        self.narrator.dump_process(relay);
        self.dumps.push_str(&format!("{} output:\n", relay.name()));
        self.dumps
            .push_str(&intercept::strip_ansi(&relay.script_text()));
    }

    /// Check what the relay claims it forwarded from `src` to `dst`.
    ///
    /// The relay's log sits between the two endpoints, so it is verified
    /// against the sender's ledger and then the receiver's against it.
    pub fn check_relay_log(
        &mut self,
        relay: &ProcessRecord,
        (from, src): (&str, &Endpoint),
        (to, dst): (&str, &Endpoint),
        expect: Expect,
    ) {
        let log = intercept::parse(&relay.script_text());
        let forwarded = log
            .direction(from, to)
            .map(|d| d.ledger())
            .unwrap_or_default();

        self.check(
            &format!("{} -> relay", from),
            verify(src.sent(), &forwarded),
            expect,
        );
        self.check(
            &format!("relay -> {}", to),
            verify(&forwarded, dst.received()),
            expect,
        );
        if let Some(direction) = log.direction(from, to) {
            self.require(
                direction.offset_gaps == 0,
                format!("{} -> {} dump offsets are not contiguous", from, to),
            );
        }
    }

    /// Wait for the relay to exit and record its return code.
    pub async fn wait_relay(&mut self, ledger: &mut ProcessLedger, bridge: &Bridge) -> Result<()> {
        let status = ledger.wait(bridge.relay, self.config.wait_timeout).await?;
        self.observe(&mut ledger[bridge.relay]).await?;
        self.say(&format!("relay's return code: {:?}", status.code()));
        Ok(())
    }

    /// Turn the collected failures into a trial outcome.
    pub fn finish(self) -> std::result::Result<(), String> {
        if self.failures.is_empty() {
            return Ok(());
        }
        Err(format!(
            "{}\n\nVantage points:\n{}",
            self.failures.join("\n"),
            self.dumps
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_accepts_truncation_but_not_corruption() {
        let truncated = Verdict::Truncated {
            transferred: 1,
            lost: 1,
        };
        assert!(Expect::Prefix.accepts(truncated));
        assert!(!Expect::Exact.accepts(truncated));
        assert!(!Expect::Prefix.accepts(Verdict::Mismatch { offset: 0 }));
        assert!(!Expect::Prefix.accepts(Verdict::UnexpectedExtra { excess: 1 }));
    }

    #[test]
    fn failures_carry_the_diagnostic() {
        let mut scenario = Scenario::new(RegressConfig::new("relay"));
        scenario.check("A -> B", Verdict::Exact { bytes: 3 }, Expect::Exact);
        assert_eq!(scenario.failures.len(), 0);

        scenario.check("B -> A", Verdict::UnexpectedExtra { excess: 2 }, Expect::Exact);
        scenario.require(false, "relay exit code recorded");
        let err = scenario.finish().unwrap_err();
        assert!(err.starts_with(
            "B -> A: 2 bytes were unexpectedly received!!\nrelay exit code recorded"
        ));
    }
}
