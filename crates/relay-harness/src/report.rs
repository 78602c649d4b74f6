//! Printed narrative of a scenario: vantage-point dumps and verdicts.
//!
//! Everything goes to stderr with an uptime prefix and a colored source tag,
//! so the harness's own lines can be told apart from the relay's.

use std::fmt::Write as _;
use std::time::Instant;

use owo_colors::OwoColorize;

use crate::endpoint::Endpoint;
use crate::hexdump::rows;
use crate::intercept::strip_ansi;
use crate::process::ProcessRecord;
use crate::verify::Verdict;

/// Who a narrative line comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Harness,
    Relay,
}

impl Source {
    fn tag(self) -> String {
        match self {
            Source::Harness => format!("{}", "[harn]".cyan()),
            Source::Relay => format!("{}", "[relay]".magenta()),
        }
    }
}

/// Uptime-prefixed printer for one scenario.
#[derive(Debug, Clone, Copy)]
pub struct Narrator {
    start: Instant,
}

impl Default for Narrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Narrator {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time, e.g. `" 0.00123s"`.
    pub fn uptime(&self) -> String {
        format!("{:>8.5}s", self.start.elapsed().as_secs_f64())
    }

    /// Print `text` line by line, each tagged with `source`.
    pub fn say(&self, source: Source, text: &str) {
        let uptime = self.uptime();
        let tag = source.tag();
        for line in text.lines() {
            eprintln!("{} {} {}", uptime, tag, line);
        }
    }

    pub fn harn(&self, text: &str) {
        self.say(Source::Harness, text);
    }

    /// Print what the relay said so far.
    pub fn dump_process(&self, process: &ProcessRecord) {
        self.harn(&format!("{} output:", process.name()));
        self.say(Source::Relay, &process.script_text());
    }

    /// Print the verdict of one direction, red unless it is exact.
    pub fn verdict(&self, label: &str, verdict: &Verdict) {
        let line = verdict_line(label, verdict);
        if verdict.is_exact() {
            self.harn(&format!("{}", line.green()));
        } else {
            self.harn(&format!("{}", line.red().bold()));
        }
    }
}

/// Sent and received ledgers of `endpoint` as hex dumps.
pub fn dump_endpoint(name: &str, endpoint: &Endpoint) -> String {
    let mut out = String::new();
    let sent = endpoint.sent().concat();
    let received = endpoint.received().concat();

    let _ = writeln!(out, "{} sent {} bytes:", name, sent.len());
    out.push_str(&rows(0, &sent));
    let _ = writeln!(out, "{} received {} bytes:", name, received.len());
    out.push_str(&rows(0, &received));
    out
}

/// Keep only the relay lines that talk about the two peers, then forget the
/// script so the next call starts fresh.
pub fn slow_receiver_lines(relay: &mut ProcessRecord) -> Vec<String> {
    let lines = strip_ansi(&relay.script_text())
        .lines()
        .filter(|line| line.contains("A ") || line.contains("B "))
        .map(str::to_string)
        .collect();
    relay.clear_script();
    lines
}

/// One diagnostic line for a verdict, prefixed with `label`.
pub fn verdict_line(label: &str, verdict: &Verdict) -> String {
    let text = verdict.to_string();
    let mut out = String::new();
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{}: {}", label, line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_lines_carry_the_label_on_every_line() {
        let line = verdict_line(
            "A -> B",
            &Verdict::Truncated {
                transferred: 5,
                lost: 1,
            },
        );
        assert_eq!(
            line,
            "A -> B: 5 bytes transferred correctly.\n\
             A -> B: subsequent 1 bytes were sent but not received (lost)."
        );
    }

    #[test]
    fn uptime_is_fixed_width() {
        let narrator = Narrator::new();
        assert!(narrator.uptime().ends_with('s'));
        assert_eq!(narrator.uptime().len(), 9);
    }
}
