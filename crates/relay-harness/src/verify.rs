//! Reconciliation of what one side sent against what the other received.

use std::fmt;

use crate::endpoint::Endpoint;
use crate::ledger::ByteLedger;

/// Classification of a transfer, from most to least benign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Received bytes equal sent bytes.
    Exact { bytes: usize },
    /// More bytes arrived than were ever sent (duplication).
    UnexpectedExtra { excess: usize },
    /// Received bytes are a strict prefix of the sent bytes; the tail is
    /// lost or still in flight.
    Truncated { transferred: usize, lost: usize },
    /// Content diverged at `offset`.
    Mismatch { offset: usize },
}

impl Verdict {
    pub fn is_exact(self) -> bool {
        matches!(self, Verdict::Exact { .. })
    }

    /// Exact or Truncated: every received byte is the right one.
    pub fn is_prefix(self) -> bool {
        matches!(self, Verdict::Exact { .. } | Verdict::Truncated { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Exact { bytes } => write!(f, "{} bytes transferred correctly.", bytes),
            Verdict::UnexpectedExtra { excess } => {
                write!(f, "{} bytes were unexpectedly received!!", excess)
            }
            Verdict::Truncated { transferred, lost } => write!(
                f,
                "{} bytes transferred correctly.\nsubsequent {} bytes were sent but not received (lost).",
                transferred, lost
            ),
            Verdict::Mismatch { offset } => write!(f, "mismatch!! (first difference at byte {})", offset),
        }
    }
}

/// Classify `received` against `sent`.
pub fn verify_bytes(sent: &[u8], received: &[u8]) -> Verdict {
    if sent == received {
        return Verdict::Exact { bytes: sent.len() };
    }
    if received.len() > sent.len() {
        return Verdict::UnexpectedExtra {
            excess: received.len() - sent.len(),
        };
    }

    let offset = sent
        .iter()
        .zip(received)
        .position(|(s, r)| s != r)
        .unwrap_or(received.len());

    if offset == received.len() {
        Verdict::Truncated {
            transferred: received.len(),
            lost: sent.len() - received.len(),
        }
    } else {
        Verdict::Mismatch { offset }
    }
}

/// Classify a receiver's ledger against a sender's ledger.
pub fn verify(sent: &ByteLedger, received: &ByteLedger) -> Verdict {
    verify_bytes(&sent.concat(), &received.concat())
}

/// Verify the transfer from `src` to `dst` and log the verdict.
pub fn check_transfer(src: &Endpoint, dst: &Endpoint) -> Verdict {
    let verdict = verify(src.sent(), dst.received());
    if verdict.is_exact() {
        tracing::info!(%verdict, "transfer verified");
    } else {
        tracing::warn!(%verdict, "transfer diverged");
    }
    verdict
}
