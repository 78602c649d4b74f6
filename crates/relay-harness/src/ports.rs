//! Loopback port numbers for a test run.
//!
//! Ports are drawn at random from a fixed range with no reservation: another
//! process may hold one of them. Callers that bind a port themselves can
//! redraw on `AddrInUse` (see [`bind_retry`]); the port handed to the relay
//! cannot be checked that way.
//!
//! The source and destination ports are drawn independently of each other,
//! except that a draw equal to the other side's port is redrawn. The relay
//! must never be asked to listen on the port it connects to.

use std::future::Future;
use std::ops::RangeInclusive;

use rand::Rng;

use crate::error::{HarnessError, Result};

/// Range the ports are drawn from.
pub const PORT_RANGE: RangeInclusive<u16> = 1000..=32000;

/// Two random ports, for the source and destination sides.
///
/// Each is uniform over [`PORT_RANGE`]; the second is redrawn while it
/// equals the first.
pub fn pair() -> (u16, u16) {
    pair_with(&mut rand::rng())
}

pub fn pair_with<R: Rng + ?Sized>(rng: &mut R) -> (u16, u16) {
    let a = rng.random_range(PORT_RANGE);
    loop {
        let b = rng.random_range(PORT_RANGE);
        if b != a {
            return (a, b);
        }
    }
}

/// A random port other than `taken`.
pub fn distinct_from(taken: u16) -> u16 {
    let mut rng = rand::rng();
    loop {
        let port = rng.random_range(PORT_RANGE);
        if port != taken {
            return port;
        }
    }
}

/// Run `bind` with fresh ports until it stops failing with a bind error.
///
/// Only `AddrInUse` and `PermissionDenied` (ports below 1024 for an
/// unprivileged user) trigger a redraw; anything else is returned as is.
pub async fn bind_retry<T, F, Fut>(attempts: usize, mut bind: F) -> Result<(u16, T)>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for _ in 0..attempts.max(1) {
        let port = rand::rng().random_range(PORT_RANGE);
        match bind(port).await {
            Ok(bound) => return Ok((port, bound)),
            Err(HarnessError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::debug!(port, error = %e, "port unavailable, drawing another");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(match last {
        Some(e) => HarnessError::Io(e),
        None => HarnessError::Configuration("no port attempts were made".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn pairs_are_distinct_and_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let (a, b) = pair_with(&mut rng);
            assert_ne!(a, b);
            assert!(PORT_RANGE.contains(&a));
            assert!(PORT_RANGE.contains(&b));
        }
    }

    #[test]
    fn distinct_from_never_returns_the_taken_port() {
        for _ in 0..1000 {
            assert_ne!(distinct_from(1000), 1000);
        }
    }

    #[tokio::test]
    async fn bind_retry_redraws_on_addr_in_use() {
        let mut calls = 0;
        let (port, value) = bind_retry(5, |port| {
            calls += 1;
            let fail = calls < 3;
            async move {
                if fail {
                    Err(HarnessError::from(std::io::Error::from(
                        std::io::ErrorKind::AddrInUse,
                    )))
                } else {
                    Ok(port)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(port, value);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn bind_retry_gives_up_after_the_budget() {
        let result: Result<(u16, ())> = bind_retry(2, |_| async {
            Err(HarnessError::from(std::io::Error::from(
                std::io::ErrorKind::AddrInUse,
            )))
        })
        .await;
        assert!(matches!(result, Err(HarnessError::Io(_))));
    }

    #[tokio::test]
    async fn bind_retry_passes_other_errors_through() {
        let result: Result<(u16, ())> = bind_retry(5, |_| async {
            Err(HarnessError::Configuration("bad".to_string()))
        })
        .await;
        assert!(matches!(result, Err(HarnessError::Configuration(_))));
    }
}
