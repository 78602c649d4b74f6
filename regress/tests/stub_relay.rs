//! The scenarios against the stand-in relay, faithful and misbehaving.
//!
//! A faithful stand-in must pass every scenario; the misbehaving ones must
//! fail with the verdict that names what they did to the stream.

use std::future::Future;
use std::pin::Pin;

use relay_harness::{ProcessLedger, SizePair};
use relay_regress::scenarios::{self, Closer};
use relay_regress::{RegressConfig, Scenario};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn stub(mode: &str) -> RegressConfig {
    RegressConfig::new(env!("CARGO_BIN_EXE_stub-relay")).with_relay_env("STUB_RELAY_MODE", mode)
}

type ScenarioFuture<'a> = Pin<Box<dyn Future<Output = relay_harness::Result<()>> + 'a>>;

fn run<F>(config: RegressConfig, body: F) -> Result<(), String>
where
    F: for<'a> FnOnce(&'a mut Scenario, &'a mut ProcessLedger) -> ScenarioFuture<'a>,
{
    init_tracing();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let mut scenario = Scenario::new(config);
        let outcome = ProcessLedger::scoped(async |ledger| -> relay_harness::Result<()> {
            body(&mut scenario, ledger).await
        })
        .await;

        if let Err(e) = outcome {
            return Err(format!("scenario aborted: {}", e));
        }
        scenario.finish()
    })
}

fn one_byte_buffer<'a>(s: &'a mut Scenario, l: &'a mut ProcessLedger) -> ScenarioFuture<'a> {
    Box::pin(async move { scenarios::buffer_full(s, l, SizePair::new(1, 2048)?).await })
}

fn slow_receiver<'a>(s: &'a mut Scenario, l: &'a mut ProcessLedger) -> ScenarioFuture<'a> {
    Box::pin(scenarios::slow_receiver(s, l, false))
}

#[test]
fn faithful_relay_passes_happy_path() {
    let outcome = run(stub("faithful"), |s, l| Box::pin(scenarios::happy_path(s, l)));
    assert_eq!(outcome, Ok(()));
}

#[test]
fn faithful_relay_passes_buffer_full() {
    assert_eq!(run(stub("faithful"), one_byte_buffer), Ok(()));
}

#[test]
fn faithful_relay_passes_slow_receiver() {
    assert_eq!(run(stub("faithful"), slow_receiver), Ok(()));
}

#[test]
fn faithful_relay_passes_half_close_from_either_side() {
    for closer in [Closer::Sender, Closer::Receiver] {
        let outcome = run(stub("faithful"), move |s, l| {
            Box::pin(scenarios::shutdown(s, l, closer))
        });
        assert_eq!(outcome, Ok(()), "{:?} closing", closer);
    }
}

#[test]
fn faithful_relay_passes_dump_to_file() {
    let outcome = run(stub("faithful"), |s, l| Box::pin(scenarios::dump_to_file(s, l)));
    assert_eq!(outcome, Ok(()));
}

#[test]
fn duplicated_bytes_fail_buffer_full() {
    let err = run(stub("duplicate"), one_byte_buffer).unwrap_err();
    assert!(
        err.contains("A -> B: 4 bytes were unexpectedly received!!"),
        "{}",
        err
    );
}

#[test]
fn duplicated_bytes_fail_slow_receiver() {
    let err = run(stub("duplicate"), slow_receiver).unwrap_err();
    assert!(
        err.contains("A -> B: 16384 bytes were unexpectedly received!!"),
        "{}",
        err
    );
}

#[test]
fn bytes_added_mid_stream_fail_slow_receiver_without_panicking() {
    let err = run(stub("append"), slow_receiver).unwrap_err();
    assert!(err.contains("bytes were unexpectedly received!!"), "{}", err);
}

#[test]
fn truncated_stream_fails_slow_receiver() {
    let err = run(stub("truncate:8"), slow_receiver).unwrap_err();
    assert!(
        err.contains("A -> B: 8 bytes transferred correctly."),
        "{}",
        err
    );
    assert!(
        err.contains("A -> B: subsequent 16376 bytes were sent but not received (lost)."),
        "{}",
        err
    );
}

#[test]
fn truncated_stream_fails_the_relay_log_check() {
    let err = run(stub("truncate"), |s, l| Box::pin(scenarios::happy_path(s, l))).unwrap_err();
    assert!(err.contains("relay -> B"), "{}", err);
}
