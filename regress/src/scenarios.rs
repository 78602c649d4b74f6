//! The scenarios themselves.
//!
//! Every function here runs one scenario inside a caller-owned process
//! ledger. Harness errors abort the scenario; transfer verdicts are
//! collected on the [`Scenario`] and decide the outcome at the end.

use std::time::Duration;

use relay_harness::endpoint::DEFAULT_RCV_BUF;
use relay_harness::hexdump::decode_raw_hex;
use relay_harness::report::slow_receiver_lines;
use relay_harness::{
    ByteLedger, Consumed, ProcessLedger, Result, Shutdown, SizePair, proxy, verify,
};

use crate::{Bridge, Expect, Scenario, send};

/// Bytes pushed by the slow receiver scenario, in 1 KiB chunks.
const SLOW_RECEIVER_CHUNKS: usize = 16;

fn dump_all(scenario: &mut Scenario, ledger: &ProcessLedger, bridge: &Bridge) {
    scenario.dump_endpoint("Src", &bridge.a);
    scenario.dump_endpoint("Dst", &bridge.b);
    scenario.dump_relay(&ledger[bridge.relay]);
}

/// Data goes back and forth a few times; every byte must arrive once.
pub async fn happy_path(scenario: &mut Scenario, ledger: &mut ProcessLedger) -> Result<()> {
    scenario.say("send data back and forth and check the relay forwards and shows all of it");
    let mut bridge = scenario.bridge(ledger, DEFAULT_RCV_BUF, |cmd| cmd).await?;
    let drain = *scenario.drain_config();
    let relay = &mut ledger[bridge.relay];

    let script: [(bool, &'static [u8]); 6] = [
        (true, b"hello\n"),
        (false, b"hi there!\n"),
        (false, b"how are you?\n"),
        (true, b"very good, thanks for asking\n"),
        (false, b"good to hear that, bye\n"),
        (true, b"bye!\n"),
    ];
    for (a_to_b, message) in script {
        let consumed = if a_to_b {
            send(&mut bridge.a, &mut bridge.b, relay, &drain, message).await?
        } else {
            send(&mut bridge.b, &mut bridge.a, relay, &drain, message).await?
        };
        scenario.require(consumed.is_complete(), "peer closed mid-conversation");
    }

    scenario.close_exchange(&mut bridge).await?;
    scenario.wait_relay(ledger, &bridge).await?;
    dump_all(scenario, ledger, &bridge);

    scenario.check("A -> B", verify(bridge.a.sent(), bridge.b.received()), Expect::Exact);
    scenario.check("B -> A", verify(bridge.b.sent(), bridge.a.received()), Expect::Exact);
    let relay = &ledger[bridge.relay];
    scenario.check_relay_log(relay, ("A", &bridge.a), ("B", &bridge.b), Expect::Exact);
    scenario.check_relay_log(relay, ("B", &bridge.b), ("A", &bridge.a), Expect::Exact);
    Ok(())
}

/// Tiny relay buffers must backpressure the sender, not drop data.
pub async fn buffer_full(
    scenario: &mut Scenario,
    ledger: &mut ProcessLedger,
    sizes: SizePair,
) -> Result<()> {
    scenario.say("a full relay buffer must block the sender until there is room again");
    scenario.say(&format!("buf sizes (A->B : B->A): {}:{}", sizes.0, sizes.1));

    let mut bridge = scenario
        .bridge(ledger, DEFAULT_RCV_BUF, |cmd| cmd.buf_sizes(sizes))
        .await?;
    let drain = *scenario.drain_config();
    let relay = &mut ledger[bridge.relay];

    send(&mut bridge.a, &mut bridge.b, relay, &drain, &b"AAA\n"[..]).await?;
    send(&mut bridge.b, &mut bridge.a, relay, &drain, &b"BBB\n"[..]).await?;

    scenario.close_exchange(&mut bridge).await?;
    scenario.wait_relay(ledger, &bridge).await?;
    dump_all(scenario, ledger, &bridge);

    scenario.check("A -> B", verify(bridge.a.sent(), bridge.b.received()), Expect::Exact);
    scenario.check("B -> A", verify(bridge.b.sent(), bridge.a.received()), Expect::Exact);

    let reported = proxy::learn_buf_sizes(&mut ledger[bridge.relay]);
    scenario.say(&format!("relay reported buffers: {:?}", reported));
    scenario.require(
        reported == Some((sizes.0, sizes.1)),
        format!(
            "relay reported buffers {:?}, asked for {}:{}",
            reported, sizes.0, sizes.1
        ),
    );
    Ok(())
}

/// The receiver does not read while the sender fills every buffer on the
/// way; the relay falls behind and must catch up once the receiver reads.
///
/// With `break_the_pipe` the receiver never reads and both sides are torn
/// down: whatever arrived must still be a prefix of what was sent.
pub async fn slow_receiver(
    scenario: &mut Scenario,
    ledger: &mut ProcessLedger,
    break_the_pipe: bool,
) -> Result<()> {
    let buf_sizes = SizePair::both(4096)?;
    let skt_buf_sizes = SizePair::both(2048)?;
    scenario.say("a slow receiver fills the relay's buffer and falls out of sync");
    scenario.say(&format!(
        "buf sizes (A->B : B->A): {}:{}, socket buf sizes (SND : RCV): {}:{}",
        buf_sizes.0, buf_sizes.1, skt_buf_sizes.0, skt_buf_sizes.1
    ));

    let mut bridge = scenario
        .bridge(ledger, 2048, |cmd| {
            cmd.buf_sizes(buf_sizes).skt_buf_sizes(skt_buf_sizes)
        })
        .await?;

    let mut chunk = vec![b'X'; 1023];
    chunk.push(b'\n');
    let mut on_the_wire = 0;

    for _ in 0..SLOW_RECEIVER_CHUNKS {
        scenario
            .within("sending from A", bridge.a.send(chunk.clone()))
            .await?;
        on_the_wire += chunk.len();
        flow_lines(scenario, ledger, &bridge).await?;
    }

    scenario.pause(Duration::from_secs(1)).await;
    flow_lines(scenario, ledger, &bridge).await?;
    scenario.say(&format!("bytes on the wire: {}", on_the_wire));

    if break_the_pipe {
        scenario.pause(Duration::from_secs(1)).await;
        flow_lines(scenario, ledger, &bridge).await?;

        scenario.say("closing everything");
        bridge.a.shutdown(Shutdown::Both)?;
        scenario.pause(Duration::from_secs(5)).await;
        bridge.b.shutdown(Shutdown::Both)?;
    } else {
        while on_the_wire > 0 {
            let got = scenario
                .within("reading B", bridge.b.recv_some(on_the_wire.min(1024)))
                .await?;
            if got == 0 {
                scenario.say("relay closed before everything arrived");
                break;
            }
            on_the_wire -= got;
            scenario.pause(Duration::from_millis(100)).await;
            flow_lines(scenario, ledger, &bridge).await?;
            scenario.say(&format!("bytes on the wire: {}", on_the_wire));
        }

        scenario.pause(Duration::from_secs(1)).await;
        flow_lines(scenario, ledger, &bridge).await?;

        scenario.say("closing A and reading B to the end");
        bridge.a.shutdown(Shutdown::Write)?;
        scenario.read_to_end("B", &mut bridge.b).await?;
        bridge.b.shutdown(Shutdown::Both)?;
        bridge.a.shutdown(Shutdown::Read)?;
    }
    scenario.pause(Duration::from_secs(1)).await;
    flow_lines(scenario, ledger, &bridge).await?;

    scenario.wait_relay(ledger, &bridge).await?;
    scenario.dump_endpoint("Src", &bridge.a);
    scenario.dump_endpoint("Dst", &bridge.b);

    let verdict = verify(bridge.a.sent(), bridge.b.received());
    if break_the_pipe {
        scenario.check("A -> B", verdict, Expect::Prefix);
    } else {
        scenario.check("A -> B", verdict, Expect::Exact);
    }
    Ok(())
}

/// Print what the relay said about the two peers since the last call.
async fn flow_lines(
    scenario: &Scenario,
    ledger: &mut ProcessLedger,
    bridge: &Bridge,
) -> Result<()> {
    let relay = &mut ledger[bridge.relay];
    scenario.observe(relay).await?;
    let lines = slow_receiver_lines(relay);
    if !lines.is_empty() {
        scenario
            .narrator()
            .say(relay_harness::report::Source::Relay, &lines.join("\n"));
    }
    Ok(())
}

/// Which side closes its connection after the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closer {
    Sender,
    Receiver,
}

/// One side half-closes after "hello\n" went through. The other side must
/// see exactly that and then the close, yet still be able to answer through
/// the direction that stays open. The relay must exit on its own once both
/// directions are closed.
pub async fn shutdown(
    scenario: &mut Scenario,
    ledger: &mut ProcessLedger,
    closer: Closer,
) -> Result<()> {
    let mut bridge = scenario.bridge(ledger, DEFAULT_RCV_BUF, |cmd| cmd).await?;
    let drain = *scenario.drain_config();

    let consumed = send(
        &mut bridge.a,
        &mut bridge.b,
        &mut ledger[bridge.relay],
        &drain,
        &b"hello\n"[..],
    )
    .await?;
    scenario.require(consumed.is_complete(), "hello did not make it through");

    let (closing, other, name, peer) = match closer {
        Closer::Sender => (&mut bridge.a, &mut bridge.b, "A", "B"),
        Closer::Receiver => (&mut bridge.b, &mut bridge.a, "B", "A"),
    };
    scenario.say(&format!("closing {}'s write side...", name));
    closing.shutdown(Shutdown::Write)?;

    let after_close = scenario
        .within(&format!("waiting for {} to see the close", peer), other.consume(1))
        .await?;
    scenario.require(
        after_close == Consumed::PeerClosed { received: 0 },
        format!("expected the close to reach {}, got {:?}", peer, after_close),
    );

    scenario.say(&format!("{} answers through the open direction", peer));
    other.send(&b"bye\n"[..]).await?;
    other.shutdown(Shutdown::Write)?;
    let answer = scenario
        .within(&format!("reading {}'s answer", peer), closing.consume(4))
        .await?;
    scenario.require(
        answer.is_complete(),
        format!("{} lost its read side after its write side closed", name),
    );
    scenario.read_to_end(name, closing).await?;
    closing.shutdown(Shutdown::Read)?;
    other.shutdown(Shutdown::Read)?;

    scenario.wait_relay(ledger, &bridge).await?;
    scenario.say("all processes finished");
    dump_all(scenario, ledger, &bridge);

    scenario.check("A -> B", verify(bridge.a.sent(), bridge.b.received()), Expect::Exact);
    scenario.check("B -> A", verify(bridge.b.sent(), bridge.a.received()), Expect::Exact);
    scenario.require(
        ledger[bridge.relay].exit_status().is_some(),
        "relay exit status not recorded",
    );
    Ok(())
}

/// With `-o` the relay also writes each direction to a raw hex file; both
/// files must decode to exactly what was sent.
pub async fn dump_to_file(scenario: &mut Scenario, ledger: &mut ProcessLedger) -> Result<()> {
    let dir = std::env::temp_dir().join(format!("relay-regress-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;

    let mut bridge = scenario
        .bridge(ledger, DEFAULT_RCV_BUF, |cmd| cmd.to_file(true).working_dir(&dir))
        .await?;
    let drain = *scenario.drain_config();
    let relay = &mut ledger[bridge.relay];

    for _ in 0..10 {
        let mut a_line = vec![b'A'; 12];
        a_line.push(b'\n');
        let mut b_line = vec![b'B'; 7];
        b_line.push(b'\n');
        send(&mut bridge.a, &mut bridge.b, relay, &drain, a_line).await?;
        send(&mut bridge.b, &mut bridge.a, relay, &drain, b_line).await?;
    }

    scenario.close_exchange(&mut bridge).await?;
    scenario.wait_relay(ledger, &bridge).await?;

    let (a_to_b, b_to_a) = bridge.relay_cmd.dump_paths();
    for (label, path, sender) in [
        ("A -> B dump", &a_to_b, &bridge.a),
        ("B -> A dump", &b_to_a, &bridge.b),
    ] {
        let text = std::fs::read_to_string(path)?;
        scenario.say(&format!("{}:\n{}", label, text));
        match decode_raw_hex(&text) {
            Ok(bytes) => {
                let dumped: ByteLedger = std::iter::once(bytes).collect();
                scenario.check(label, verify(sender.sent(), &dumped), Expect::Exact);
            }
            Err(e) => scenario.require(false, format!("{}: {}", label, e)),
        }
    }
    dump_all(scenario, ledger, &bridge);

    for path in [&a_to_b, &b_to_a] {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove dump file");
        }
    }
    let _ = std::fs::remove_dir(&dir);
    Ok(())
}
