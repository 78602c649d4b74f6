//! stub-relay: stand-in relay for running the scenarios without the real one.
//!
//! It takes the relay's command line and prints the relay's log format, so
//! the scenarios cannot tell it apart from the real relay while it forwards
//! faithfully. `STUB_RELAY_MODE` makes the A -> B direction misbehave:
//!
//! - `faithful` (default)
//! - `duplicate`: every chunk is written twice
//! - `append`: a `!` follows every chunk
//! - `truncate` or `truncate:<n>`: only the first `n` bytes (8 by default)
//!   get through, then the flow is shut down and the rest is dropped
//!
//! The log always shows what was read, not what was written. B -> A is
//! always forwarded faithfully.
//!
//! # Usage
//!
//! ```bash
//! STUB_RELAY_MODE=duplicate stub-relay -A 127.0.0.1:9000 -B 127.0.0.1:9001 -b 1:2048
//! ```

use std::fs::File;
use std::io::{self, Write};
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use relay_harness::SizePair;
use relay_harness::hexdump::{raw_hex, rows};
use relay_harness::proxy::{A_TO_B_DUMP, B_TO_A_DUMP, DEFAULT_BUF_SIZE};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

const MODE_VAR: &str = "STUB_RELAY_MODE";

const TRUNCATE_AFTER: usize = 8;

const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Parser, Debug)]
#[command(name = "stub-relay")]
#[command(about = "Stand-in relay for the regression scenarios")]
struct Args {
    /// Address to listen on for A (host:port)
    #[arg(short = 'A')]
    source: String,

    /// Address of B to connect to (host:port)
    #[arg(short = 'B')]
    destination: String,

    /// Buffer sizes, A->B then B->A
    #[arg(short = 'b')]
    buf_sizes: Option<SizePair>,

    /// Socket buffer sizes, SND then RCV
    #[arg(short = 'z')]
    skt_buf_sizes: Option<SizePair>,

    /// Also write the traffic to AtoB.dump and BtoA.dump
    #[arg(short = 'o')]
    to_file: bool,

    /// Do not color the output
    #[arg(short = 'c')]
    colorless: bool,
}

/// How the A -> B direction is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mangle {
    Faithful,
    Duplicate,
    Append,
    Truncate(usize),
}

impl FromStr for Mangle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "faithful" => Ok(Mangle::Faithful),
            None if s == "duplicate" => Ok(Mangle::Duplicate),
            None if s == "append" => Ok(Mangle::Append),
            None if s == "truncate" => Ok(Mangle::Truncate(TRUNCATE_AFTER)),
            Some(("truncate", n)) => n
                .parse()
                .map(Mangle::Truncate)
                .map_err(|_| format!("invalid truncation length {:?}", n)),
            _ => Err(format!("unknown {} {:?}", MODE_VAR, s)),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .without_time()
        .init();

    let args = Args::parse();
    let mangle = match std::env::var(MODE_VAR) {
        Ok(raw) => match raw.parse() {
            Ok(mangle) => mangle,
            Err(e) => {
                eprintln!("stub-relay: {}", e);
                return ExitCode::FAILURE;
            }
        },
        Err(_) => Mangle::Faithful,
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("stub-relay: failed to create runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args, mangle)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stub-relay: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, mangle: Mangle) -> io::Result<()> {
    emit(&format!("Connecting to B {}...\n", args.destination))?;
    let b = TcpStream::connect(args.destination.as_str()).await?;

    emit(&format!("Waiting for a connection from A {}...\n", args.source))?;
    let listener = TcpListener::bind(args.source.as_str()).await?;
    let (a, peer) = listener.accept().await?;
    drop(listener);
    tracing::debug!(%peer, ?mangle, "bridging");

    let sizes = args
        .buf_sizes
        .unwrap_or(SizePair(DEFAULT_BUF_SIZE, DEFAULT_BUF_SIZE));
    emit(&format!(
        "Allocating buffers: {} and {} bytes...\n",
        sizes.0, sizes.1
    ))?;

    if let Some(SizePair(snd, rcv)) = args.skt_buf_sizes {
        for stream in [&a, &b] {
            let socket = SockRef::from(stream);
            socket.set_send_buffer_size(snd)?;
            socket.set_recv_buffer_size(rcv)?;
        }
    }

    let dump = |name: &str| match args.to_file {
        true => File::create(name).map(Some),
        false => Ok(None),
    };
    let color = |escape: &'static str| (!args.colorless).then_some(escape);

    let a_to_b = Direction {
        from: "A",
        to: "B",
        color: color("\x1b[91m"),
        buf_size: sizes.0,
        mangle,
        dump: dump(A_TO_B_DUMP)?,
        offset: 0,
    };
    let b_to_a = Direction {
        from: "B",
        to: "A",
        color: color("\x1b[94m"),
        buf_size: sizes.1,
        mangle: Mangle::Faithful,
        dump: dump(B_TO_A_DUMP)?,
        offset: 0,
    };

    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();
    let forward_a = tokio::spawn(a_to_b.forward(a_read, b_write));
    let forward_b = tokio::spawn(b_to_a.forward(b_read, a_write));
    forward_a.await.map_err(io::Error::other)??;
    forward_b.await.map_err(io::Error::other)??;
    Ok(())
}

/// One direction of the bridge and its log.
struct Direction {
    from: &'static str,
    to: &'static str,
    color: Option<&'static str>,
    buf_size: usize,
    mangle: Mangle,
    dump: Option<File>,
    /// Stream offset of the next byte read from the producer.
    offset: usize,
}

impl Direction {
    async fn forward(
        mut self,
        mut producer: OwnedReadHalf,
        mut consumer: OwnedWriteHalf,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; self.buf_size.max(1)];
        let mut open = true;

        loop {
            let n = producer.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            let before = self.offset;
            self.sent(chunk)?;
            if !open {
                continue;
            }

            match self.mangle {
                Mangle::Faithful => consumer.write_all(chunk).await?,
                Mangle::Duplicate => {
                    consumer.write_all(chunk).await?;
                    consumer.write_all(chunk).await?;
                }
                Mangle::Append => {
                    consumer.write_all(chunk).await?;
                    consumer.write_all(b"!").await?;
                }
                Mangle::Truncate(limit) => {
                    let keep = limit.saturating_sub(before).min(n);
                    consumer.write_all(&chunk[..keep]).await?;
                    if self.offset >= limit {
                        consumer.shutdown().await?;
                        self.say(&format!("{} -> {} flow shutdown\n", self.from, self.to))?;
                        open = false;
                        continue;
                    }
                }
            }
            self.say(&format!("{} is in sync\n", self.to))?;
        }

        if open {
            consumer.shutdown().await?;
            self.say(&format!("{} -> {} flow shutdown\n", self.from, self.to))?;
        }
        Ok(())
    }

    /// Log a chunk read from the producer and append it to the dump file.
    fn sent(&mut self, chunk: &[u8]) -> io::Result<()> {
        let header = format!("{} -> {} sent {} bytes\n", self.from, self.to, chunk.len());
        let dump = rows(self.offset, chunk);
        let text = match self.color {
            Some(_) => format!("{}{}{}", header, BOLD, dump),
            None => format!("{}{}", header, dump),
        };

        if let Some(file) = &mut self.dump {
            file.write_all(raw_hex(self.offset, chunk).as_bytes())?;
            file.flush()?;
        }
        self.offset += chunk.len();
        self.say(&text)
    }

    fn say(&self, text: &str) -> io::Result<()> {
        match self.color {
            Some(color) => emit(&format!("{}{}{}", color, text, RESET)),
            None => emit(text),
        }
    }
}

fn emit(text: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(text.as_bytes())?;
    out.flush()
}
