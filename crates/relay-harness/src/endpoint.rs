//! Loopback TCP endpoint with independent half-duplex shutdown.
//!
//! An [`Endpoint`] is one side (source or destination) of a connection that
//! goes through the relay under test. Every byte written or read is recorded
//! in a [`ByteLedger`] so that the transfer can be verified afterwards.
//!
//! # State machine
//!
//! ```text
//!   Listening --accept--> Connected --shutdown(last open flow)--> Closed
//!                            ^
//!   connect -----------------+
//! ```
//!
//! The read and write flows are tracked separately. Shutting down one flow
//! half-closes only that direction; once no flow is left the socket is closed
//! and any further I/O is a [`Violation`].

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bitflags::bitflags;
use bytes::Bytes;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::{HarnessError, Result, Violation};
use crate::ledger::ByteLedger;

/// Receive buffer size used when none is given.
pub const DEFAULT_RCV_BUF: usize = 2048;

/// Upper bound for a single `read` issued while consuming.
const READ_CHUNK: usize = 64 * 1024;

/// One direction of a full-duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Read,
    Write,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Read => write!(f, "read"),
            Flow::Write => write!(f, "write"),
        }
    }
}

bitflags! {
    /// Set of flows that are still open on an endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flows: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl From<Flow> for Flows {
    fn from(flow: Flow) -> Self {
        match flow {
            Flow::Read => Flows::READ,
            Flow::Write => Flows::WRITE,
        }
    }
}

/// Which flows a call to [`Endpoint::shutdown`] closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Every flow that is still open.
    Both,
    /// Only the write direction (sends FIN to the peer).
    Write,
    /// Only the read direction.
    Read,
}

impl Shutdown {
    fn single(self) -> Option<Flow> {
        match self {
            Shutdown::Both => None,
            Shutdown::Write => Some(Flow::Write),
            Shutdown::Read => Some(Flow::Read),
        }
    }
}

/// How an endpoint gets its connection: exactly one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Bind and listen on this loopback port, then [`Endpoint::accept`].
    Listen(u16),
    /// Connect to this loopback port.
    Connect(u16),
}

impl Mode {
    /// Build a mode out of two optional ports, rejecting zero or both.
    pub fn from_options(listen_on: Option<u16>, connect_to: Option<u16>) -> Result<Self> {
        match (listen_on, connect_to) {
            (Some(port), None) => Ok(Mode::Listen(port)),
            (None, Some(port)) => Ok(Mode::Connect(port)),
            (None, None) => Err(HarnessError::Configuration(
                "endpoint needs either a listen port or a connect port".to_string(),
            )),
            (Some(l), Some(c)) => Err(HarnessError::Configuration(format!(
                "endpoint cannot both listen on {} and connect to {}",
                l, c
            ))),
        }
    }

    fn port(self) -> u16 {
        match self {
            Mode::Listen(port) | Mode::Connect(port) => port,
        }
    }
}

/// Outcome of [`Endpoint::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    /// All requested bytes arrived.
    Complete,
    /// The peer closed its write side after `received` of the requested bytes.
    PeerClosed { received: usize },
}

impl Consumed {
    pub fn is_complete(self) -> bool {
        matches!(self, Consumed::Complete)
    }
}

enum Socket {
    Listening(TcpListener),
    Connected(TcpStream),
    Closed,
}

/// A TCP socket wrapper with byte ledgers and half-close tracking.
pub struct Endpoint {
    socket: Socket,
    mode: Mode,
    rcv_buf: usize,
    open: Flows,
    sent: ByteLedger,
    received: ByteLedger,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.socket {
            Socket::Listening(_) => "listening",
            Socket::Connected(_) => "connected",
            Socket::Closed => "closed",
        };
        f.debug_struct("Endpoint")
            .field("mode", &self.mode)
            .field("state", &state)
            .field("open", &self.open)
            .field("sent", &self.sent.len())
            .field("received", &self.received.len())
            .finish()
    }
}

impl Endpoint {
    /// Create an endpoint on 127.0.0.1.
    ///
    /// The socket is configured with `TCP_NODELAY` and the given receive
    /// buffer size before it is bound or connected.
    pub async fn new(mode: Mode, rcv_buf: usize) -> Result<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, mode.port()));
        let raw = TcpSocket::new_v4()?;
        configure(SockRef::from(&raw), rcv_buf)?;

        let socket = match mode {
            Mode::Listen(_) => {
                raw.bind(addr)?;
                let listener = raw.listen(1)?;
                tracing::debug!(local = ?listener.local_addr().ok(), "endpoint listening");
                Socket::Listening(listener)
            }
            Mode::Connect(_) => {
                let stream = raw.connect(addr).await?;
                tracing::debug!(peer = %addr, "endpoint connected");
                Socket::Connected(stream)
            }
        };

        Ok(Self {
            socket,
            mode,
            rcv_buf,
            open: Flows::all(),
            sent: ByteLedger::new(),
            received: ByteLedger::new(),
        })
    }

    /// Listen on `port` with the default receive buffer.
    pub async fn listen(port: u16) -> Result<Self> {
        Self::new(Mode::Listen(port), DEFAULT_RCV_BUF).await
    }

    /// Connect to `port` with the default receive buffer.
    pub async fn connect(port: u16) -> Result<Self> {
        Self::new(Mode::Connect(port), DEFAULT_RCV_BUF).await
    }

    /// Wait for a peer and swap the listening socket for the connection.
    ///
    /// The listening socket is shut down and closed; the accepted socket gets
    /// the same `TCP_NODELAY`/receive buffer configuration.
    pub async fn accept(&mut self) -> Result<SocketAddr> {
        if let Mode::Connect(_) = self.mode {
            return Err(HarnessError::NotListening);
        }
        let listener = match &self.socket {
            Socket::Listening(listener) => listener,
            Socket::Closed => return Err(Violation::SocketClosed.into()),
            Socket::Connected(_) => return Err(HarnessError::NotListening),
        };

        let (stream, peer) = listener.accept().await?;

        if let Socket::Listening(listener) = std::mem::replace(&mut self.socket, Socket::Closed) {
            // Linux lets shutdown(2) stop a listener; elsewhere close() is enough.
            let _ = SockRef::from(&listener).shutdown(std::net::Shutdown::Both);
            drop(listener);
        }

        configure(SockRef::from(&stream), self.rcv_buf)?;
        self.socket = Socket::Connected(stream);
        tracing::debug!(%peer, "endpoint accepted");
        Ok(peer)
    }

    /// Record `payload` in the sent ledger and write all of it.
    ///
    /// Partial writes are retried until the transport took every byte.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        let stream = connected(&mut self.socket, self.open, Flow::Write)?;
        self.sent.append(payload.clone());
        stream.write_all(&payload).await?;
        tracing::trace!(bytes = payload.len(), "endpoint sent");
        Ok(())
    }

    /// Read until `n` bytes were received or the peer closed.
    ///
    /// Every chunk read is appended to the received ledger, including the
    /// partial data that arrived before a peer close.
    pub async fn consume(&mut self, n: usize) -> Result<Consumed> {
        let stream = connected(&mut self.socket, self.open, Flow::Read)?;
        let mut buf = vec![0u8; n.min(READ_CHUNK)];
        let mut remaining = n;

        while remaining > 0 {
            let want = remaining.min(buf.len());
            let got = stream.read(&mut buf[..want]).await?;
            if got == 0 {
                tracing::debug!(received = n - remaining, requested = n, "peer closed");
                return Ok(Consumed::PeerClosed {
                    received: n - remaining,
                });
            }
            self.received.append(Bytes::copy_from_slice(&buf[..got]));
            remaining -= got;
        }

        Ok(Consumed::Complete)
    }

    /// Read until the peer closes its write side.
    ///
    /// Returns how many bytes arrived before the close; they all land in the
    /// received ledger, so anything beyond what the peer meant to send shows
    /// up when the transfer is verified.
    pub async fn consume_to_end(&mut self) -> Result<usize> {
        let stream = connected(&mut self.socket, self.open, Flow::Read)?;
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0;

        loop {
            let got = stream.read(&mut buf).await?;
            if got == 0 {
                tracing::debug!(received = total, "read to end of stream");
                return Ok(total);
            }
            self.received.append(Bytes::copy_from_slice(&buf[..got]));
            total += got;
        }
    }

    /// Issue a single read of at most `max` bytes.
    ///
    /// Returns the number of bytes read; 0 means the peer closed.
    pub async fn recv_some(&mut self, max: usize) -> Result<usize> {
        let stream = connected(&mut self.socket, self.open, Flow::Read)?;
        let mut buf = vec![0u8; max];
        let got = stream.read(&mut buf).await?;
        buf.truncate(got);
        self.received.append(buf);
        Ok(got)
    }

    /// Shut down one or both flows.
    ///
    /// Closing a flow that is already closed is a violation. When the last
    /// open flow goes away the socket itself is closed.
    pub fn shutdown(&mut self, which: Shutdown) -> Result<()> {
        if matches!(self.socket, Socket::Closed) {
            return Err(Violation::SocketClosed.into());
        }

        let flows = match which.single() {
            Some(flow) if !self.open.contains(flow.into()) => {
                return Err(Violation::FlowAlreadyClosed(flow).into());
            }
            Some(flow) => Flows::from(flow),
            None => self.open,
        };

        let mut failure = None;
        for (flow, how) in [
            (Flows::READ, std::net::Shutdown::Read),
            (Flows::WRITE, std::net::Shutdown::Write),
        ] {
            if !flows.contains(flow) {
                continue;
            }
            self.open.remove(flow);
            if let Err(e) = self.half_close(how) {
                failure.get_or_insert(e);
            }
        }

        tracing::debug!(?which, open = ?self.open, "endpoint shutdown");

        if self.open.is_empty() {
            self.socket = Socket::Closed;
            tracing::debug!("endpoint closed");
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn half_close(&self, how: std::net::Shutdown) -> std::io::Result<()> {
        let result = match &self.socket {
            Socket::Connected(stream) => SockRef::from(stream).shutdown(how),
            // A listener has no flows on the wire; dropping it is what matters.
            Socket::Listening(_) | Socket::Closed => Ok(()),
        };
        match result {
            // The peer already tore the connection down.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                tracing::debug!(?how, "half-close on a disconnected socket");
                Ok(())
            }
            other => other,
        }
    }

    /// Port this endpoint is bound to locally.
    pub fn local_port(&self) -> Result<u16> {
        let addr = match &self.socket {
            Socket::Listening(listener) => listener.local_addr()?,
            Socket::Connected(stream) => stream.local_addr()?,
            Socket::Closed => return Err(Violation::SocketClosed.into()),
        };
        Ok(addr.port())
    }

    /// Receive buffer size as negotiated with the kernel.
    ///
    /// Linux doubles the requested `SO_RCVBUF`, so this is usually not the
    /// value passed at construction.
    pub fn recv_buffer_size(&self) -> Result<usize> {
        let size = match &self.socket {
            Socket::Listening(listener) => SockRef::from(listener).recv_buffer_size()?,
            Socket::Connected(stream) => SockRef::from(stream).recv_buffer_size()?,
            Socket::Closed => return Err(Violation::SocketClosed.into()),
        };
        Ok(size)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Receive buffer size requested at construction.
    pub fn requested_rcv_buf(&self) -> usize {
        self.rcv_buf
    }

    pub fn open_flows(&self) -> Flows {
        self.open
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.socket, Socket::Closed)
    }

    pub fn sent(&self) -> &ByteLedger {
        &self.sent
    }

    pub fn received(&self) -> &ByteLedger {
        &self.received
    }
}

/// Low-latency mode plus the requested receive buffer.
fn configure(socket: SockRef<'_>, rcv_buf: usize) -> std::io::Result<()> {
    socket.set_tcp_nodelay(true)?;
    socket.set_recv_buffer_size(rcv_buf)?;
    Ok(())
}

fn connected(socket: &mut Socket, open: Flows, flow: Flow) -> Result<&mut TcpStream> {
    let stream = match socket {
        Socket::Connected(stream) => stream,
        Socket::Listening(_) => return Err(Violation::NotConnected.into()),
        Socket::Closed => return Err(Violation::SocketClosed.into()),
    };
    if !open.contains(flow.into()) {
        return Err(match flow {
            Flow::Write => Violation::ClosedWriteSide,
            Flow::Read => Violation::ClosedReadSide,
        }
        .into());
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_requires_exactly_one_target() {
        assert_eq!(Mode::from_options(Some(9000), None).unwrap(), Mode::Listen(9000));
        assert_eq!(Mode::from_options(None, Some(9001)).unwrap(), Mode::Connect(9001));
        assert!(matches!(
            Mode::from_options(None, None),
            Err(HarnessError::Configuration(_))
        ));
        assert!(matches!(
            Mode::from_options(Some(1), Some(2)),
            Err(HarnessError::Configuration(_))
        ));
    }

    #[test]
    fn shutdown_both_has_no_single_flow() {
        assert_eq!(Shutdown::Both.single(), None);
        assert_eq!(Shutdown::Write.single(), Some(Flow::Write));
        assert_eq!(Shutdown::Read.single(), Some(Flow::Read));
    }

    #[tokio::test]
    async fn accept_on_connect_mode_is_rejected() {
        let mut listener = Endpoint::listen(0).await.unwrap();
        let port = listener.local_port().unwrap();
        let mut client = Endpoint::connect(port).await.unwrap();

        assert!(matches!(
            client.accept().await,
            Err(HarnessError::NotListening)
        ));
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn accept_on_a_closed_connect_endpoint_is_still_not_listening() {
        let mut listener = Endpoint::listen(0).await.unwrap();
        let port = listener.local_port().unwrap();
        let mut client = Endpoint::connect(port).await.unwrap();
        listener.accept().await.unwrap();

        client.shutdown(Shutdown::Both).unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            client.accept().await,
            Err(HarnessError::NotListening)
        ));
    }

    #[tokio::test]
    async fn io_before_accept_is_a_violation() {
        let mut listener = Endpoint::listen(0).await.unwrap();
        assert!(matches!(
            listener.send(&b"early"[..]).await,
            Err(HarnessError::ProtocolViolation(Violation::NotConnected))
        ));
        assert!(listener.sent().is_empty());
    }
}
