//! The out-of-band bootstrap channel.
//!
//! A single TCP connection between the two peers, used for control traffic only: the endpoint
//! address exchange and barrier tokens. Everything on it is fixed-size, so there is no framing.

use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};
use zerocopy::byteorder::{BigEndian, U32};

pub const DEFAULT_PORT: u16 = 9228;

/// Which side of the bootstrap connection this process is.
///
/// Fixed for the lifetime of the process: a peer that was given a destination connects, the
/// other one listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    Listener,
    Connector,
}

impl Role {
    pub fn from_destination(dst: Option<&str>) -> Role {
        match dst {
            Some(_) => Role::Connector,
            None => Role::Listener,
        }
    }

    /// Whether this side sends its barrier token before waiting for the peer's.
    #[inline]
    pub fn signals_first(self) -> bool {
        matches!(self, Role::Connector)
    }
}

/// Barrier signal. Always big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(pub u32);

impl Token {
    pub const WIRE_LEN: usize = 4;
    pub const READY: Token = Token(0);

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        U32::<BigEndian>::new(self.0).to_bytes()
    }

    pub fn from_wire(bytes: [u8; Self::WIRE_LEN]) -> Token {
        Token(U32::<BigEndian>::from_bytes(bytes).get())
    }
}

/// A byte stream usable as the bootstrap connection.
pub trait ControlStream: Read + Write {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

impl ControlStream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// The connected bootstrap channel.
#[derive(Debug)]
pub struct OobChannel<S: ControlStream = TcpStream> {
    stream: S,
    nonblocking: bool,
    // A token may arrive in pieces across non-blocking reads.
    pending: [u8; Token::WIRE_LEN],
    filled: usize,
}

impl<S: ControlStream> OobChannel<S> {
    pub fn new(stream: S) -> Self {
        OobChannel {
            stream,
            nonblocking: false,
            pending: [0; Token::WIRE_LEN],
            filled: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    fn set_nonblocking_mode(&mut self, nonblocking: bool) -> Result<()> {
        if self.nonblocking != nonblocking {
            self.stream.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    /// Writes all of `bytes`, however many writes the stream needs.
    pub fn send_exact(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_nonblocking_mode(false)?;
        let mut sent = 0;
        while sent < bytes.len() {
            match self.stream.write(&bytes[sent..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Fills `buf` completely. A zero-length read means the peer went away.
    pub fn recv_exact_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.set_nonblocking_mode(false)?;
        // Bytes already pulled in by `try_recv_token` belong to the front of the stream.
        let mut rcvd = self.filled.min(buf.len());
        buf[..rcvd].copy_from_slice(&self.pending[..rcvd]);
        self.pending.copy_within(rcvd..self.filled, 0);
        self.filled -= rcvd;

        while rcvd < buf.len() {
            match self.stream.read(&mut buf[rcvd..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => rcvd += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.recv_exact_into(&mut buf)?;
        Ok(buf)
    }

    /// Sends one barrier token with a single write.
    ///
    /// Tokens are tiny and the socket runs with no-delay, so a short write means the channel is
    /// broken rather than busy.
    pub fn send_token(&mut self, token: Token) -> Result<()> {
        self.set_nonblocking_mode(false)?;
        let wire = token.to_wire();
        let sent = loop {
            match self.stream.write(&wire) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        if sent != wire.len() {
            return Err(Error::BarrierProtocol {
                sent,
                expected: wire.len(),
            });
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Reads whatever part of the peer's token is available without blocking.
    ///
    /// Returns `Some` once all four bytes have arrived.
    pub fn try_recv_token(&mut self) -> Result<Option<Token>> {
        self.set_nonblocking_mode(true)?;
        loop {
            match self.stream.read(&mut self.pending[self.filled..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    self.filled += n;
                    if self.filled == Token::WIRE_LEN {
                        self.filled = 0;
                        return Ok(Some(Token::from_wire(self.pending)));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Shuts the connection down. The stream itself is released when the channel drops.
    pub fn close(&mut self) -> Result<()> {
        self.stream.close()?;
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let resolution_error = |source| Error::AddressResolution {
        host: host.to_owned(),
        port,
        source,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(resolution_error)?
        .next()
        .ok_or_else(|| {
            resolution_error(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses returned",
            ))
        })
}

/// A bound listening socket that will accept exactly one peer.
pub struct OobListener {
    listener: TcpListener,
}

impl OobListener {
    /// Binds to `bind_address` (all interfaces if `None`) and `port`.
    pub fn bind(bind_address: Option<&str>, port: u16) -> Result<OobListener> {
        let addr = resolve(bind_address.unwrap_or("0.0.0.0"), port)?;
        let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        info!(addr = %listener.local_addr()?, "bootstrap channel listening");
        Ok(OobListener { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one connection. The listening socket is closed on return.
    pub fn accept(self) -> Result<OobChannel> {
        let (stream, peer) = self.listener.accept().map_err(Error::Accept)?;
        info!(%peer, "bootstrap peer accepted");
        setup(stream)
    }
}

pub fn listen_and_accept(bind_address: Option<&str>, port: u16) -> Result<OobChannel> {
    OobListener::bind(bind_address, port)?.accept()
}

/// Connects to `destination_address:port`, then waits `settle` before handing the channel out.
pub fn connect(destination_address: &str, port: u16, settle: Duration) -> Result<OobChannel> {
    let addr = resolve(destination_address, port)?;
    let stream = TcpStream::connect(addr).map_err(|source| Error::Connect {
        addr: format!("{destination_address}:{port}"),
        source,
    })?;
    info!(%addr, "bootstrap channel connected");
    if !settle.is_zero() {
        debug!(?settle, "waiting for the listener to settle");
        std::thread::sleep(settle);
    }
    setup(stream)
}

fn setup(stream: TcpStream) -> Result<OobChannel> {
    stream.set_nodelay(true)?;
    Ok(OobChannel::new(stream))
}
