//! Socket capability layer.
//!
//! Client and server never call the OS directly; they go through a
//! [`SocketInterface`], which exposes exactly the POSIX primitives the bus
//! needs. Production code uses [`OsSocket`]; tests script a [`MockSocket`].
//!
//! # Conventions
//!
//! - Handles are plain [`RawSocket`] integers owned by whoever created them.
//! - `send` / `recv` return `Ok(0)` for an orderly peer close and `Err` for
//!   failures, mirroring the `0` / `-1` contract of the C calls.
//! - Teardown is shutdown-then-close: [`SocketInterface::shutdown`] wakes any
//!   thread blocked in `recv` / `accept` before the handle is released.

// Rust guideline compliant 2026-02

pub mod mock;
mod os;

pub use mock::MockSocket;
pub use os::OsSocket;

use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::constants::PACKET_SIZE;
use crate::protocol::Packet;

/// OS-level socket handle.
pub type RawSocket = libc::c_int;

/// Socket interface shared between a connection and its threads.
pub type SharedSocket = Arc<dyn SocketInterface>;

/// Options the bus sets through `setsockopt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// `SO_REUSEADDR`
    ReuseAddr,
    /// `SO_REUSEPORT`
    ReusePort,
}

/// The socket primitives used by the bus.
///
/// All sockets are IPv4 stream sockets.
pub trait SocketInterface: Send + Sync + fmt::Debug {
    /// Create a TCP socket.
    fn socket(&self) -> io::Result<RawSocket>;

    /// Enable a boolean socket option.
    fn setsockopt(&self, sock: RawSocket, option: SocketOption) -> io::Result<()>;

    /// Bind to a local address.
    fn bind(&self, sock: RawSocket, addr: SocketAddrV4) -> io::Result<()>;

    /// Start listening with the given backlog.
    fn listen(&self, sock: RawSocket, backlog: i32) -> io::Result<()>;

    /// Block until a connection arrives.
    fn accept(&self, sock: RawSocket) -> io::Result<(RawSocket, SocketAddrV4)>;

    /// Connect to a remote address.
    fn connect(&self, sock: RawSocket, addr: SocketAddrV4) -> io::Result<()>;

    /// Send bytes; returns how many were written, `0` if the peer is gone.
    fn send(&self, sock: RawSocket, buf: &[u8]) -> io::Result<usize>;

    /// Receive bytes; returns `0` on orderly close.
    fn recv(&self, sock: RawSocket, buf: &mut [u8]) -> io::Result<usize>;

    /// Shut down both directions, waking blocked readers.
    fn shutdown(&self, sock: RawSocket) -> io::Result<()>;

    /// Release the handle.
    fn close(&self, sock: RawSocket) -> io::Result<()>;
}

/// Errors after which a receive loop keeps going.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::InvalidData
    )
}

/// Send one encoded packet in a single call.
pub fn send_packet(iface: &dyn SocketInterface, sock: RawSocket, packet: &Packet) -> io::Result<usize> {
    iface.send(sock, &packet.to_bytes())
}

/// Receive one whole packet.
///
/// Returns `Ok(None)` when the peer closed the connection. Bytes that do not
/// decode to a packet surface as an `InvalidData` error (transient: the
/// stream stays aligned because a full packet's worth was consumed).
pub fn recv_packet(iface: &dyn SocketInterface, sock: RawSocket) -> io::Result<Option<Packet>> {
    let mut buf = [0u8; PACKET_SIZE];
    let mut filled = 0;
    while filled < PACKET_SIZE {
        match iface.recv(sock, &mut buf[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            // Mid-packet: keep reading so the stream stays aligned.
            Err(e) if filled > 0 && is_transient(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Packet::from_bytes(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
