//! Production socket interface: thin libc wrappers with logging.
//!
//! Every call is forwarded 1:1 to the OS and logged under the `[socket]`
//! prefix. Sends and receives of exactly one packet are decoded for the log
//! line. The log statements only observe results; they never alter them.

// Rust guideline compliant 2026-02

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};

use super::{RawSocket, SocketInterface, SocketOption};
use crate::constants::PACKET_SIZE;
use crate::protocol::Packet;

/// Linux raises SIGPIPE on writes to a closed peer unless asked not to.
#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Socket interface backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSocket;

impl OsSocket {
    /// Create the OS-backed interface.
    pub fn new() -> Self {
        Self
    }
}

/// Map a C return value to `io::Result`.
fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn check_len(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: `sockaddr_in` is a plain C struct for which all-zero bytes is
    // a valid value.
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        sa.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sa
}

fn from_sockaddr(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(sa.sin_port),
    )
}

fn describe(buf: &[u8]) -> String {
    if buf.len() == PACKET_SIZE {
        match Packet::from_bytes(buf) {
            Ok(packet) => packet.summary(),
            Err(_) => format!("{} undecodable bytes", buf.len()),
        }
    } else {
        format!("{} bytes", buf.len())
    }
}

impl SocketInterface for OsSocket {
    fn socket(&self) -> io::Result<RawSocket> {
        // SAFETY: plain syscall with constant arguments.
        let result = check(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) });

        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        {
            if let Ok(sock) = result {
                let one: libc::c_int = 1;
                // SAFETY: `one` outlives the call and the length matches its type.
                unsafe {
                    libc::setsockopt(
                        sock,
                        libc::SOL_SOCKET,
                        libc::SO_NOSIGPIPE,
                        std::ptr::addr_of!(one).cast(),
                        mem::size_of::<libc::c_int>() as libc::socklen_t,
                    );
                }
            }
        }

        match &result {
            Ok(sock) => log::debug!("[socket] created socket {sock}"),
            Err(e) => log::error!("[socket] socket() failed: {e}"),
        }
        result
    }

    fn setsockopt(&self, sock: RawSocket, option: SocketOption) -> io::Result<()> {
        let name = match option {
            SocketOption::ReuseAddr => libc::SO_REUSEADDR,
            SocketOption::ReusePort => libc::SO_REUSEPORT,
        };
        let one: libc::c_int = 1;
        // SAFETY: `one` outlives the call and the length matches its type.
        let ret = unsafe {
            libc::setsockopt(
                sock,
                libc::SOL_SOCKET,
                name,
                std::ptr::addr_of!(one).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        let result = check(ret).map(|_| ());
        match &result {
            Ok(()) => log::debug!("[socket] {sock}: set {option:?}"),
            Err(e) => log::error!("[socket] {sock}: setsockopt {option:?} failed: {e}"),
        }
        result
    }

    fn bind(&self, sock: RawSocket, addr: SocketAddrV4) -> io::Result<()> {
        let sa = to_sockaddr(addr);
        // SAFETY: `sa` is a fully initialised `sockaddr_in` and the length
        // passed is its size.
        let ret = unsafe {
            libc::bind(
                sock,
                std::ptr::addr_of!(sa).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let result = check(ret).map(|_| ());
        match &result {
            Ok(()) => log::debug!("[socket] {sock}: bound to {addr}"),
            Err(e) => log::error!("[socket] {sock}: bind {addr} failed: {e}"),
        }
        result
    }

    fn listen(&self, sock: RawSocket, backlog: i32) -> io::Result<()> {
        // SAFETY: plain syscall on a caller-owned handle.
        let result = check(unsafe { libc::listen(sock, backlog) }).map(|_| ());
        match &result {
            Ok(()) => log::debug!("[socket] {sock}: listening (backlog {backlog})"),
            Err(e) => log::error!("[socket] {sock}: listen failed: {e}"),
        }
        result
    }

    fn accept(&self, sock: RawSocket) -> io::Result<(RawSocket, SocketAddrV4)> {
        // SAFETY: all-zero is a valid `sockaddr_in`.
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        // SAFETY: `sa` and `len` are valid for writes and `len` holds the
        // buffer size, as `accept(2)` requires.
        let ret = unsafe { libc::accept(sock, std::ptr::addr_of_mut!(sa).cast(), &mut len) };
        let result = check(ret).map(|client| (client, from_sockaddr(&sa)));
        match &result {
            Ok((client, peer)) => log::debug!("[socket] {sock}: accepted {client} from {peer}"),
            Err(e) => log::debug!("[socket] {sock}: accept failed: {e}"),
        }
        result
    }

    fn connect(&self, sock: RawSocket, addr: SocketAddrV4) -> io::Result<()> {
        let sa = to_sockaddr(addr);
        // SAFETY: `sa` is a fully initialised `sockaddr_in` and the length
        // passed is its size.
        let ret = unsafe {
            libc::connect(
                sock,
                std::ptr::addr_of!(sa).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let result = check(ret).map(|_| ());
        match &result {
            Ok(()) => log::debug!("[socket] {sock}: connected to {addr}"),
            Err(e) => log::warn!("[socket] {sock}: connect {addr} failed: {e}"),
        }
        result
    }

    fn send(&self, sock: RawSocket, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for reads of `buf.len()` bytes.
        let ret = unsafe { libc::send(sock, buf.as_ptr().cast(), buf.len(), SEND_FLAGS) };
        let result = check_len(ret);
        match &result {
            Ok(n) => log::trace!("[socket] {sock}: sent {n}/{} ({})", buf.len(), describe(buf)),
            Err(e) => log::debug!("[socket] {sock}: send failed: {e}"),
        }
        result
    }

    fn recv(&self, sock: RawSocket, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let ret = unsafe { libc::recv(sock, buf.as_mut_ptr().cast(), buf.len(), 0) };
        let result = check_len(ret);
        match &result {
            Ok(0) => log::debug!("[socket] {sock}: peer closed"),
            Ok(n) => log::trace!("[socket] {sock}: received {n} ({})", describe(&buf[..*n])),
            Err(e) => log::debug!("[socket] {sock}: recv failed: {e}"),
        }
        result
    }

    fn shutdown(&self, sock: RawSocket) -> io::Result<()> {
        // SAFETY: plain syscall on a caller-owned handle.
        let result = check(unsafe { libc::shutdown(sock, libc::SHUT_RDWR) }).map(|_| ());
        match &result {
            Ok(()) => log::debug!("[socket] {sock}: shut down"),
            Err(e) => log::debug!("[socket] {sock}: shutdown failed: {e}"),
        }
        result
    }

    fn close(&self, sock: RawSocket) -> io::Result<()> {
        // SAFETY: the caller owns `sock` and never uses it after this call.
        let result = check(unsafe { libc::close(sock) }).map(|_| ());
        match &result {
            Ok(()) => log::debug!("[socket] {sock}: closed"),
            Err(e) => log::error!("[socket] {sock}: close failed: {e}"),
        }
        result
    }
}
