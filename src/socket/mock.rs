//! Scriptable socket double for tests.
//!
//! `MockSocket` hands out fake handles, records every call, and lets a test
//! decide what each `recv`, `send` and `accept` returns. Blocking calls
//! really block (on a condvar) until the test feeds them or the handle is
//! shut down, so client and server threads behave as they would over TCP.
//!
//! ```rust,ignore
//! let mock = MockSocket::new();
//! let peer = mock.connect_peer();          // next accept() returns `peer`
//! mock.push_packet(peer, &Packet::handshake(5));
//! mock.script_send(peer, Err(io::ErrorKind::BrokenPipe));
//! ```

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{RawSocket, SocketInterface, SocketOption};
use crate::protocol::Packet;

/// Upper bound on how long a mock `recv`/`accept` blocks.
///
/// Keeps a broken test from hanging the suite; the call then reports a
/// closed connection.
const BLOCK_LIMIT: Duration = Duration::from_secs(10);

/// Which primitive a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOp {
    /// `socket()`
    Socket,
    /// `setsockopt()`
    SetSockOpt,
    /// `bind()`
    Bind,
    /// `listen()`
    Listen,
    /// `accept()`
    Accept,
    /// `connect()`
    Connect,
    /// `send()`
    Send,
    /// `recv()`
    Recv,
    /// `shutdown()`
    Shutdown,
    /// `close()`
    Close,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCall {
    /// `socket()` and the handle it returned (or -1).
    Socket(RawSocket),
    /// `setsockopt(sock, option)`
    SetSockOpt(RawSocket, SocketOption),
    /// `bind(sock, addr)`
    Bind(RawSocket, SocketAddrV4),
    /// `listen(sock, backlog)`
    Listen(RawSocket, i32),
    /// `accept(sock)`
    Accept(RawSocket),
    /// `connect(sock, addr)`
    Connect(RawSocket, SocketAddrV4),
    /// `send(sock, len)`
    Send(RawSocket, usize),
    /// `recv(sock)`
    Recv(RawSocket),
    /// `shutdown(sock)`
    Shutdown(RawSocket),
    /// `close(sock)`
    Close(RawSocket),
}

impl SocketCall {
    fn op(&self) -> SocketOp {
        match self {
            SocketCall::Socket(_) => SocketOp::Socket,
            SocketCall::SetSockOpt(..) => SocketOp::SetSockOpt,
            SocketCall::Bind(..) => SocketOp::Bind,
            SocketCall::Listen(..) => SocketOp::Listen,
            SocketCall::Accept(_) => SocketOp::Accept,
            SocketCall::Connect(..) => SocketOp::Connect,
            SocketCall::Send(..) => SocketOp::Send,
            SocketCall::Recv(_) => SocketOp::Recv,
            SocketCall::Shutdown(_) => SocketOp::Shutdown,
            SocketCall::Close(_) => SocketOp::Close,
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: RawSocket,
    calls: Vec<SocketCall>,
    failures: HashMap<SocketOp, VecDeque<io::ErrorKind>>,
    pending_accepts: VecDeque<RawSocket>,
    inbound: HashMap<RawSocket, VecDeque<Inbound>>,
    send_script: HashMap<RawSocket, VecDeque<Result<usize, io::ErrorKind>>>,
    stalled_sends: HashSet<RawSocket>,
    sent: HashMap<RawSocket, Vec<Vec<u8>>>,
    shut: HashSet<RawSocket>,
    closed: HashSet<RawSocket>,
}

impl MockState {
    fn alloc(&mut self) -> RawSocket {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn take_failure(&mut self, op: SocketOp) -> Option<io::ErrorKind> {
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn is_down(&self, sock: RawSocket) -> bool {
        self.shut.contains(&sock) || self.closed.contains(&sock)
    }
}

/// Scriptable in-memory [`SocketInterface`].
#[derive(Debug)]
pub struct MockSocket {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockSocket {
    /// Create a mock; handles start at 3 like a fresh process.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 3,
                ..MockState::default()
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        crate::lock(&self.state)
    }

    fn update(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.lock());
        self.changed.notify_all();
    }

    // ── Scripting ────────────────────────────────────────────────────────────

    /// Make the next call of `op` fail with `kind`. Failures queue up.
    pub fn fail_next(&self, op: SocketOp, kind: io::ErrorKind) {
        self.update(|s| s.failures.entry(op).or_default().push_back(kind));
    }

    /// Queue an incoming connection; returns the handle `accept` will yield.
    pub fn connect_peer(&self) -> RawSocket {
        let mut handle = 0;
        self.update(|s| {
            handle = s.alloc();
            s.pending_accepts.push_back(handle);
        });
        handle
    }

    /// Queue raw bytes for `recv` on `sock`.
    pub fn push_recv(&self, sock: RawSocket, bytes: &[u8]) {
        self.update(|s| s.inbound.entry(sock).or_default().push_back(Inbound::Data(bytes.to_vec())));
    }

    /// Queue one encoded packet for `recv` on `sock`.
    pub fn push_packet(&self, sock: RawSocket, packet: &Packet) {
        self.push_recv(sock, &packet.to_bytes());
    }

    /// Queue an orderly close (`recv` returns 0).
    pub fn push_eof(&self, sock: RawSocket) {
        self.update(|s| s.inbound.entry(sock).or_default().push_back(Inbound::Eof));
    }

    /// Queue a `recv` error.
    pub fn push_recv_error(&self, sock: RawSocket, kind: io::ErrorKind) {
        self.update(|s| s.inbound.entry(sock).or_default().push_back(Inbound::Error(kind)));
    }

    /// Script the result of the next unscripted `send` on `sock`.
    ///
    /// `Ok(n)` reports `n` bytes written (`0` means the peer is gone).
    pub fn script_send(&self, sock: RawSocket, result: Result<usize, io::ErrorKind>) {
        self.update(|s| s.send_script.entry(sock).or_default().push_back(result));
    }

    /// Make every `send` on `sock` block like a full TCP buffer until the
    /// handle is shut down or closed; the blocked call then fails with
    /// `BrokenPipe`.
    pub fn stall_send(&self, sock: RawSocket) {
        self.update(|s| {
            s.stalled_sends.insert(sock);
        });
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<SocketCall> {
        self.lock().calls.clone()
    }

    /// How many times `op` was called.
    pub fn count(&self, op: SocketOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    /// How many times `close(sock)` was called.
    pub fn close_count(&self, sock: RawSocket) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| **c == SocketCall::Close(sock))
            .count()
    }

    /// Whether `sock` has been closed.
    pub fn is_closed(&self, sock: RawSocket) -> bool {
        self.lock().closed.contains(&sock)
    }

    /// Buffers successfully written to `sock`.
    pub fn sent(&self, sock: RawSocket) -> Vec<Vec<u8>> {
        self.lock().sent.get(&sock).cloned().unwrap_or_default()
    }

    /// Packets written to `sock`, decoded.
    pub fn sent_packets(&self, sock: RawSocket) -> Vec<Packet> {
        self.sent(sock)
            .iter()
            .filter_map(|buf| Packet::from_bytes(buf).ok())
            .collect()
    }

    fn record(&self, call: SocketCall) {
        self.lock().calls.push(call);
    }
}

impl SocketInterface for MockSocket {
    fn socket(&self) -> io::Result<RawSocket> {
        let mut s = self.lock();
        if let Some(kind) = s.take_failure(SocketOp::Socket) {
            s.calls.push(SocketCall::Socket(-1));
            return Err(kind.into());
        }
        let handle = s.alloc();
        s.calls.push(SocketCall::Socket(handle));
        Ok(handle)
    }

    fn setsockopt(&self, sock: RawSocket, option: SocketOption) -> io::Result<()> {
        let mut s = self.lock();
        s.calls.push(SocketCall::SetSockOpt(sock, option));
        s.take_failure(SocketOp::SetSockOpt).map_or(Ok(()), |k| Err(k.into()))
    }

    fn bind(&self, sock: RawSocket, addr: SocketAddrV4) -> io::Result<()> {
        let mut s = self.lock();
        s.calls.push(SocketCall::Bind(sock, addr));
        s.take_failure(SocketOp::Bind).map_or(Ok(()), |k| Err(k.into()))
    }

    fn listen(&self, sock: RawSocket, backlog: i32) -> io::Result<()> {
        let mut s = self.lock();
        s.calls.push(SocketCall::Listen(sock, backlog));
        s.take_failure(SocketOp::Listen).map_or(Ok(()), |k| Err(k.into()))
    }

    fn accept(&self, sock: RawSocket) -> io::Result<(RawSocket, SocketAddrV4)> {
        self.record(SocketCall::Accept(sock));
        let deadline = Instant::now() + BLOCK_LIMIT;
        let mut s = self.lock();
        loop {
            if let Some(kind) = s.take_failure(SocketOp::Accept) {
                return Err(kind.into());
            }
            if s.is_down(sock) {
                return Err(io::ErrorKind::InvalidInput.into());
            }
            if let Some(client) = s.pending_accepts.pop_front() {
                let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40_000 + client as u16);
                return Ok((client, peer));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::ErrorKind::TimedOut.into());
            }
            s = self
                .changed
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn connect(&self, sock: RawSocket, addr: SocketAddrV4) -> io::Result<()> {
        let mut s = self.lock();
        s.calls.push(SocketCall::Connect(sock, addr));
        s.take_failure(SocketOp::Connect).map_or(Ok(()), |k| Err(k.into()))
    }

    fn send(&self, sock: RawSocket, buf: &[u8]) -> io::Result<usize> {
        let mut s = self.lock();
        s.calls.push(SocketCall::Send(sock, buf.len()));
        if let Some(kind) = s.take_failure(SocketOp::Send) {
            return Err(kind.into());
        }
        if s.stalled_sends.contains(&sock) {
            let deadline = Instant::now() + BLOCK_LIMIT;
            while !s.is_down(sock) {
                let now = Instant::now();
                if now >= deadline {
                    log::warn!("[mock] send on {sock} blocked too long");
                    break;
                }
                s = self
                    .changed
                    .wait_timeout(s, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let scripted = s.send_script.get_mut(&sock).and_then(VecDeque::pop_front);
        let result = match scripted {
            Some(result) => result.map(|n| n.min(buf.len())),
            None if s.is_down(sock) => Err(io::ErrorKind::BrokenPipe),
            None => Ok(buf.len()),
        };
        match result {
            Ok(n) => {
                if n > 0 {
                    s.sent.entry(sock).or_default().push(buf[..n].to_vec());
                }
                Ok(n)
            }
            Err(kind) => Err(kind.into()),
        }
    }

    fn recv(&self, sock: RawSocket, buf: &mut [u8]) -> io::Result<usize> {
        self.record(SocketCall::Recv(sock));
        let deadline = Instant::now() + BLOCK_LIMIT;
        let mut s = self.lock();
        loop {
            if let Some(kind) = s.take_failure(SocketOp::Recv) {
                return Err(kind.into());
            }
            let queue = s.inbound.entry(sock).or_default();
            match queue.pop_front() {
                Some(Inbound::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        queue.push_front(Inbound::Data(data.split_off(n)));
                    }
                    return Ok(n);
                }
                Some(Inbound::Eof) => return Ok(0),
                Some(Inbound::Error(kind)) => return Err(kind.into()),
                None => {}
            }
            if s.is_down(sock) {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("[mock] recv on {sock} blocked too long, reporting close");
                return Ok(0);
            }
            s = self
                .changed
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn shutdown(&self, sock: RawSocket) -> io::Result<()> {
        let mut result = Ok(());
        self.update(|s| {
            s.calls.push(SocketCall::Shutdown(sock));
            if let Some(kind) = s.take_failure(SocketOp::Shutdown) {
                result = Err(kind.into());
            } else {
                s.shut.insert(sock);
            }
        });
        result
    }

    fn close(&self, sock: RawSocket) -> io::Result<()> {
        let mut result = Ok(());
        self.update(|s| {
            s.calls.push(SocketCall::Close(sock));
            if let Some(kind) = s.take_failure(SocketOp::Close) {
                result = Err(kind.into());
            } else if !s.closed.insert(sock) {
                result = Err(io::Error::from_raw_os_error(libc::EBADF));
            }
        });
        result
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
