//! Listening side of the bus: accept thread, per-peer handlers, id registry.
//!
//! # Threads
//!
//! ```text
//! start_connection() ──► bus-server-accept ──accept()──► bus-server-peer (one per socket)
//!                                                          │ 1. handshake → register id
//!                                                          │ 2. recv loop → receive callback
//!                                                          └ 3. unregister, close socket
//! ```
//!
//! # Registry
//!
//! Three collections, one mutex each, never held together:
//!
//! | Collection | Key → value     | Used by                     |
//! |------------|-----------------|-----------------------------|
//! | `ids`      | socket → peer id | `send_destination`          |
//! | `active`   | sockets          | `send_broadcast*`           |
//! | `handlers` | handler threads  | `stop_server` (shutdown/join) |
//!
//! Every registered socket also has a write lock, taken after `ids` or
//! `active`, so a unicast and a broadcast never write to one peer at once.
//!
//! Each handler keeps its socket in a slot shared with `stop_server`. The
//! handler empties the slot before closing, so the stopper only ever shuts
//! down handles that are still open.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::constants::{DEFAULT_BACKLOG, PACKET_SIZE};
use crate::error::{BusError, Result};
use crate::lock;
use crate::protocol::Packet;
use crate::socket::{self, RawSocket, SharedSocket, SocketOption};

/// Callback invoked on a handler thread for every packet after the handshake.
pub type ReceiveCallback = Arc<dyn Fn(Packet) + Send + Sync>;

/// Lifecycle of a [`ServerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No listener.
    Stopped,
    /// Listener being set up.
    Starting,
    /// Accepting and serving peers.
    Running,
    /// Teardown in progress.
    Stopping,
}

type SocketSlot = Arc<Mutex<Option<RawSocket>>>;
type WriteLock = Arc<Mutex<()>>;

#[derive(Debug)]
struct Handler {
    slot: SocketSlot,
    thread: JoinHandle<()>,
}

struct ServerInner {
    iface: Mutex<SharedSocket>,
    addr: Mutex<SocketAddrV4>,
    backlog: AtomicI32,
    on_receive: Mutex<Option<ReceiveCallback>>,
    running: AtomicBool,
    state: Mutex<ServerState>,
    listener: Mutex<Option<RawSocket>>,
    ids: Mutex<HashMap<RawSocket, u32>>,
    active: Mutex<Vec<RawSocket>>,
    writers: Mutex<HashMap<RawSocket, WriteLock>>,
    handlers: Mutex<Vec<Handler>>,
}

impl ServerInner {
    fn iface(&self) -> SharedSocket {
        Arc::clone(&lock(&self.iface))
    }

    fn set_state(&self, state: ServerState) {
        *lock(&self.state) = state;
    }

    fn deliver(&self, packet: Packet) {
        let callback = lock(&self.on_receive).clone();
        match callback {
            Some(callback) => callback(packet),
            None => log::debug!("[server] no receive callback, dropping {}", packet.summary()),
        }
    }

    /// Register `sock` under `id` unless the id is taken.
    fn register(&self, sock: RawSocket, id: u32) -> bool {
        {
            let mut ids = lock(&self.ids);
            if ids.values().any(|&existing| existing == id) {
                return false;
            }
            ids.insert(sock, id);
        }
        lock(&self.writers).insert(sock, WriteLock::default());
        lock(&self.active).push(sock);
        true
    }

    fn unregister(&self, sock: RawSocket) -> Option<u32> {
        let id = lock(&self.ids).remove(&sock);
        lock(&self.active).retain(|&s| s != sock);
        lock(&self.writers).remove(&sock);
        id
    }

    /// Write one packet to a registered peer under its write lock.
    fn send_to(&self, iface: &dyn socket::SocketInterface, sock: RawSocket, packet: &Packet) -> Result<()> {
        let writer = lock(&self.writers).get(&sock).map(Arc::clone);
        let _writing = writer.as_deref().map(lock);
        check_send(socket::send_packet(iface, sock, packet), sock)
    }

    fn reap_finished_handlers(&self) {
        let finished: Vec<Handler> = {
            let mut handlers = lock(&self.handlers);
            let (done, live): (Vec<Handler>, Vec<Handler>) =
                handlers.drain(..).partition(|h| h.thread.is_finished());
            *handlers = live;
            done
        };
        for handler in finished {
            if handler.thread.join().is_err() {
                log::error!("[server] peer handler panicked");
            }
        }
    }
}

/// Map a unicast/broadcast send result to the server's error contract.
fn check_send(result: io::Result<usize>, sock: RawSocket) -> Result<()> {
    match result {
        Ok(PACKET_SIZE) => Ok(()),
        Ok(0) => {
            log::warn!("[server] socket {sock}: peer gone during send");
            Err(BusError::SendFailed)
        }
        Ok(n) => {
            log::error!("[server] socket {sock}: short write ({n}/{PACKET_SIZE})");
            Err(BusError::SendFailed)
        }
        Err(e) => {
            log::error!("[server] socket {sock}: send failed: {e}");
            Err(BusError::ConnectionFailed)
        }
    }
}

/// TCP server multiplexing many bus peers.
pub struct ServerConnection {
    inner: Arc<ServerInner>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<()>,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("addr", &*lock(&self.inner.addr))
            .field("state", &self.state())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Create a stopped server that will listen on `addr`.
    pub fn new(iface: SharedSocket, addr: SocketAddrV4) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                iface: Mutex::new(iface),
                addr: Mutex::new(addr),
                backlog: AtomicI32::new(DEFAULT_BACKLOG),
                on_receive: Mutex::new(None),
                running: AtomicBool::new(false),
                state: Mutex::new(ServerState::Stopped),
                listener: Mutex::new(None),
                ids: Mutex::new(HashMap::new()),
                active: Mutex::new(Vec::new()),
                writers: Mutex::new(HashMap::new()),
                handlers: Mutex::new(Vec::new()),
            }),
            acceptor: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Change the listening port for the next start.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] for port 0.
    pub fn set_port(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(BusError::InvalidArgument("port must be non-zero"));
        }
        lock(&self.inner.addr).set_port(port);
        Ok(())
    }

    /// Listen backlog used by the next start.
    pub fn set_backlog(&self, backlog: i32) {
        self.inner.backlog.store(backlog, Ordering::SeqCst);
    }

    /// Install the callback that receives every peer packet.
    pub fn set_receive_data_callback(&self, callback: ReceiveCallback) {
        *lock(&self.inner.on_receive) = Some(callback);
    }

    /// Swap the socket backend.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] while the server is running.
    pub fn set_socket_interface(&self, iface: SharedSocket) -> Result<()> {
        if self.state() != ServerState::Stopped {
            return Err(BusError::InvalidArgument("cannot swap socket interface while running"));
        }
        *lock(&self.inner.iface) = iface;
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Open the listener and start the accept thread.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidArgument`] if the server is not stopped.
    /// - [`BusError::SocketFailed`] if the socket or its options fail.
    /// - [`BusError::BindFailed`] / [`BusError::ListenFailed`] for those steps.
    ///
    /// Any failure closes the listener and leaves the server stopped.
    pub fn start_connection(&self) -> Result<()> {
        let _guard = lock(&self.lifecycle);
        {
            let mut state = lock(&self.inner.state);
            if *state != ServerState::Stopped {
                return Err(BusError::InvalidArgument("server already started"));
            }
            *state = ServerState::Starting;
        }

        let iface = self.inner.iface();
        let addr = *lock(&self.inner.addr);
        let listener = match open_listener(iface.as_ref(), addr, self.inner.backlog.load(Ordering::SeqCst)) {
            Ok(sock) => sock,
            Err(e) => {
                self.inner.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        *lock(&self.inner.listener) = Some(listener);
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let accept_iface = Arc::clone(&iface);
        let spawned = thread::Builder::new()
            .name("bus-server-accept".to_owned())
            .spawn(move || accept_loop(&inner, &accept_iface, listener));
        match spawned {
            Ok(handle) => {
                *lock(&self.acceptor) = Some(handle);
                self.inner.set_state(ServerState::Running);
                log::info!("[server] listening on {addr}");
                Ok(())
            }
            Err(e) => {
                log::error!("[server] failed to spawn accept thread: {e}");
                self.inner.running.store(false, Ordering::SeqCst);
                lock(&self.inner.listener).take();
                if let Err(e) = iface.close(listener) {
                    log::warn!("[server] close of listener {listener} failed: {e}");
                }
                self.inner.set_state(ServerState::Stopped);
                Err(BusError::SocketFailed)
            }
        }
    }

    /// Stop accepting, disconnect every peer and join all threads.
    ///
    /// Idempotent. Must not be called from the receive callback, which runs
    /// on a handler thread this method joins.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::CloseFailed`] if closing the listener failed;
    /// teardown still completes.
    pub fn stop_server(&self) -> Result<()> {
        let _guard = lock(&self.lifecycle);
        {
            let mut state = lock(&self.inner.state);
            if *state == ServerState::Stopped {
                return Ok(());
            }
            *state = ServerState::Stopping;
        }
        log::info!("[server] stopping");

        self.inner.running.store(false, Ordering::SeqCst);
        let iface = self.inner.iface();
        let listener = lock(&self.inner.listener).take();

        if let Some(listener) = listener {
            if let Err(e) = iface.shutdown(listener) {
                log::debug!("[server] shutdown of listener {listener} failed: {e}");
            }
        }
        let acceptor = lock(&self.acceptor).take();
        if let Some(acceptor) = acceptor {
            if acceptor.join().is_err() {
                log::error!("[server] accept thread panicked");
            }
        }
        let mut result = Ok(());
        if let Some(listener) = listener {
            if let Err(e) = iface.close(listener) {
                log::error!("[server] close of listener {listener} failed: {e}");
                result = Err(BusError::CloseFailed);
            }
        }

        // No new handlers can appear once the accept thread is joined.
        let handlers: Vec<Handler> = lock(&self.inner.handlers).drain(..).collect();
        for handler in &handlers {
            let slot = lock(&handler.slot);
            if let Some(sock) = *slot {
                if let Err(e) = iface.shutdown(sock) {
                    log::debug!("[server] shutdown of peer socket {sock} failed: {e}");
                }
            }
        }
        for handler in handlers {
            // Dropped from a receive callback: that handler exits on its own.
            if handler.thread.thread().id() == thread::current().id() {
                continue;
            }
            if handler.thread.join().is_err() {
                log::error!("[server] peer handler panicked");
            }
        }

        lock(&self.inner.ids).clear();
        lock(&self.inner.active).clear();
        lock(&self.inner.writers).clear();
        self.inner.set_state(ServerState::Stopped);
        log::info!("[server] stopped");
        result
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Send `packet` to the peer registered as `packet.dest_id`.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidClientId`] if no peer has that id.
    /// - [`BusError::SendFailed`] if the peer is gone or the write was short.
    /// - [`BusError::ConnectionFailed`] if the send errored.
    pub fn send_destination(&self, packet: &Packet) -> Result<()> {
        let iface = self.inner.iface();
        let ids = lock(&self.inner.ids);
        let Some(sock) = ids
            .iter()
            .find(|(_, &id)| id == packet.dest_id)
            .map(|(&sock, _)| sock)
        else {
            log::warn!("[server] no client with id {}", packet.dest_id);
            return Err(BusError::InvalidClientId);
        };
        self.inner.send_to(iface.as_ref(), sock, packet)
    }

    /// Send `packet` to every connected peer.
    ///
    /// Stops at the first failing peer and returns its error; peers already
    /// served keep the packet.
    pub fn send_broadcast(&self, packet: &Packet) -> Result<()> {
        self.broadcast(packet, None)
    }

    /// Broadcast to every peer except the one registered as `excluded_id`.
    pub fn send_broadcast_except(&self, packet: &Packet, excluded_id: u32) -> Result<()> {
        let excluded = lock(&self.inner.ids)
            .iter()
            .find(|(_, &id)| id == excluded_id)
            .map(|(&sock, _)| sock);
        self.broadcast(packet, excluded)
    }

    fn broadcast(&self, packet: &Packet, skip: Option<RawSocket>) -> Result<()> {
        let iface = self.inner.iface();
        let active = lock(&self.inner.active);
        for &sock in active.iter().filter(|&&s| Some(s) != skip) {
            self.inner.send_to(iface.as_ref(), sock, packet)?;
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Whether `id` is free to register.
    pub fn is_valid_id(&self, id: u32) -> bool {
        !lock(&self.inner.ids).values().any(|&existing| existing == id)
    }

    /// Ids of the registered peers, ascending.
    pub fn connected_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = lock(&self.inner.ids).values().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered peers.
    pub fn client_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    /// Whether the accept loop is live.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *lock(&self.inner.state)
    }

    /// Configured listening port.
    pub fn port(&self) -> u16 {
        lock(&self.inner.addr).port()
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Err(e) = self.stop_server() {
            log::warn!("[server] stop on drop failed: {e}");
        }
    }
}

fn open_listener(iface: &dyn socket::SocketInterface, addr: SocketAddrV4, backlog: i32) -> Result<RawSocket> {
    let sock = iface.socket().map_err(|e| {
        log::error!("[server] socket creation failed: {e}");
        BusError::SocketFailed
    })?;

    let fail = |err: BusError| {
        if let Err(e) = iface.close(sock) {
            log::warn!("[server] close of listener {sock} failed: {e}");
        }
        err
    };

    for option in [SocketOption::ReuseAddr, SocketOption::ReusePort] {
        if let Err(e) = iface.setsockopt(sock, option) {
            log::error!("[server] setsockopt {option:?} failed: {e}");
            return Err(fail(BusError::SocketFailed));
        }
    }
    if let Err(e) = iface.bind(sock, addr) {
        log::error!("[server] bind {addr} failed: {e}");
        return Err(fail(BusError::BindFailed));
    }
    if let Err(e) = iface.listen(sock, backlog) {
        log::error!("[server] listen failed: {e}");
        return Err(fail(BusError::ListenFailed));
    }
    Ok(sock)
}

fn accept_loop(inner: &Arc<ServerInner>, iface: &SharedSocket, listener: RawSocket) {
    log::debug!("[server] accept thread started");
    while inner.running.load(Ordering::SeqCst) {
        let (sock, peer) = match iface.accept(listener) {
            Ok(accepted) => accepted,
            Err(_) if !inner.running.load(Ordering::SeqCst) => break,
            Err(e) if socket::is_transient(&e) || e.kind() == io::ErrorKind::ConnectionAborted => {
                log::debug!("[server] transient accept error: {e}");
                continue;
            }
            Err(e) => {
                log::error!("[server] ACCEPT_FAILED: {e}");
                break;
            }
        };

        if !inner.running.load(Ordering::SeqCst) {
            if let Err(e) = iface.close(sock) {
                log::warn!("[server] close of late peer {sock} failed: {e}");
            }
            break;
        }

        log::info!("[server] accepted {peer} on socket {sock}");
        inner.reap_finished_handlers();

        let slot: SocketSlot = Arc::new(Mutex::new(Some(sock)));
        let handler_inner = Arc::clone(inner);
        let handler_iface = Arc::clone(iface);
        let handler_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("bus-server-peer-{sock}"))
            .spawn(move || handle_peer(&handler_inner, &handler_iface, &handler_slot, sock));
        match spawned {
            Ok(thread) => lock(&inner.handlers).push(Handler { slot, thread }),
            Err(e) => {
                log::error!("[server] failed to spawn handler for socket {sock}: {e}");
                release(iface.as_ref(), &slot);
            }
        }
    }
    log::debug!("[server] accept thread exiting");
}

fn handle_peer(inner: &ServerInner, iface: &SharedSocket, slot: &SocketSlot, sock: RawSocket) {
    let id = loop {
        match socket::recv_packet(iface.as_ref(), sock) {
            Ok(Some(handshake)) => break handshake.src_id,
            Ok(None) => {
                log::info!("[server] socket {sock} closed before handshake");
                release(iface.as_ref(), slot);
                return;
            }
            Err(e) if socket::is_transient(&e) => {
                log::debug!("[server] socket {sock}: transient error awaiting handshake: {e}");
            }
            Err(e) => {
                log::warn!("[server] socket {sock}: handshake failed: {e}");
                release(iface.as_ref(), slot);
                return;
            }
        }
    };

    if !inner.register(sock, id) {
        log::warn!("[server] id {id} already connected, rejecting socket {sock}");
        release(iface.as_ref(), slot);
        return;
    }
    log::info!("[server] client {id} registered on socket {sock}");

    loop {
        match socket::recv_packet(iface.as_ref(), sock) {
            Ok(Some(packet)) => inner.deliver(packet),
            Ok(None) => {
                log::info!("[server] client {id} disconnected");
                break;
            }
            Err(e) if socket::is_transient(&e) => {
                log::debug!("[server] client {id}: transient receive error: {e}");
            }
            Err(e) => {
                log::warn!("[server] client {id}: receive failed: {e}");
                break;
            }
        }
    }

    inner.unregister(sock);
    release(iface.as_ref(), slot);
}

/// Empty the slot and close whatever was in it.
fn release(iface: &dyn socket::SocketInterface, slot: &SocketSlot) {
    let sock = lock(slot).take();
    if let Some(sock) = sock {
        if let Err(e) = iface.close(sock) {
            log::warn!("[server] close of socket {sock} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::socket::mock::{wait_until, SocketCall, SocketOp};
    use crate::socket::MockSocket;
    use crate::socket::SocketInterface;

    // Handles from a fresh mock: the listener is 3, peers follow.
    const LISTENER: RawSocket = 3;
    const WAIT: Duration = Duration::from_secs(2);

    fn server(mock: &Arc<MockSocket>) -> ServerConnection {
        ServerConnection::new(
            Arc::clone(mock) as SharedSocket,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 50_000),
        )
    }

    /// Connect a peer that announces `id`; waits until it is registered.
    fn join_peer(mock: &MockSocket, server: &ServerConnection, id: u32) -> RawSocket {
        let before = server.client_count();
        let sock = mock.connect_peer();
        mock.push_packet(sock, &Packet::handshake(id));
        assert!(wait_until(WAIT, || server.client_count() == before + 1));
        sock
    }

    #[test]
    fn test_unicast_reaches_registered_peer() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        let five = join_peer(&mock, &server, 5);
        let eight = join_peer(&mock, &server, 8);
        assert_eq!(server.connected_ids(), vec![5, 8]);

        let packet = Packet::new(5, 8, 0, 1, b"hello", false).unwrap();
        server.send_destination(&packet).unwrap();
        assert_eq!(mock.sent_packets(eight), vec![packet]);
        assert!(mock.sent_packets(five).is_empty());

        let stray = Packet::new(5, 999, 0, 1, b"nobody", false).unwrap();
        assert_eq!(server.send_destination(&stray), Err(BusError::InvalidClientId));
        server.stop_server().unwrap();
    }

    #[test]
    fn test_send_error_maps_to_connection_failed() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        let peer = join_peer(&mock, &server, 2);
        let packet = Packet::new(1, 2, 0, 1, b"x", false).unwrap();

        assert_eq!(server.send_destination(&packet), Ok(()));
        mock.script_send(peer, Err(io::ErrorKind::BrokenPipe));
        assert_eq!(server.send_destination(&packet), Err(BusError::ConnectionFailed));
        mock.script_send(peer, Ok(0));
        assert_eq!(server.send_destination(&packet), Err(BusError::SendFailed));
    }

    #[test]
    fn test_bind_failure_closes_listener() {
        let mock = MockSocket::new();
        mock.fail_next(SocketOp::Bind, io::ErrorKind::AddrInUse);
        let server = server(&mock);

        assert_eq!(server.start_connection(), Err(BusError::BindFailed));
        assert_eq!(mock.close_count(LISTENER), 1);
        assert!(!server.is_running());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_setup_failures_map_to_their_errors() {
        let mock = MockSocket::new();
        let server = server(&mock);

        mock.fail_next(SocketOp::Socket, io::ErrorKind::Other);
        assert_eq!(server.start_connection(), Err(BusError::SocketFailed));

        mock.fail_next(SocketOp::SetSockOpt, io::ErrorKind::Other);
        assert_eq!(server.start_connection(), Err(BusError::SocketFailed));

        mock.fail_next(SocketOp::Listen, io::ErrorKind::Other);
        assert_eq!(server.start_connection(), Err(BusError::ListenFailed));

        assert_eq!(mock.count(SocketOp::Close), 2);
        server.start_connection().unwrap();
        assert!(server.is_running());
    }

    #[test]
    fn test_packets_after_handshake_reach_callback() {
        let mock = MockSocket::new();
        let server = server(&mock);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        server.set_receive_data_callback(Arc::new(move |p| {
            let _ = lock(&tx).send(p);
        }));
        server.start_connection().unwrap();
        let peer = join_peer(&mock, &server, 5);

        let packet = Packet::new(5, 8, 0, 1, b"relay", false).unwrap();
        mock.push_packet(peer, &packet);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), packet);
    }

    #[test]
    fn test_disconnect_cleans_registry() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        let five = join_peer(&mock, &server, 5);
        join_peer(&mock, &server, 8);

        mock.push_eof(five);
        assert!(wait_until(WAIT, || server.client_count() == 1));
        assert_eq!(server.connected_ids(), vec![8]);
        assert!(server.is_valid_id(5));
        assert!(wait_until(WAIT, || mock.is_closed(five)));

        let packet = Packet::new(8, 5, 0, 1, b"gone", false).unwrap();
        assert_eq!(server.send_destination(&packet), Err(BusError::InvalidClientId));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        let first = join_peer(&mock, &server, 4);

        let second = mock.connect_peer();
        mock.push_packet(second, &Packet::handshake(4));
        assert!(wait_until(WAIT, || mock.is_closed(second)));
        assert_eq!(server.client_count(), 1);
        assert!(!mock.is_closed(first));
    }

    #[test]
    fn test_broadcast_and_exclusion() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        let one = join_peer(&mock, &server, 1);
        let two = join_peer(&mock, &server, 2);
        let three = join_peer(&mock, &server, 3);

        let packet = Packet::new(1, 0, 0, 1, b"all", true).unwrap();
        server.send_broadcast(&packet).unwrap();
        for sock in [one, two, three] {
            assert_eq!(mock.sent_packets(sock), vec![packet]);
        }

        server.send_broadcast_except(&packet, 1).unwrap();
        assert_eq!(mock.sent_packets(one).len(), 1);
        assert_eq!(mock.sent_packets(two).len(), 2);
        assert_eq!(mock.sent_packets(three).len(), 2);
    }

    #[test]
    fn test_transient_error_before_handshake_is_retried() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();

        let peer = mock.connect_peer();
        mock.push_recv_error(peer, io::ErrorKind::Interrupted);
        mock.push_packet(peer, &Packet::handshake(6));

        assert!(wait_until(WAIT, || server.connected_ids() == vec![6]));
        assert!(!mock.is_closed(peer));
        server.stop_server().unwrap();
    }

    #[test]
    fn test_unicast_and_broadcast_take_turns_on_one_peer() {
        let mock = MockSocket::new();
        let server = Arc::new(server(&mock));
        server.start_connection().unwrap();
        join_peer(&mock, &server, 5);
        let eight = join_peer(&mock, &server, 8);
        let sends_to_eight = || {
            mock.calls()
                .iter()
                .filter(|c| matches!(c, SocketCall::Send(s, _) if *s == eight))
                .count()
        };
        mock.stall_send(eight);

        let unicast = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.send_destination(&Packet::new(5, 8, 0, 1, b"one", false).unwrap()))
        };
        assert!(wait_until(WAIT, || sends_to_eight() == 1));

        let broadcast = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.send_broadcast(&Packet::new(5, 0, 0, 1, b"all", true).unwrap()))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sends_to_eight(), 1);

        mock.shutdown(eight).unwrap();
        assert_eq!(unicast.join().unwrap(), Err(BusError::ConnectionFailed));
        assert_eq!(broadcast.join().unwrap(), Err(BusError::ConnectionFailed));
        assert_eq!(sends_to_eight(), 2);
        server.stop_server().unwrap();
    }

    #[test]
    fn test_broadcast_stops_at_first_failure() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        let one = join_peer(&mock, &server, 1);
        let two = join_peer(&mock, &server, 2);
        let three = join_peer(&mock, &server, 3);
        mock.script_send(two, Err(io::ErrorKind::ConnectionReset));

        let packet = Packet::new(1, 0, 0, 1, b"all", true).unwrap();
        assert_eq!(server.send_broadcast(&packet), Err(BusError::ConnectionFailed));
        assert_eq!(mock.sent_packets(one).len(), 1);
        assert!(mock.sent_packets(three).is_empty());
    }

    #[test]
    fn test_stop_is_idempotent_and_closes_everything() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        let a = join_peer(&mock, &server, 10);
        let b = join_peer(&mock, &server, 11);

        server.stop_server().unwrap();
        server.stop_server().unwrap();
        drop(server);

        assert_eq!(mock.close_count(LISTENER), 1);
        assert_eq!(mock.close_count(a), 1);
        assert_eq!(mock.close_count(b), 1);
    }

    #[test]
    fn test_restart_after_stop() {
        let mock = MockSocket::new();
        let server = server(&mock);
        server.start_connection().unwrap();
        server.stop_server().unwrap();
        assert_eq!(server.client_count(), 0);

        server.start_connection().unwrap();
        assert_eq!(server.state(), ServerState::Running);
    }

    #[test]
    fn test_argument_validation() {
        let mock = MockSocket::new();
        let server = server(&mock);

        assert!(matches!(server.set_port(0), Err(BusError::InvalidArgument(_))));
        server.set_port(50_001).unwrap();
        assert_eq!(server.port(), 50_001);

        server.start_connection().unwrap();
        assert!(matches!(server.start_connection(), Err(BusError::InvalidArgument(_))));
        let other: SharedSocket = MockSocket::new();
        assert!(matches!(
            server.set_socket_interface(other),
            Err(BusError::InvalidArgument(_))
        ));
    }
}
