//! Outbound bus connection with a background receive thread.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──connect_to_server(id)──► Connecting ──socket/connect/handshake──► Connected
//!                                       │ any step fails                      │
//!                                       ▼                                     │ peer closes,
//!                                  Disconnected ◄──close_connection()─────────┘ fatal recv error,
//!                                                                               send returns 0
//! ```
//!
//! While connected, a thread named `bus-client-rx` reads whole packets and
//! hands each one to the packet callback. The callback runs on that thread.
//!
//! The connected socket lives in a single slot. Whoever takes it out of the
//! slot closes it: `close_connection` when called from another thread, the
//! receive thread itself when the peer goes away first.
//!
//! Writers hold a send lock, never the state lock, while blocked in `send`.
//! `close_connection` shuts the socket down first (which fails any stalled
//! `send`), then takes the send lock before `close`, so no write can land on
//! a released handle.

// Rust guideline compliant 2026-02

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::constants::PACKET_SIZE;
use crate::error::{BusError, Result};
use crate::lock;
use crate::protocol::Packet;
use crate::socket::{self, RawSocket, SharedSocket};

/// Callback invoked on the receive thread for every packet.
pub type PacketCallback = Arc<dyn Fn(Packet) + Send + Sync>;

/// Connection state of a [`ClientConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket is open.
    Disconnected,
    /// `connect_to_server` is in progress.
    Connecting,
    /// Handshake sent; the receive thread is running.
    Connected,
}

#[derive(Debug)]
struct ClientState {
    status: ConnectionState,
    sock: Option<RawSocket>,
    local_id: Option<u32>,
}

struct Inner {
    iface: SharedSocket,
    server: SocketAddrV4,
    on_packet: PacketCallback,
    state: Mutex<ClientState>,
    send_lock: Mutex<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }

    /// Close `sock` once no writer is inside `send`.
    fn close_after_writers(&self, sock: RawSocket) -> std::io::Result<()> {
        let _writers = lock(&self.send_lock);
        self.iface.close(sock)
    }

    fn close_quietly(&self, sock: RawSocket) {
        if let Err(e) = self.iface.close(sock) {
            log::warn!("[client] close of socket {sock} failed: {e}");
        }
    }
}

/// One TCP connection to the bus server.
pub struct ClientConnection {
    inner: Arc<Inner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("ClientConnection")
            .field("server", &self.inner.server)
            .field("status", &state.status)
            .field("local_id", &state.local_id)
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Create a disconnected client for `server`.
    ///
    /// `on_packet` receives every packet read from the server after the
    /// connection is up.
    pub fn new(iface: SharedSocket, server: SocketAddrV4, on_packet: PacketCallback) -> Self {
        Self {
            inner: Arc::new(Inner {
                iface,
                server,
                on_packet,
                state: Mutex::new(ClientState {
                    status: ConnectionState::Disconnected,
                    sock: None,
                    local_id: None,
                }),
                send_lock: Mutex::new(()),
            }),
            receiver: Mutex::new(None),
        }
    }

    /// Connect, announce `id` with a handshake packet and start receiving.
    ///
    /// # Errors
    ///
    /// - [`BusError::ConnectionFailed`] if already connected (or connecting),
    ///   or if `connect` is refused.
    /// - [`BusError::SocketFailed`] if no socket could be created.
    /// - [`BusError::SendFailed`] if the handshake was not fully written.
    ///
    /// On every failure the socket is closed and the state returns to
    /// [`ConnectionState::Disconnected`].
    pub fn connect_to_server(&self, id: u32) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.status != ConnectionState::Disconnected {
                log::warn!("[client] connect_to_server({id}) while {:?}", state.status);
                return Err(BusError::ConnectionFailed);
            }
            state.status = ConnectionState::Connecting;
        }

        let result = self.establish(id);
        if result.is_err() {
            self.inner.state().status = ConnectionState::Disconnected;
        }
        result
    }

    fn establish(&self, id: u32) -> Result<()> {
        if self.on_receive_thread() {
            log::error!("[client] cannot reconnect from the receive thread");
            return Err(BusError::ConnectionFailed);
        }
        // A receive thread that exited on its own still needs joining.
        self.join_receiver();

        let iface = &self.inner.iface;
        let sock = iface.socket().map_err(|e| {
            log::error!("[client] socket creation failed: {e}");
            BusError::SocketFailed
        })?;

        if let Err(e) = iface.connect(sock, self.inner.server) {
            log::error!("[client] connect to {} failed: {e}", self.inner.server);
            self.inner.close_quietly(sock);
            return Err(BusError::ConnectionFailed);
        }

        match socket::send_packet(iface.as_ref(), sock, &Packet::handshake(id)) {
            Ok(PACKET_SIZE) => {}
            Ok(n) => {
                log::error!("[client] handshake short write ({n}/{PACKET_SIZE})");
                self.inner.close_quietly(sock);
                return Err(BusError::SendFailed);
            }
            Err(e) => {
                log::error!("[client] handshake send failed: {e}");
                self.inner.close_quietly(sock);
                return Err(BusError::SendFailed);
            }
        }

        {
            let mut state = self.inner.state();
            state.status = ConnectionState::Connected;
            state.sock = Some(sock);
            state.local_id = Some(id);
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("bus-client-rx".to_owned())
            .spawn(move || receive_loop(&inner, sock));
        match spawned {
            Ok(handle) => {
                *lock(&self.receiver) = Some(handle);
                log::info!("[client] connected to {} as id {id}", self.inner.server);
                Ok(())
            }
            Err(e) => {
                log::error!("[client] failed to spawn receive thread: {e}");
                let mut state = self.inner.state();
                state.sock = None;
                drop(state);
                self.inner.close_quietly(sock);
                Err(BusError::ReceiveFailed)
            }
        }
    }

    /// Write one packet to the server.
    ///
    /// # Errors
    ///
    /// - [`BusError::ConnectionFailed`] if not connected (the socket is not
    ///   touched), or if the server has gone away (`send` wrote 0 bytes); in
    ///   the latter case the connection is closed.
    /// - [`BusError::SendFailed`] on a send error or short write; the
    ///   connection stays open.
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        let writer = lock(&self.inner.send_lock);
        let sock = {
            let state = self.inner.state();
            let (ConnectionState::Connected, Some(sock)) = (state.status, state.sock) else {
                log::debug!("[client] send_packet while {:?}", state.status);
                return Err(BusError::ConnectionFailed);
            };
            sock
        };

        let sent = socket::send_packet(self.inner.iface.as_ref(), sock, packet);
        drop(writer);
        match sent {
            Ok(PACKET_SIZE) => Ok(()),
            Ok(0) => {
                log::warn!("[client] server went away, closing connection");
                if let Err(e) = self.close_connection() {
                    log::warn!("[client] close after lost server failed: {e}");
                }
                Err(BusError::ConnectionFailed)
            }
            Ok(n) => {
                log::error!("[client] short write ({n}/{PACKET_SIZE})");
                Err(BusError::SendFailed)
            }
            Err(e) => {
                log::error!("[client] send failed: {e}");
                Err(BusError::SendFailed)
            }
        }
    }

    /// Close the connection and wait for the receive thread.
    ///
    /// Idempotent. Safe to call from the packet callback: the socket is then
    /// shut down and the receive thread closes it on its way out.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::CloseFailed`] if `close` on the socket failed.
    pub fn close_connection(&self) -> Result<()> {
        let on_receiver = self.on_receive_thread();
        let sock = {
            let mut state = self.inner.state();
            state.status = ConnectionState::Disconnected;
            if on_receiver {
                state.sock
            } else {
                state.sock.take()
            }
        };

        let Some(sock) = sock else {
            if !on_receiver {
                self.join_receiver();
            }
            return Ok(());
        };

        if let Err(e) = self.inner.iface.shutdown(sock) {
            log::debug!("[client] shutdown of socket {sock} failed: {e}");
        }
        if on_receiver {
            return Ok(());
        }
        self.join_receiver();

        self.inner.close_after_writers(sock).map_err(|e| {
            log::error!("[client] close of socket {sock} failed: {e}");
            BusError::CloseFailed
        })?;
        log::info!("[client] disconnected from {}", self.inner.server);
        Ok(())
    }

    /// Whether the connection is up.
    pub fn is_connected(&self) -> bool {
        self.inner.state().status == ConnectionState::Connected
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state().status
    }

    /// Id announced by the last successful handshake.
    pub fn local_id(&self) -> Option<u32> {
        self.inner.state().local_id
    }

    /// Server address this client connects to.
    pub fn server(&self) -> SocketAddrV4 {
        self.inner.server
    }

    fn on_receive_thread(&self) -> bool {
        lock(&self.receiver)
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    fn join_receiver(&self) {
        let handle = lock(&self.receiver).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[client] receive thread panicked");
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close_connection() {
            log::warn!("[client] close on drop failed: {e}");
        }
    }
}

fn receive_loop(inner: &Inner, sock: RawSocket) {
    log::debug!("[client] receive thread started on socket {sock}");
    loop {
        match socket::recv_packet(inner.iface.as_ref(), sock) {
            Ok(Some(packet)) => (inner.on_packet)(packet),
            Ok(None) => {
                log::info!("[client] server closed the connection");
                break;
            }
            Err(e) if socket::is_transient(&e) => {
                log::debug!("[client] transient receive error: {e}");
            }
            Err(e) => {
                log::warn!("[client] receive failed: {e}");
                break;
            }
        }
    }

    // Still ours unless close_connection took it.
    let owned = {
        let mut state = inner.state();
        if state.sock == Some(sock) {
            state.sock = None;
            state.status = ConnectionState::Disconnected;
            true
        } else {
            false
        }
    };
    if owned {
        if let Err(e) = inner.iface.shutdown(sock) {
            log::debug!("[client] shutdown of socket {sock} failed: {e}");
        }
        if let Err(e) = inner.close_after_writers(sock) {
            log::warn!("[client] close of socket {sock} failed: {e}");
        }
    }
    log::debug!("[client] receive thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::socket::mock::{wait_until, SocketOp};
    use crate::socket::MockSocket;

    // A fresh mock hands out handle 3 first.
    const SOCK: RawSocket = 3;

    fn server() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 50_000)
    }

    fn client(mock: &Arc<MockSocket>) -> (ClientConnection, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let iface: SharedSocket = Arc::clone(mock) as SharedSocket;
        let conn = ClientConnection::new(
            iface,
            server(),
            Arc::new(move |p| {
                let _ = lock(&tx).send(p);
            }),
        );
        (conn, rx)
    }

    #[test]
    fn test_connect_sends_handshake() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);

        conn.connect_to_server(7).unwrap();

        assert!(conn.is_connected());
        assert_eq!(conn.local_id(), Some(7));
        assert_eq!(mock.sent_packets(SOCK), vec![Packet::handshake(7)]);
        conn.close_connection().unwrap();
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();

        assert_eq!(conn.connect_to_server(1), Err(BusError::ConnectionFailed));
        assert_eq!(mock.count(SocketOp::Socket), 1);
    }

    #[test]
    fn test_socket_failure() {
        let mock = MockSocket::new();
        mock.fail_next(SocketOp::Socket, io::ErrorKind::Other);
        let (conn, _rx) = client(&mock);

        assert_eq!(conn.connect_to_server(1), Err(BusError::SocketFailed));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_refused_connect_closes_socket() {
        let mock = MockSocket::new();
        mock.fail_next(SocketOp::Connect, io::ErrorKind::ConnectionRefused);
        let (conn, _rx) = client(&mock);

        assert_eq!(conn.connect_to_server(1), Err(BusError::ConnectionFailed));
        assert_eq!(mock.close_count(SOCK), 1);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_short_handshake_closes_socket() {
        let mock = MockSocket::new();
        mock.script_send(SOCK, Ok(10));
        let (conn, _rx) = client(&mock);

        assert_eq!(conn.connect_to_server(1), Err(BusError::SendFailed));
        assert_eq!(mock.close_count(SOCK), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_send_without_connection_does_not_touch_socket() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);

        let packet = Packet::new(1, 2, 0, 1, b"x", false).unwrap();
        assert_eq!(conn.send_packet(&packet), Err(BusError::ConnectionFailed));
        assert_eq!(mock.count(SocketOp::Send), 0);
    }

    #[test]
    fn test_lost_server_on_send_closes_connection() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();
        let packet = Packet::new(1, 2, 0, 1, b"data", false).unwrap();

        assert_eq!(conn.send_packet(&packet), Ok(()));
        mock.script_send(SOCK, Ok(0));
        assert_eq!(conn.send_packet(&packet), Err(BusError::ConnectionFailed));
        assert!(!conn.is_connected());
        assert_eq!(mock.close_count(SOCK), 1);
    }

    #[test]
    fn test_send_error_keeps_connection() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();
        mock.script_send(SOCK, Err(io::ErrorKind::WouldBlock));

        let packet = Packet::new(1, 2, 0, 1, b"data", false).unwrap();
        assert_eq!(conn.send_packet(&packet), Err(BusError::SendFailed));
        assert!(conn.is_connected());
        assert_eq!(conn.send_packet(&packet), Ok(()));
    }

    #[test]
    fn test_received_packets_reach_callback() {
        let mock = MockSocket::new();
        let (conn, rx) = client(&mock);
        conn.connect_to_server(8).unwrap();

        let packet = Packet::new(5, 8, 0, 1, b"hi", false).unwrap();
        mock.push_recv_error(SOCK, io::ErrorKind::Interrupted);
        mock.push_packet(SOCK, &packet);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), packet);
        assert!(conn.is_connected());
    }

    #[test]
    fn test_peer_close_disconnects_and_closes_once() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();

        mock.push_eof(SOCK);
        assert!(wait_until(Duration::from_secs(2), || mock.is_closed(SOCK)));
        assert!(!conn.is_connected());

        conn.close_connection().unwrap();
        assert_eq!(mock.close_count(SOCK), 1);
    }

    #[test]
    fn test_fatal_receive_error_disconnects() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();

        mock.push_recv_error(SOCK, io::ErrorKind::ConnectionReset);
        assert!(wait_until(Duration::from_secs(2), || !conn.is_connected()));
        assert!(wait_until(Duration::from_secs(2), || mock.is_closed(SOCK)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();

        conn.close_connection().unwrap();
        conn.close_connection().unwrap();
        drop(conn);

        assert_eq!(mock.count(SocketOp::Shutdown), 1);
        assert_eq!(mock.close_count(SOCK), 1);
    }

    #[test]
    fn test_reconnect_after_close() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();
        conn.close_connection().unwrap();

        conn.connect_to_server(1).unwrap();
        assert!(conn.is_connected());
        assert_eq!(mock.count(SocketOp::Socket), 2);
    }

    #[test]
    fn test_close_failure_is_reported() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        conn.connect_to_server(1).unwrap();
        mock.fail_next(SocketOp::Close, io::ErrorKind::Other);

        assert_eq!(conn.close_connection(), Err(BusError::CloseFailed));
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_close_interrupts_stalled_send() {
        let mock = MockSocket::new();
        let (conn, _rx) = client(&mock);
        let conn = Arc::new(conn);
        conn.connect_to_server(1).unwrap();
        mock.stall_send(SOCK);

        let writer = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.send_packet(&Packet::new(1, 2, 0, 1, b"stuck", false).unwrap()))
        };
        assert!(wait_until(Duration::from_secs(2), || mock.count(SocketOp::Send) == 2));
        assert!(conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Connected);

        let (done_tx, done) = mpsc::channel();
        let closer = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                let _ = done_tx.send(conn.close_connection());
            })
        };
        assert_eq!(done.recv_timeout(Duration::from_secs(2)), Ok(Ok(())));
        closer.join().unwrap();

        assert_eq!(writer.join().unwrap(), Err(BusError::SendFailed));
        assert!(!conn.is_connected());
        assert_eq!(mock.close_count(SOCK), 1);
    }

    #[test]
    fn test_close_from_callback_does_not_deadlock() {
        let mock = MockSocket::new();
        let slot: Arc<Mutex<Option<Arc<ClientConnection>>>> = Arc::new(Mutex::new(None));
        let callback_slot = Arc::clone(&slot);
        let iface: SharedSocket = Arc::clone(&mock) as SharedSocket;
        let conn = Arc::new(ClientConnection::new(
            iface,
            server(),
            Arc::new(move |_| {
                let conn = lock(&callback_slot).clone();
                if let Some(conn) = conn {
                    conn.close_connection().unwrap();
                }
            }),
        ));
        *lock(&slot) = Some(Arc::clone(&conn));
        conn.connect_to_server(1).unwrap();

        mock.push_packet(SOCK, &Packet::new(2, 1, 0, 1, b"bye", false).unwrap());
        assert!(wait_until(Duration::from_secs(2), || mock.is_closed(SOCK)));
        assert!(!conn.is_connected());
        assert_eq!(mock.close_count(SOCK), 1);

        lock(&slot).take();
    }
}
