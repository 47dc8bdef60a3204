//! Packet bus - fragmenting message transport over TCP.
//!
//! Payloads are cut into fixed-size packets, carried over blocking TCP
//! sockets to a central relay, and reassembled at the addressed endpoint.
//!
//! # Architecture
//!
//! ```text
//! Communication ──► ClientConnection ══ TCP ══► ServerConnection ──► BusManager
//!   (endpoint)        (one socket)                 (per-peer threads)    (relay)
//!        ▲                                                                 │
//!        └────────────── ClientConnection ◄══ TCP ═══ send_destination ◄───┘
//!                                                      / send_broadcast
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - Packet wire format, message split/reassembly
//! - [`socket`] - Socket capability trait with OS and mock backends
//! - [`client`] - Outbound connection and receive thread
//! - [`server`] - Listener, per-peer handlers, id registry
//! - [`bus`] - Relay forwarding packets between peers
//! - [`communication`] - Addressed endpoint with CRC gate and ACK mode
//! - [`config`] - Configuration loading with env overrides

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bus;
pub mod client;
pub mod communication;
pub mod config;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod server;
pub mod socket;

// Re-export commonly used types
pub use bus::BusManager;
pub use client::{ClientConnection, ConnectionState};
pub use communication::Communication;
pub use config::BusConfig;
pub use error::{BusError, Result};
pub use protocol::{AckStatus, Message, Packet};
pub use server::{ServerConnection, ServerState};
pub use socket::{MockSocket, OsSocket, SocketInterface};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Registry state stays consistent across a panicking callback, so the bus
/// keeps serving the remaining peers.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
