//! Bus relay: one server that forwards every packet to its addressees.
//!
//! ```text
//! peer A ──► handler thread ──► BusManager::receive_data
//!                                   │ check_collision
//!                                   ▼
//!                              send_to_clients ──broadcast──► every peer (minus A unless echoing)
//!                                               └─unicast───► peer registered as dest_id
//! ```
//!
//! A process normally runs a single relay, reachable through
//! [`BusManager::instance`]. [`BusManager::new`] builds an independent one.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::config::BusConfig;
use crate::error::Result;
use crate::lock;
use crate::protocol::Packet;
use crate::server::ServerConnection;
use crate::socket::{OsSocket, SharedSocket};

/// Poll interval of [`BusManager::run_until`].
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

static INSTANCE: Mutex<Option<Arc<BusManager>>> = Mutex::new(None);

/// Star-topology relay owning one [`ServerConnection`].
#[derive(Debug)]
pub struct BusManager {
    server: ServerConnection,
    echo_broadcast: bool,
}

impl BusManager {
    /// Build a relay for `config` on top of `iface`. The server is not started.
    pub fn new(config: &BusConfig, iface: SharedSocket) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let server = ServerConnection::new(iface, config.server_addr());
            server.set_backlog(config.backlog);

            let relay = Weak::clone(weak);
            server.set_receive_data_callback(Arc::new(move |packet| {
                if let Some(bus) = relay.upgrade() {
                    bus.receive_data(packet);
                }
            }));

            Self {
                server,
                echo_broadcast: config.echo_broadcast,
            }
        })
    }

    /// The process-wide relay, created on first use with OS sockets.
    ///
    /// `config` only matters for the call that creates the instance.
    pub fn instance(config: &BusConfig) -> Arc<Self> {
        let mut slot = lock(&INSTANCE);
        let bus = slot.get_or_insert_with(|| {
            log::debug!("[bus] creating process-wide relay on {}", config.server_addr());
            Self::new(config, Arc::new(OsSocket::new()))
        });
        Arc::clone(bus)
    }

    /// Forget the process-wide relay; the next `instance` call builds a new one.
    pub fn release_instance() -> Option<Arc<Self>> {
        lock(&INSTANCE).take()
    }

    /// Start listening.
    pub fn start(&self) -> Result<()> {
        self.server.start_connection()?;
        log::info!("[bus] relay running on port {}", self.server.port());
        Ok(())
    }

    /// Stop the server and disconnect every peer.
    pub fn stop(&self) -> Result<()> {
        self.server.stop_server()?;
        log::info!("[bus] relay stopped");
        Ok(())
    }

    /// Block until `shutdown` is raised, then stop.
    ///
    /// Meant for a flag registered with `signal_hook::flag::register`.
    pub fn run_until(&self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(RUN_POLL_INTERVAL);
        }
        log::info!("[bus] shutdown requested");
        self.stop()
    }

    /// Entry point for every packet a peer sends.
    pub fn receive_data(&self, packet: Packet) {
        let packet = self.check_collision(packet);
        if let Err(e) = self.send_to_clients(&packet) {
            log::warn!("[bus] failed to relay {}: {e}", packet.summary());
        }
    }

    /// Arbitration hook; currently lets every packet through.
    pub fn check_collision(&self, packet: Packet) -> Packet {
        packet
    }

    /// Pick the winner of two contending packets: lower `src_id`, ties keep `a`.
    pub fn packet_priority(a: Packet, b: Packet) -> Packet {
        if b.src_id < a.src_id {
            b
        } else {
            a
        }
    }

    /// Forward `packet` to its addressees.
    pub fn send_to_clients(&self, packet: &Packet) -> Result<()> {
        if packet.is_broadcast {
            if self.echo_broadcast {
                self.server.send_broadcast(packet)
            } else {
                self.server.send_broadcast_except(packet, packet.src_id)
            }
        } else {
            self.server.send_destination(packet)
        }
    }

    /// The underlying server.
    pub fn server(&self) -> &ServerConnection {
        &self.server
    }
}
