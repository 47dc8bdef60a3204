//! Peer-addressed endpoint on top of a [`ClientConnection`].
//!
//! Outbound, a payload is split into a [`Message`] and its packets are
//! written back to back. Inbound, every packet from the receive thread goes
//! through a gate before reassembly:
//!
//! 1. **Addressing**: kept only if `dest_id` is the local id or the packet is
//!    a broadcast.
//! 2. **Acknowledgements**: RTR packets carry `ACK` / `NACK` and go to the
//!    ack callback instead of reassembly.
//! 3. **CRC**: a payload that fails its checksum is dropped (and NACKed when
//!    ACK mode is on).
//! 4. **Reassembly**: complete messages go to the data callback as
//!    `(src_id, bytes)`; in ACK mode a completed unicast is answered with
//!    `ACK`.
//!
//! Callbacks run on the client's receive thread.

// Rust guideline compliant 2026-02

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::client::ClientConnection;
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::lock;
use crate::protocol::{AckStatus, Message, Packet, Reassembler};
use crate::socket::SharedSocket;

/// Receives each completed message as `(src_id, payload)`.
pub type DataCallback = Arc<dyn Fn(u32, Vec<u8>) + Send + Sync>;

/// Receives acknowledgements as `(src_id, status)`.
pub type AckCallback = Arc<dyn Fn(u32, AckStatus) + Send + Sync>;

/// A bus endpoint identified by `local_id`.
pub struct Communication {
    local_id: u32,
    client: ClientConnection,
    reassembler: Mutex<Reassembler>,
    on_data: DataCallback,
    on_ack: Mutex<Option<AckCallback>>,
    send_lock: Mutex<()>,
    ack_enabled: bool,
    max_message_size: usize,
}

impl fmt::Debug for Communication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communication")
            .field("local_id", &self.local_id)
            .field("client", &self.client)
            .field("ack_enabled", &self.ack_enabled)
            .finish_non_exhaustive()
    }
}

impl Communication {
    /// Create an endpoint that will connect to `config.server_addr()`.
    pub fn new(config: &BusConfig, iface: SharedSocket, local_id: u32, on_data: DataCallback) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let endpoint = Weak::clone(weak);
            let client = ClientConnection::new(
                iface,
                config.server_addr(),
                Arc::new(move |packet| {
                    if let Some(endpoint) = endpoint.upgrade() {
                        endpoint.receive_packet(packet);
                    }
                }),
            );
            Self {
                local_id,
                client,
                reassembler: Mutex::new(Reassembler::new(
                    config.reassembly_timeout(),
                    Reassembler::max_tps_for(config.max_message_size),
                )),
                on_data,
                on_ack: Mutex::new(None),
                send_lock: Mutex::new(()),
                ack_enabled: config.ack_enabled,
                max_message_size: config.max_message_size,
            }
        })
    }

    /// Connect and announce `local_id`.
    pub fn start_connection(&self) -> Result<()> {
        self.client.connect_to_server(self.local_id)
    }

    /// Split `data` and send it to `dest_id` (or everyone when `broadcast`).
    ///
    /// Packets of concurrent calls never interleave.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidDataSize`] if `data` exceeds the configured
    /// maximum; otherwise the first packet error, which aborts the message.
    pub fn send_message(&self, data: &[u8], dest_id: u32, broadcast: bool) -> Result<()> {
        if data.len() > self.max_message_size {
            log::warn!(
                "[comm] refusing {} byte message (limit {})",
                data.len(),
                self.max_message_size
            );
            return Err(BusError::InvalidDataSize);
        }
        let message = Message::split(self.local_id, data, broadcast, dest_id)?;

        let _guard = lock(&self.send_lock);
        for packet in message.packets() {
            self.client.send_packet(packet).inspect_err(|e| {
                log::warn!("[comm] message to {dest_id} aborted at psn {}: {e}", packet.psn);
            })?;
        }
        log::debug!(
            "[comm] sent {} bytes to {} in {} packet(s)",
            data.len(),
            if broadcast { "everyone".to_owned() } else { dest_id.to_string() },
            message.total_packet_sum()
        );
        Ok(())
    }

    /// Run [`send_message`](Self::send_message) on a separate thread.
    ///
    /// `on_complete` receives the result on that thread. Join the returned
    /// handle to wait for the message to be on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SendFailed`] if the thread could not be spawned.
    pub fn send_message_async<F>(
        self: &Arc<Self>,
        data: Vec<u8>,
        dest_id: u32,
        broadcast: bool,
        on_complete: F,
    ) -> Result<JoinHandle<()>>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let endpoint = Arc::clone(self);
        thread::Builder::new()
            .name(format!("bus-send-{}", self.local_id))
            .spawn(move || on_complete(endpoint.send_message(&data, dest_id, broadcast)))
            .map_err(|e| {
                log::error!("[comm] failed to spawn sender thread: {e}");
                BusError::SendFailed
            })
    }

    /// Handle one packet from the receive thread.
    pub fn receive_packet(&self, packet: Packet) {
        if packet.dest_id != self.local_id && !packet.is_broadcast {
            log::debug!("[comm] ignoring packet for {}", packet.dest_id);
            return;
        }

        if packet.rtr {
            self.handle_ack(&packet);
            return;
        }

        if !packet.valid_crc() {
            self.handle_invalid_crc(&packet);
            return;
        }

        let now = Instant::now();
        let completed = {
            let mut reassembler = lock(&self.reassembler);
            reassembler.gc(now);
            reassembler.add(packet, now)
        };
        let Some(data) = completed else {
            return;
        };

        log::debug!("[comm] message of {} bytes from {}", data.len(), packet.src_id);
        if self.ack_enabled && !packet.is_broadcast {
            self.reply(packet.src_id, AckStatus::Ack);
        }
        (self.on_data)(packet.src_id, data);
    }

    fn handle_ack(&self, packet: &Packet) {
        let Some(status) = packet.ack_status() else {
            log::debug!("[comm] ignoring remote request from {}", packet.src_id);
            return;
        };
        log::debug!("[comm] {status} from {}", packet.src_id);
        let callback = lock(&self.on_ack).clone();
        if let Some(callback) = callback {
            callback(packet.src_id, status);
        }
    }

    /// Called for every packet whose payload fails its checksum.
    fn handle_invalid_crc(&self, packet: &Packet) {
        log::warn!("[comm] dropping corrupt packet: {}", packet.summary());
        if self.ack_enabled && !packet.is_broadcast {
            self.reply(packet.src_id, AckStatus::Nack);
        }
    }

    fn reply(&self, dest_id: u32, status: AckStatus) {
        if let Err(e) = self.client.send_packet(&Packet::ack(self.local_id, dest_id, status)) {
            log::warn!("[comm] could not send {status} to {dest_id}: {e}");
        }
    }

    /// Install the acknowledgement callback.
    pub fn set_ack_callback(&self, callback: AckCallback) {
        *lock(&self.on_ack) = Some(callback);
    }

    /// Disconnect from the relay.
    pub fn close_connection(&self) -> Result<()> {
        self.client.close_connection()
    }

    /// Whether the connection is up.
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// This endpoint's bus id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Messages partially received and awaiting more packets.
    pub fn pending_messages(&self) -> usize {
        lock(&self.reassembler).len()
    }
}
