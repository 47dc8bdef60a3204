//! Splitting payloads into packets and putting them back together.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;

use crate::constants::PACKET_PAYLOAD_SIZE;
use crate::error::{BusError, Result};

use super::Packet;

/// One logical payload as an ordered set of packets.
///
/// Packets are keyed by `psn`, so arrival order does not matter and a
/// duplicate never counts twice. Storage grows with the packets actually
/// received, not with the announced `tps`.
#[derive(Debug, Clone)]
pub struct Message {
    tps: u32,
    slots: BTreeMap<u32, Packet>,
}

impl Message {
    /// Split `data` into packets from `src_id` to `dest_id`.
    ///
    /// Produces `ceil(len / PACKET_PAYLOAD_SIZE)` packets; an empty payload
    /// still yields one packet with `dlc = 0` so it can be delivered.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidDataSize`] if the packet count does not
    /// fit the `tps` header field.
    pub fn split(src_id: u32, data: &[u8], is_broadcast: bool, dest_id: u32) -> Result<Self> {
        let count = data.len().div_ceil(PACKET_PAYLOAD_SIZE).max(1);
        let tps = u32::try_from(count).map_err(|_| BusError::InvalidDataSize)?;

        let mut slots = BTreeMap::new();
        for psn in 0..tps {
            let start = psn as usize * PACKET_PAYLOAD_SIZE;
            let end = (start + PACKET_PAYLOAD_SIZE).min(data.len());
            let chunk = &data[start.min(end)..end];
            slots.insert(psn, Packet::new(src_id, dest_id, psn, tps, chunk, is_broadcast)?);
        }

        Ok(Self { tps, slots })
    }

    /// Empty receive-side message expecting `tps` packets.
    pub fn expecting(tps: u32) -> Self {
        Self {
            tps,
            slots: BTreeMap::new(),
        }
    }

    /// Store a received packet in its slot.
    ///
    /// Returns `false` (packet dropped) when `psn` is out of range, the
    /// packet's `tps` disagrees with this message, or the slot is already
    /// filled.
    pub fn add_packet(&mut self, packet: Packet) -> bool {
        if packet.tps != self.tps || packet.psn >= self.tps {
            return false;
        }
        if self.slots.contains_key(&packet.psn) {
            return false;
        }
        self.slots.insert(packet.psn, packet);
        true
    }

    /// Whether every packet `0..tps` is present.
    pub fn is_complete(&self) -> bool {
        self.received() == self.tps
    }

    /// Expected packet count.
    pub fn total_packet_sum(&self) -> u32 {
        self.tps
    }

    /// Number of packets stored so far.
    pub fn received(&self) -> u32 {
        // Never exceeds `tps`, which is a u32.
        self.slots.len() as u32
    }

    /// Stored packets in `psn` order.
    pub fn packets(&self) -> impl DoubleEndedIterator<Item = &Packet> {
        self.slots.values()
    }

    /// Reassemble the payload.
    ///
    /// Length is `(tps - 1) * PACKET_PAYLOAD_SIZE + last.dlc`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidData`] if the message is incomplete.
    pub fn complete_data(&self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(BusError::InvalidData);
        }
        let Some(last) = self.tps.checked_sub(1).and_then(|psn| self.slots.get(&psn)) else {
            return Ok(Vec::new());
        };
        let len = (self.tps as usize - 1) * PACKET_PAYLOAD_SIZE + usize::from(last.dlc);
        let mut data = vec![0u8; len];
        for packet in self.packets() {
            let offset = packet.psn as usize * PACKET_PAYLOAD_SIZE;
            let chunk = packet.data();
            let end = (offset + chunk.len()).min(len);
            data[offset..end].copy_from_slice(&chunk[..end - offset]);
        }
        Ok(data)
    }
}
