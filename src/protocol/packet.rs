//! Fixed-size bus packet and its wire codec.

// Rust guideline compliant 2026-02

use std::fmt;

use crc::{Crc, CRC_16_IBM_3740};

use crate::constants::{ACK_PAYLOAD, NACK_PAYLOAD, PACKET_PAYLOAD_SIZE, PACKET_SIZE};
use crate::error::{BusError, Result};

/// CRC-16/IBM-3740 (a.k.a. CCITT-FALSE) over the packet payload.
const PAYLOAD_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum of a packet payload.
///
/// The receiver recomputes this over `data[..dlc]` and compares it with the
/// header CRC to detect corruption.
pub fn calculate_crc(data: &[u8]) -> u16 {
    PAYLOAD_CRC.checksum(data)
}

/// Outcome carried by an acknowledgement packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The message arrived complete and intact.
    Ack,
    /// A packet failed validation; the sender may retransmit.
    Nack,
}

impl AckStatus {
    fn payload(self) -> &'static [u8] {
        match self {
            AckStatus::Ack => ACK_PAYLOAD,
            AckStatus::Nack => NACK_PAYLOAD,
        }
    }

    fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload == ACK_PAYLOAD {
            Some(AckStatus::Ack)
        } else if payload == NACK_PAYLOAD {
            Some(AckStatus::Nack)
        } else {
            None
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStatus::Ack => f.write_str("ACK"),
            AckStatus::Nack => f.write_str("NACK"),
        }
    }
}

/// One fixed-size wire unit: header plus an inline payload slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Packet {
    /// Logical message id (`src_id + dest_id`, wrapping).
    pub id: u32,
    /// Packet sequence number within the message, 0-based.
    pub psn: u32,
    /// Total packet count of the owning message.
    pub tps: u32,
    /// Sender id.
    pub src_id: u32,
    /// Addressed receiver id (ignored when `is_broadcast` is set).
    pub dest_id: u32,
    /// Number of valid payload bytes.
    pub dlc: u8,
    /// Checksum of `payload[..dlc]`.
    pub crc: u16,
    /// Unix time (seconds, truncated to 32 bits) at construction.
    pub timestamp: u32,
    /// Deliver to every connected peer.
    pub is_broadcast: bool,
    /// Remote transmission request; used for ACK/NACK replies.
    pub rtr: bool,
    /// Passive (listen-only) marker.
    pub passive: bool,
    payload: [u8; PACKET_PAYLOAD_SIZE],
}

impl Packet {
    /// Build a fully populated packet ready to send.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidDataSize`] if `data` exceeds the payload
    /// capacity.
    pub fn new(
        src_id: u32,
        dest_id: u32,
        psn: u32,
        tps: u32,
        data: &[u8],
        is_broadcast: bool,
    ) -> Result<Self> {
        let mut packet = Packet {
            id: src_id.wrapping_add(dest_id),
            psn,
            tps,
            src_id,
            dest_id,
            timestamp: now_secs(),
            is_broadcast,
            ..Packet::default()
        };
        packet.set_data(data)?;
        Ok(packet)
    }

    /// Handshake packet announcing `src_id` on a fresh connection.
    pub fn handshake(src_id: u32) -> Self {
        Packet {
            src_id,
            ..Packet::default()
        }
    }

    /// Acknowledgement reply from `src_id` back to `dest_id`.
    pub fn ack(src_id: u32, dest_id: u32, status: AckStatus) -> Self {
        let mut packet = Packet {
            id: src_id.wrapping_add(dest_id),
            tps: 1,
            src_id,
            dest_id,
            timestamp: now_secs(),
            rtr: true,
            ..Packet::default()
        };
        let payload = status.payload();
        packet.payload[..payload.len()].copy_from_slice(payload);
        packet.dlc = payload.len() as u8;
        packet.crc = calculate_crc(payload);
        packet
    }

    /// Copy `data` into the payload, update `dlc` and recompute the CRC.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidDataSize`] if `data` exceeds the payload
    /// capacity; the packet is left unchanged.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > PACKET_PAYLOAD_SIZE {
            return Err(BusError::InvalidDataSize);
        }
        self.payload = [0u8; PACKET_PAYLOAD_SIZE];
        self.payload[..data.len()].copy_from_slice(data);
        self.dlc = data.len() as u8;
        self.crc = calculate_crc(data);
        Ok(())
    }

    /// Valid payload bytes (`payload[..dlc]`).
    pub fn data(&self) -> &[u8] {
        &self.payload[..usize::from(self.dlc).min(PACKET_PAYLOAD_SIZE)]
    }

    /// Packet sequence number.
    pub fn psn(&self) -> u32 {
        self.psn
    }

    /// Set the packet sequence number.
    pub fn set_psn(&mut self, psn: u32) {
        self.psn = psn;
    }

    /// Total packet count of the owning message.
    pub fn total_packet_sum(&self) -> u32 {
        self.tps
    }

    /// Set the total packet count.
    pub fn set_total_packet_sum(&mut self, tps: u32) {
        self.tps = tps;
    }

    /// Whether the header CRC matches the payload.
    pub fn valid_crc(&self) -> bool {
        self.crc == calculate_crc(self.data())
    }

    /// Whether this is the last packet of its message.
    pub fn is_last(&self) -> bool {
        self.tps > 0 && self.psn == self.tps - 1
    }

    /// Decode an ACK/NACK reply, if this is one.
    pub fn ack_status(&self) -> Option<AckStatus> {
        if self.rtr {
            AckStatus::from_payload(self.data())
        } else {
            None
        }
    }

    /// Mutable access to the raw payload buffer, bypassing the CRC.
    ///
    /// Only tests need this, to simulate corruption in transit.
    #[cfg(test)]
    pub(crate) fn payload_mut(&mut self) -> &mut [u8; PACKET_PAYLOAD_SIZE] {
        &mut self.payload
    }

    // ── Wire codec ──────────────────────────────────────────────────────────

    /// Encode into the fixed little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        let mut at = 0;
        for field in [self.id, self.psn, self.tps, self.src_id, self.dest_id] {
            buf[at..at + 4].copy_from_slice(&field.to_le_bytes());
            at += 4;
        }
        buf[at] = self.dlc;
        at += 1;
        buf[at..at + 2].copy_from_slice(&self.crc.to_le_bytes());
        at += 2;
        buf[at..at + 4].copy_from_slice(&self.timestamp.to_le_bytes());
        at += 4;
        buf[at] = u8::from(self.is_broadcast);
        buf[at + 1] = u8::from(self.rtr);
        buf[at + 2] = u8::from(self.passive);
        at += 3;
        buf[at..].copy_from_slice(&self.payload);
        buf
    }

    /// Decode one packet from exactly [`PACKET_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidData`] if the length is wrong or `dlc`
    /// exceeds the payload capacity.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PACKET_SIZE {
            return Err(BusError::InvalidData);
        }
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let dlc = bytes[20];
        if usize::from(dlc) > PACKET_PAYLOAD_SIZE {
            return Err(BusError::InvalidData);
        }
        let mut payload = [0u8; PACKET_PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[PACKET_SIZE - PACKET_PAYLOAD_SIZE..]);

        Ok(Packet {
            id: u32_at(0),
            psn: u32_at(4),
            tps: u32_at(8),
            src_id: u32_at(12),
            dest_id: u32_at(16),
            dlc,
            crc: u16::from_le_bytes([bytes[21], bytes[22]]),
            timestamp: u32_at(23),
            is_broadcast: bytes[27] != 0,
            rtr: bytes[28] != 0,
            passive: bytes[29] != 0,
            payload,
        })
    }

    /// One-line description for socket logs.
    pub fn summary(&self) -> String {
        format!(
            "id={} psn={}/{} src={} dest={}{} dlc={} crc={:#06x}{}",
            self.id,
            self.psn,
            self.tps,
            self.src_id,
            self.dest_id,
            if self.is_broadcast { " (broadcast)" } else { "" },
            self.dlc,
            self.crc,
            if self.rtr { " rtr" } else { "" },
        )
    }
}

fn now_secs() -> u32 {
    chrono::Utc::now().timestamp() as u32
}
