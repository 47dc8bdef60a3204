//! Bus wire protocol: packets, messages and reassembly.
//!
//! Every unit on the wire is one fixed-size [`Packet`]:
//!
//! ```text
//! [u32 LE id][u32 LE psn][u32 LE tps][u32 LE src_id][u32 LE dest_id]
//! [u8 dlc][u16 LE crc][u32 LE timestamp]
//! [u8 is_broadcast][u8 rtr][u8 passive]
//! [payload: PACKET_PAYLOAD_SIZE bytes]
//! ```
//!
//! A [`Message`] splits an application payload into `tps` packets numbered
//! `0..tps` and reassembles them on the receiving side. The [`Reassembler`]
//! keeps the in-progress messages of one endpoint keyed by `(src, dest)`.
//!
//! ## Special packets
//!
//! - **Handshake**: first packet on a new connection. All fields zero except
//!   `src_id`, which announces the sender's identity.
//! - **ACK / NACK**: `rtr` set, payload is the literal `ACK` or `NACK`.

// Rust guideline compliant 2026-02

mod message;
mod packet;
mod reassembly;

pub use message::Message;
pub use packet::{calculate_crc, AckStatus, Packet};
pub use reassembly::{MessageKey, Reassembler};
