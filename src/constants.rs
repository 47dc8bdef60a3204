//! Bus-wide constants.
//!
//! Centralizes the wire sizes, default addresses and timing values shared by
//! the client, server and reassembly layers.
//!
//! # Categories
//!
//! - **Wire**: packet payload capacity and encoded packet size
//! - **Network**: default address, port and listen backlog
//! - **Reassembly**: limits for in-progress messages

use std::net::Ipv4Addr;
use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Payload bytes carried by one packet (CAN-style 8 byte frames).
pub const PACKET_PAYLOAD_SIZE: usize = 8;

/// Encoded header size: five `u32` fields, `dlc`, `crc`, `timestamp` and
/// three flag bytes.
pub const PACKET_HEADER_SIZE: usize = 4 * 5 + 1 + 2 + 4 + 3;

/// Total encoded packet size on the wire.
pub const PACKET_SIZE: usize = PACKET_HEADER_SIZE + PACKET_PAYLOAD_SIZE;

/// Payload of a positive acknowledgement packet.
pub const ACK_PAYLOAD: &[u8] = b"ACK";

/// Payload of a negative acknowledgement packet.
pub const NACK_PAYLOAD: &[u8] = b"NACK";

// ============================================================================
// Network
// ============================================================================

/// Address the bus server listens on and clients connect to.
pub const DEFAULT_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Well-known bus server port.
pub const DEFAULT_PORT: u16 = 50_000;

/// Listen backlog for the bus server socket.
///
/// Connections arrive one process at a time, so a small queue is enough.
pub const DEFAULT_BACKLOG: i32 = 5;

// ============================================================================
// Reassembly
// ============================================================================

/// How long a partially received message may wait for its missing packets.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest application payload accepted by `Communication::send_message`.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
