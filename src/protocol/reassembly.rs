//! Per-endpoint table of partially received messages.
//!
//! Packets are grouped by `(src_id, dest_id)`. A sender serialises its
//! messages, so at most one message per key is in flight at a time. Entries
//! that stop receiving packets are discarded by [`Reassembler::gc`].
//!
//! A packet announcing `tps = 0` or more packets than the largest accepted
//! message never opens an entry.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::constants::PACKET_PAYLOAD_SIZE;

use super::{Message, Packet};

/// Reassembly key: `(src_id, dest_id)`.
pub type MessageKey = (u32, u32);

#[derive(Debug)]
struct Pending {
    message: Message,
    started: Instant,
}

/// In-progress messages keyed by sender and receiver.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<MessageKey, Pending>,
    timeout: Duration,
    max_tps: u32,
}

impl Reassembler {
    /// Create an empty table whose entries expire after `timeout` and whose
    /// messages span at most `max_tps` packets.
    pub fn new(timeout: Duration, max_tps: u32) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            max_tps,
        }
    }

    /// Packet count of the largest payload of `max_message_size` bytes.
    pub fn max_tps_for(max_message_size: usize) -> u32 {
        let count = max_message_size.div_ceil(PACKET_PAYLOAD_SIZE).max(1);
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Fold `packet` into its message.
    ///
    /// Returns the reassembled payload once the message completes; the entry
    /// is erased at that point. A packet announcing a different `tps` than
    /// the in-progress entry starts a new message for that key.
    pub fn add(&mut self, packet: Packet, now: Instant) -> Option<Vec<u8>> {
        let key = (packet.src_id, packet.dest_id);

        if packet.tps == 0 || packet.tps > self.max_tps {
            log::warn!(
                "[reassembly] {key:?}: dropping packet announcing tps={} (limit {})",
                packet.tps,
                self.max_tps
            );
            return None;
        }

        let stale = self
            .pending
            .get(&key)
            .is_some_and(|p| p.message.total_packet_sum() != packet.tps);
        if stale {
            log::debug!("[reassembly] {key:?}: tps changed to {}, restarting message", packet.tps);
            self.pending.remove(&key);
        }

        let entry = self.pending.entry(key).or_insert_with(|| Pending {
            message: Message::expecting(packet.tps),
            started: now,
        });
        if !entry.message.add_packet(packet) {
            log::debug!("[reassembly] {key:?}: dropped packet psn={} tps={}", packet.psn, packet.tps);
            return None;
        }
        if !entry.message.is_complete() {
            return None;
        }

        let done = self.pending.remove(&key)?;
        done.message.complete_data().ok()
    }

    /// Discard entries older than the timeout. Returns how many were dropped.
    pub fn gc(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let timeout = self.timeout;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.started) < timeout);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            log::warn!("[reassembly] discarded {dropped} incomplete message(s)");
        }
        dropped
    }

    /// Number of messages in progress.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no message is in progress.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_TPS: u32 = 1024;

    fn packets(src: u32, dest: u32, data: &[u8]) -> Vec<Packet> {
        Message::split(src, data, false, dest)
            .unwrap()
            .packets()
            .copied()
            .collect()
    }

    #[test]
    fn test_completes_and_erases_entry() {
        let mut table = Reassembler::new(Duration::from_secs(5), MAX_TPS);
        let now = Instant::now();
        let data: Vec<u8> = (0..20).collect();
        let parts = packets(5, 8, &data);

        assert_eq!(table.add(parts[0], now), None);
        assert_eq!(table.add(parts[1], now), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.add(parts[2], now), Some(data));
        assert!(table.is_empty());
    }

    #[test]
    fn test_interleaved_senders_stay_separate() {
        let mut table = Reassembler::new(Duration::from_secs(5), MAX_TPS);
        let now = Instant::now();
        let a = packets(1, 9, b"from sender one!");
        let b = packets(2, 9, b"sender two here.");

        assert_eq!(table.add(a[0], now), None);
        assert_eq!(table.add(b[0], now), None);
        assert_eq!(table.len(), 2);
        assert_eq!(table.add(b[1], now).as_deref(), Some(&b"sender two here."[..]));
        assert_eq!(table.add(a[1], now).as_deref(), Some(&b"from sender one!"[..]));
    }

    #[test]
    fn test_duplicate_packet_does_not_complete_early() {
        let mut table = Reassembler::new(Duration::from_secs(5), MAX_TPS);
        let now = Instant::now();
        let parts = packets(1, 2, &[3u8; 16]);

        assert_eq!(table.add(parts[0], now), None);
        assert_eq!(table.add(parts[0], now), None);
        assert_eq!(table.add(parts[1], now), Some(vec![3u8; 16]));
    }

    #[test]
    fn test_new_tps_restarts_message() {
        let mut table = Reassembler::new(Duration::from_secs(5), MAX_TPS);
        let now = Instant::now();
        let abandoned = packets(1, 2, &[0u8; 24]);
        let fresh = packets(1, 2, b"short");

        assert_eq!(table.add(abandoned[0], now), None);
        assert_eq!(table.add(fresh[0], now).as_deref(), Some(&b"short"[..]));
        assert!(table.is_empty());
    }

    #[test]
    fn test_gc_drops_stale_entries() {
        let mut table = Reassembler::new(Duration::from_millis(100), MAX_TPS);
        let start = Instant::now();
        let parts = packets(1, 2, &[0u8; 24]);

        table.add(parts[0], start);
        assert_eq!(table.gc(start + Duration::from_millis(50)), 0);
        assert_eq!(table.gc(start + Duration::from_millis(150)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_out_of_bounds_tps_is_dropped() {
        let mut table = Reassembler::new(Duration::from_secs(5), MAX_TPS);
        let now = Instant::now();
        let mut packet = packets(5, 8, b"x")[0];

        for tps in [0, MAX_TPS + 1, 200_000_000, u32::MAX] {
            packet.tps = tps;
            assert_eq!(table.add(packet, now), None);
        }
        assert!(table.is_empty());

        packet.tps = MAX_TPS;
        assert_eq!(table.add(packet, now), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_max_tps_for_message_size() {
        assert_eq!(Reassembler::max_tps_for(20), 3);
        assert_eq!(Reassembler::max_tps_for(16), 2);
        assert_eq!(Reassembler::max_tps_for(0), 1);
        assert_eq!(Reassembler::max_tps_for(usize::MAX), u32::MAX);
    }
}
