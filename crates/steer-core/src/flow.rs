//! Flow records and the flow table
//!
//! The table owns every record in a pre-sized slab; all other structures
//! refer to flows by index only, so eviction and migration can never leave
//! a dangling reference behind.

use std::collections::{HashMap, VecDeque};

use steer_common::{CoreId, FlowKey, Packet, Timestamp};

/// Index of a flow record inside the table slab
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FlowIdx(pub usize);

/// Latency classification of a flow, decided once against the installed
/// rules and sticky after a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    /// No rule consulted yet
    Unclassified,
    /// A rule matched; packets skip parking
    Match,
    /// Rules consulted, none matched
    NoMatch,
}

/// Migration directions tallied per flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionKind {
    /// Low-power core is saturating; move to the performance cluster
    ToPerformance,
    /// Flow rate dropped; move back to the low-power cluster
    ToLowPower,
    /// Spread load within the performance cluster
    Rebalance,
}

/// One classified traffic flow
#[derive(Debug)]
pub struct FlowRecord {
    /// Flow hash; fixed at insertion
    pub flow_hash: u64,
    /// Transport tuple summary
    pub key: FlowKey,
    /// Current placement; mutated only by the flush engine
    pub assigned_core: CoreId,
    /// Packets parked for ordered delivery
    pub pending: VecDeque<Packet>,
    /// Bytes currently parked
    pub pending_bytes: u64,
    /// Destination core `enqueued_count` snapshot taken at creation and at
    /// every migration or same-core delivery
    pub enqueue_watermark: u64,
    /// Total packets since creation
    pub packet_count: u64,
    /// Total bytes since creation
    pub byte_count: u64,
    /// Latency classification
    pub latency_class: LatencyClass,
    /// Placement hint from the control loop or the external tuning agent
    pub steer_hint: Option<CoreId>,
    /// Deferred flush cycles spent waiting for an eligible core
    pub reassign_retries: u32,

    /// Instantaneous packets/sec as of the last control tick
    pub rx_pps: u64,
    /// Instantaneous bits/sec as of the last control tick
    pub rx_bps: u64,
    /// Blended packets/sec estimate
    pub avg_pps: u64,
    /// Previous instantaneous sample, input to the blend
    pub last_pps: u64,
    /// Packet total at the last control tick
    pub last_packet_count: u64,
    /// Byte total at the last control tick
    pub last_byte_count: u64,
    /// Timestamp of the last tick that saw new packets
    pub last_active: Timestamp,
    /// Nanoseconds since the flow last produced a packet
    pub inactivity_ns: u64,
    /// Suggestions issued for this flow, by direction
    pub suggestion_counts: [u64; 3],
}

impl FlowRecord {
    /// Create a record for a flow first seen now, placed on `core`
    pub fn new(packet: &Packet, core: CoreId, watermark: u64, now: Timestamp) -> Self {
        Self {
            flow_hash: packet.flow_hash,
            key: packet.key,
            assigned_core: core,
            pending: VecDeque::with_capacity(32),
            pending_bytes: 0,
            enqueue_watermark: watermark,
            packet_count: 0,
            byte_count: 0,
            latency_class: LatencyClass::Unclassified,
            steer_hint: None,
            reassign_retries: 0,
            rx_pps: 0,
            rx_bps: 0,
            avg_pps: 0,
            last_pps: 0,
            last_packet_count: 0,
            last_byte_count: 0,
            last_active: now,
            inactivity_ns: 0,
            suggestion_counts: [0; 3],
        }
    }

    /// Park a packet at the tail of the pending queue
    #[inline(always)]
    pub fn park(&mut self, packet: Packet) {
        self.packet_count += 1;
        self.byte_count += packet.len as u64;
        self.pending_bytes += packet.len as u64;
        self.pending.push_back(packet);
    }

    /// Account a packet that took the fast path (never parked)
    #[inline(always)]
    pub fn count_fast_path(&mut self, len: u32) {
        self.packet_count += 1;
        self.byte_count += len as u64;
    }

    /// Number of parked packets
    #[inline(always)]
    pub fn parked_len(&self) -> usize {
        self.pending.len()
    }

    /// Tally a suggestion by direction
    pub fn count_suggestion(&mut self, kind: SuggestionKind) {
        let slot = match kind {
            SuggestionKind::ToPerformance => 0,
            SuggestionKind::ToLowPower => 1,
            SuggestionKind::Rebalance => 2,
        };
        self.suggestion_counts[slot] += 1;
    }
}

/// Pre-sized slab of flow records with a hash index.
///
/// Insertion fails closed once `capacity` records are live; the admission
/// path turns that into a bypass, never an error.
pub struct FlowTable {
    slots: Vec<Option<FlowRecord>>,
    free: Vec<usize>,
    index: HashMap<u64, usize>,
    live: usize,
}

impl FlowTable {
    /// Create a table able to hold `capacity` live flows
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        // Free list popped from the back keeps low indices hot
        let free = (0..capacity).rev().collect();
        Self {
            slots,
            free,
            index: HashMap::with_capacity(capacity),
            live: 0,
        }
    }

    /// Live flow count
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no flows are live
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slab capacity (the live-flow cap)
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Look up the index of a flow by hash
    #[inline(always)]
    pub fn lookup(&self, flow_hash: u64) -> Option<FlowIdx> {
        self.index.get(&flow_hash).copied().map(FlowIdx)
    }

    /// Insert a record, failing closed at capacity or on hash collision
    pub fn insert(&mut self, record: FlowRecord) -> Option<FlowIdx> {
        if self.index.contains_key(&record.flow_hash) {
            return None;
        }
        let slot = self.free.pop()?;
        self.index.insert(record.flow_hash, slot);
        self.slots[slot] = Some(record);
        self.live += 1;
        Some(FlowIdx(slot))
    }

    /// Borrow a record
    #[inline(always)]
    pub fn get(&self, idx: FlowIdx) -> Option<&FlowRecord> {
        self.slots.get(idx.0).and_then(|s| s.as_ref())
    }

    /// Mutably borrow a record
    #[inline(always)]
    pub fn get_mut(&mut self, idx: FlowIdx) -> Option<&mut FlowRecord> {
        self.slots.get_mut(idx.0).and_then(|s| s.as_mut())
    }

    /// Remove a record and reclaim its slot
    pub fn remove(&mut self, idx: FlowIdx) -> Option<FlowRecord> {
        let record = self.slots.get_mut(idx.0)?.take()?;
        self.index.remove(&record.flow_hash);
        self.free.push(idx.0);
        self.live -= 1;
        Some(record)
    }

    /// Indices of every live flow, ascending
    pub fn indices(&self) -> Vec<FlowIdx> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| FlowIdx(i))
            .collect()
    }

    /// Total parked packets across all flows
    pub fn total_parked(&self) -> u64 {
        self.slots
            .iter()
            .flatten()
            .map(|r| r.parked_len() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use steer_common::PROTO_UDP;

    fn packet(port: u16) -> Packet {
        let key = FlowKey::from_v4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            port,
            443,
            PROTO_UDP,
        );
        Packet::from_key(key, Bytes::from_static(&[0u8; 100]))
    }

    fn record(port: u16) -> FlowRecord {
        FlowRecord::new(&packet(port), CoreId(0), 0, Timestamp::from_nanos(0))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = FlowTable::new(16);
        let rec = record(1000);
        let hash = rec.flow_hash;

        let idx = table.insert(rec).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(hash), Some(idx));

        let removed = table.remove(idx).unwrap();
        assert_eq!(removed.flow_hash, hash);
        assert_eq!(table.len(), 0);
        assert_eq!(table.lookup(hash), None);
    }

    #[test]
    fn test_capacity_fails_closed() {
        let mut table = FlowTable::new(2);
        assert!(table.insert(record(1)).is_some());
        assert!(table.insert(record(2)).is_some());
        assert!(table.insert(record(3)).is_none());

        // Eviction frees a slot for the next distinct flow
        let idx = table.lookup(record(1).flow_hash).unwrap();
        table.remove(idx);
        assert!(table.insert(record(3)).is_some());
    }

    #[test]
    fn test_duplicate_hash_rejected() {
        let mut table = FlowTable::new(4);
        assert!(table.insert(record(7)).is_some());
        assert!(table.insert(record(7)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_slot_reuse_resets_state() {
        let mut table = FlowTable::new(1);
        let mut rec = record(9);
        rec.park(packet(9));
        rec.avg_pps = 5000;
        let idx = table.insert(rec).unwrap();
        table.remove(idx).unwrap();

        let fresh = table.insert(record(9)).unwrap();
        let r = table.get(fresh).unwrap();
        assert_eq!(r.packet_count, 0);
        assert_eq!(r.avg_pps, 0);
        assert_eq!(r.parked_len(), 0);
    }

    #[test]
    fn test_park_accounting() {
        let mut rec = record(5);
        rec.park(packet(5));
        rec.park(packet(5));
        assert_eq!(rec.parked_len(), 2);
        assert_eq!(rec.packet_count, 2);
        assert_eq!(rec.byte_count, 200);
        assert_eq!(rec.pending_bytes, 200);
    }
}
