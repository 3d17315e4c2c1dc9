//! Per-core state table
//!
//! One entry per worker core: arrival/consumption progress counters (the
//! watermark source), the set of flows placed on the core, overload state
//! and burst accounting. Flows are referenced by slab index only.

use std::collections::BTreeSet;

use steer_common::{ClusterClass, CoreId, CoreMask, Timestamp};

use crate::flow::FlowIdx;

/// State of one worker core
#[derive(Debug)]
pub struct CoreState {
    /// Core identifier
    pub core_id: CoreId,
    /// Cluster the core belongs to
    pub cluster: ClusterClass,
    /// Packets that have arrived at this core (monotonic)
    pub enqueued_count: u64,
    /// Packets this core has consumed (monotonic, fed by the next stage)
    pub processed_count: u64,
    /// Flows currently placed here
    pub assigned_flows: BTreeSet<FlowIdx>,
    /// Packets currently parked for flows placed here
    pub parked_len: u64,

    /// Core is under sustained pressure
    pub overloaded: bool,
    /// When the overload was declared
    pub overload_since: Option<Timestamp>,
    /// When the overload cooldown ends
    pub cooldown_deadline: Option<Timestamp>,

    /// Start of the current burst sampling window
    pub burst_window_start: Timestamp,
    /// Packets delivered within the current window
    pub burst_count: u64,
    /// Largest burst window ever observed
    pub max_burst_seen: u64,

    /// Delivered packets/sec as of the last control tick
    pub rx_pps: u64,
    /// Packets delivered to this core (monotonic)
    pub delivered_packets: u64,
    /// Bytes delivered to this core (monotonic)
    pub delivered_bytes: u64,
    /// Delivered total at the last control tick
    pub last_delivered: u64,
    /// Largest backlog estimate ever observed
    pub max_backlog_seen: u64,
}

impl CoreState {
    fn new(core_id: CoreId, cluster: ClusterClass, now: Timestamp) -> Self {
        Self {
            core_id,
            cluster,
            enqueued_count: 0,
            processed_count: 0,
            assigned_flows: BTreeSet::new(),
            parked_len: 0,
            overloaded: false,
            overload_since: None,
            cooldown_deadline: None,
            burst_window_start: now,
            burst_count: 0,
            max_burst_seen: 0,
            rx_pps: 0,
            delivered_packets: 0,
            delivered_bytes: 0,
            last_delivered: 0,
            max_backlog_seen: 0,
        }
    }

    /// Packets enqueued but not yet consumed by the next stage
    #[inline(always)]
    pub fn backlog(&self) -> u64 {
        self.enqueued_count.saturating_sub(self.processed_count)
    }

    /// Account a batch delivered to this core and roll the burst window
    pub fn note_delivered(&mut self, packets: u64, bytes: u64, now: Timestamp, window_ns: u64) {
        self.enqueued_count += packets;
        self.delivered_packets += packets;
        self.delivered_bytes += bytes;

        if self.burst_window_start.nanos_until(now) >= window_ns {
            if self.burst_count > self.max_burst_seen {
                self.max_burst_seen = self.burst_count;
            }
            self.burst_window_start = now;
            self.burst_count = packets;
        } else {
            self.burst_count += packets;
        }

        let backlog = self.backlog();
        if backlog > self.max_backlog_seen {
            self.max_backlog_seen = backlog;
        }
    }

    /// Clear overload state and its burst window
    pub fn clear_overload(&mut self) {
        self.overloaded = false;
        self.overload_since = None;
        self.cooldown_deadline = None;
        self.burst_count = 0;
    }
}

/// Fixed-size table of per-core state plus the administrative masks
pub struct CoreTable {
    cores: Vec<CoreState>,
    online: CoreMask,
    banned: CoreMask,
    reserved: CoreMask,
}

impl CoreTable {
    /// Build the table from the configured cluster layout
    pub fn new(clusters: &[ClusterClass], now: Timestamp) -> Self {
        let cores = clusters
            .iter()
            .enumerate()
            .map(|(i, &cluster)| CoreState::new(CoreId(i as u8), cluster, now))
            .collect::<Vec<_>>();
        let online = CoreMask::first(cores.len());
        Self {
            cores,
            online,
            banned: CoreMask::EMPTY,
            reserved: CoreMask::EMPTY,
        }
    }

    /// Number of cores
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// Whether the table is empty (never true for a validated config)
    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Borrow a core's state
    #[inline(always)]
    pub fn get(&self, core: CoreId) -> Option<&CoreState> {
        self.cores.get(core.index())
    }

    /// Mutably borrow a core's state
    #[inline(always)]
    pub fn get_mut(&mut self, core: CoreId) -> Option<&mut CoreState> {
        self.cores.get_mut(core.index())
    }

    /// Iterate all cores, lowest index first
    pub fn iter(&self) -> impl Iterator<Item = &CoreState> {
        self.cores.iter()
    }

    /// Iterate all cores mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CoreState> {
        self.cores.iter_mut()
    }

    /// Replace the administrative masks
    pub fn set_masks(&mut self, banned: CoreMask, reserved: CoreMask) {
        self.banned = banned;
        self.reserved = reserved;
    }

    /// Mark a core online or offline
    pub fn set_online(&mut self, core: CoreId, online: bool) {
        if online {
            self.online.set(core);
        } else {
            self.online.clear(core);
        }
    }

    /// Whether a core can currently receive flows
    #[inline(always)]
    pub fn is_eligible(&self, core: CoreId) -> bool {
        self.eligible_mask().contains(core)
    }

    /// Whether a core is online
    #[inline(always)]
    pub fn is_online(&self, core: CoreId) -> bool {
        self.online.contains(core)
    }

    /// Cores that may receive flows: online, not banned, not reserved
    pub fn eligible_mask(&self) -> CoreMask {
        self.online.without(self.banned).without(self.reserved)
    }

    /// Currently banned cores
    pub fn banned_mask(&self) -> CoreMask {
        self.banned
    }

    /// Currently reserved cores
    pub fn reserved_mask(&self) -> CoreMask {
        self.reserved
    }

    /// Place a flow on a core
    pub fn assign(&mut self, core: CoreId, idx: FlowIdx) {
        if let Some(state) = self.get_mut(core) {
            state.assigned_flows.insert(idx);
        }
    }

    /// Remove a flow from a core
    pub fn unassign(&mut self, core: CoreId, idx: FlowIdx) {
        if let Some(state) = self.get_mut(core) {
            state.assigned_flows.remove(&idx);
        }
    }

    /// Move a flow between cores, carrying its parked-packet attribution
    pub fn move_flow(&mut self, idx: FlowIdx, from: CoreId, to: CoreId, parked: u64) {
        if let Some(state) = self.get_mut(from) {
            state.assigned_flows.remove(&idx);
            state.parked_len = state.parked_len.saturating_sub(parked);
        }
        if let Some(state) = self.get_mut(to) {
            state.assigned_flows.insert(idx);
            state.parked_len += parked;
        }
    }
}

/// Per-core snapshot for telemetry
#[derive(Debug, Clone)]
pub struct CoreSnapshot {
    /// Core identifier
    pub core_id: CoreId,
    /// Cluster class
    pub cluster: ClusterClass,
    /// Arrival counter
    pub enqueued_count: u64,
    /// Consumption counter
    pub processed_count: u64,
    /// Backlog estimate
    pub backlog: u64,
    /// Flows placed here
    pub flows: usize,
    /// Parked packets attributed here
    pub parked: u64,
    /// Overload flag
    pub overloaded: bool,
    /// Delivered rate at the last tick
    pub rx_pps: u64,
    /// Largest backlog seen
    pub max_backlog_seen: u64,
    /// Largest burst window seen
    pub max_burst_seen: u64,
}

impl CoreState {
    /// Telemetry snapshot of this core
    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            core_id: self.core_id,
            cluster: self.cluster,
            enqueued_count: self.enqueued_count,
            processed_count: self.processed_count,
            backlog: self.backlog(),
            flows: self.assigned_flows.len(),
            parked: self.parked_len,
            overloaded: self.overloaded,
            rx_pps: self.rx_pps,
            max_backlog_seen: self.max_backlog_seen,
            max_burst_seen: self.max_burst_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CoreTable {
        CoreTable::new(
            &[
                ClusterClass::LowPower,
                ClusterClass::LowPower,
                ClusterClass::Performance,
                ClusterClass::Performance,
            ],
            Timestamp::from_nanos(0),
        )
    }

    #[test]
    fn test_backlog() {
        let mut t = table();
        let core = t.get_mut(CoreId(0)).unwrap();
        core.enqueued_count = 1000;
        core.processed_count = 480;
        assert_eq!(core.backlog(), 520);
    }

    #[test]
    fn test_eligibility_masks() {
        let mut t = table();
        assert!(t.is_eligible(CoreId(1)));

        t.set_masks(CoreMask(0b0010), CoreMask(0b1000));
        assert!(!t.is_eligible(CoreId(1)));
        assert!(!t.is_eligible(CoreId(3)));
        assert!(t.is_eligible(CoreId(0)));

        t.set_online(CoreId(0), false);
        assert!(!t.is_eligible(CoreId(0)));
        assert_eq!(t.eligible_mask().count(), 1);
    }

    #[test]
    fn test_move_flow_carries_parked() {
        let mut t = table();
        t.assign(CoreId(0), FlowIdx(7));
        t.get_mut(CoreId(0)).unwrap().parked_len = 5;

        t.move_flow(FlowIdx(7), CoreId(0), CoreId(2), 5);
        assert!(t.get(CoreId(0)).unwrap().assigned_flows.is_empty());
        assert_eq!(t.get(CoreId(0)).unwrap().parked_len, 0);
        assert!(t.get(CoreId(2)).unwrap().assigned_flows.contains(&FlowIdx(7)));
        assert_eq!(t.get(CoreId(2)).unwrap().parked_len, 5);
    }

    #[test]
    fn test_burst_window_roll() {
        let mut t = table();
        let window = 20_000_000; // 20ms
        let core = t.get_mut(CoreId(0)).unwrap();

        core.note_delivered(10, 1000, Timestamp::from_nanos(1_000_000), window);
        core.note_delivered(15, 1500, Timestamp::from_nanos(2_000_000), window);
        assert_eq!(core.burst_count, 25);

        // Past the window: the count resets and the high-water mark latches
        core.note_delivered(5, 500, Timestamp::from_nanos(25_000_000), window);
        assert_eq!(core.burst_count, 5);
        assert_eq!(core.max_burst_seen, 25);
        assert_eq!(core.enqueued_count, 30);
    }
}
