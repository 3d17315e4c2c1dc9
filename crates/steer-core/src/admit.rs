//! Packet admission and parking
//!
//! The hot path: one bounded critical section per packet, no suspension, no
//! unbounded allocation. Every packet leaves with a definite outcome; all
//! failure modes degrade to immediate unclassified delivery, never to drops
//! or errors.

use steer_common::{Packet, Timestamp};

use crate::flow::{FlowRecord, LatencyClass};
use crate::scheduler::{FlushArm, Inner, Scheduler};
use crate::select::select_for_new_flow;
use crate::stats::{FlushReason, SoftError};

/// What happened to an admitted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Delivered immediately on the low-latency fast path
    Delivered,
    /// Parked on its flow's pending queue for ordered delivery
    Parked,
    /// Delivered immediately, unclassified (capacity or placement failure)
    Bypassed,
}

impl Scheduler {
    /// Admit one inbound packet.
    ///
    /// Runs to completion without blocking. May invoke the flush engine
    /// inline when a store limit trips.
    pub fn admit(&self, packet: Packet) -> AdmitOutcome {
        let mut kick_timer = false;
        let outcome = {
            let mut g = self.inner.lock();
            if self.is_torn_down() {
                g.bypass(packet)
            } else {
                g.admit_locked(packet, &mut kick_timer)
            }
        };
        if kick_timer {
            self.timer_kick.notify_one();
        }
        outcome
    }
}

impl Inner {
    pub(crate) fn admit_locked(&mut self, packet: Packet, kick: &mut bool) -> AdmitOutcome {
        let now = Timestamp::now();
        match self.flows.lookup(packet.flow_hash) {
            Some(idx) => {
                // Resolve a classification left open because no rules were
                // installed when the flow appeared; sticky from here on.
                let (key, mut class) = match self.flows.get(idx) {
                    Some(rec) => (rec.key, rec.latency_class),
                    None => return self.bypass(packet),
                };
                if class == LatencyClass::Unclassified && !self.filters.is_empty() {
                    class = if self.filters.matches(&key) {
                        LatencyClass::Match
                    } else {
                        LatencyClass::NoMatch
                    };
                    if let Some(rec) = self.flows.get_mut(idx) {
                        rec.latency_class = class;
                    }
                }

                if class == LatencyClass::Match {
                    return self.fast_path(idx, packet, now);
                }

                if let Some(packet) = self.park_packet(idx, packet, kick) {
                    return self.bypass(packet);
                }
                self.post_admit_triggers();
                AdmitOutcome::Parked
            }
            None => self.admit_new(packet, now, kick),
        }
    }

    fn admit_new(&mut self, packet: Packet, now: Timestamp, kick: &mut bool) -> AdmitOutcome {
        if self.flows.len() >= self.flows.capacity() {
            self.stats.record_soft_error(SoftError::CapacityBypass);
            return self.bypass(packet);
        }

        let mask = self.new_flow_mask();
        let core = match select_for_new_flow(&self.cores, mask) {
            Some(core) => core,
            None => {
                self.stats.record_soft_error(SoftError::NoEligibleCore);
                return self.bypass(packet);
            }
        };

        let watermark = self.cores.get(core).map(|c| c.enqueued_count).unwrap_or(0);
        let mut rec = FlowRecord::new(&packet, core, watermark, now);
        if !self.filters.is_empty() {
            rec.latency_class = if self.filters.matches(&packet.key) {
                LatencyClass::Match
            } else {
                LatencyClass::NoMatch
            };
        }
        let class = rec.latency_class;
        let flow_hash = rec.flow_hash;

        let idx = match self.flows.insert(rec) {
            Some(idx) => idx,
            None => {
                self.stats.record_soft_error(SoftError::CapacityBypass);
                return self.bypass(packet);
            }
        };
        self.cores.assign(core, idx);
        self.stats
            .flows_created
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!(flow_hash, %core, "new flow");

        if class == LatencyClass::Match {
            return self.fast_path(idx, packet, now);
        }
        if let Some(packet) = self.park_packet(idx, packet, kick) {
            return self.bypass(packet);
        }
        self.post_admit_triggers();
        AdmitOutcome::Parked
    }

    /// Immediate delivery for latency-sensitive flows.
    ///
    /// Ordering for this class is relaxed by design, but a queue left over
    /// from before the classification resolved is drained first so it can
    /// never go stale.
    fn fast_path(
        &mut self,
        idx: crate::flow::FlowIdx,
        packet: Packet,
        now: Timestamp,
    ) -> AdmitOutcome {
        let has_backlog = self
            .flows
            .get(idx)
            .map(|r| !r.pending.is_empty())
            .unwrap_or(false);
        if has_backlog {
            self.flush_one(idx, false);
        }

        let core = match self.flows.get_mut(idx) {
            Some(rec) => {
                rec.count_fast_path(packet.len);
                self.cfg.low_latency_core.unwrap_or(rec.assigned_core)
            }
            None => return self.bypass(packet),
        };

        let len = packet.len as u64;
        self.stats
            .fast_path
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.deliver.deliver(packet, core);
        if let Some(state) = self.cores.get_mut(core) {
            state.note_delivered(1, len, now, self.cfg.burst_interval_ms * 1_000_000);
        }
        AdmitOutcome::Delivered
    }

    /// Append to the flow's pending queue and update the parked totals.
    ///
    /// Gives the packet back if the record vanished, so the caller can
    /// still deliver it.
    fn park_packet(
        &mut self,
        idx: crate::flow::FlowIdx,
        packet: Packet,
        kick: &mut bool,
    ) -> Option<Packet> {
        let len = packet.len as u64;
        let core = match self.flows.get_mut(idx) {
            Some(rec) => {
                rec.park(packet);
                rec.assigned_core
            }
            None => return Some(packet),
        };

        self.parked_packets += 1;
        self.parked_bytes += len;
        if let Some(state) = self.cores.get_mut(core) {
            state.parked_len += 1;
        }
        self.stats
            .parked
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // First packet parked after an empty state arms the fallback timer
        if self.cfg.fallback_timer && self.flush_arm == FlushArm::Idle {
            self.flush_arm = FlushArm::Pending;
            *kick = true;
        }
        None
    }

    /// Store-limit and coalescing checks run after every admission
    fn post_admit_triggers(&mut self) {
        if self.parked_packets > self.cfg.max_parked_packets {
            self.flush_all(true, FlushReason::PacketLimit);
        } else if self.parked_bytes > self.cfg.max_parked_bytes {
            self.flush_all(true, FlushReason::ByteLimit);
        } else if self.flush_arm == FlushArm::Armed {
            // The armed fallback fires on the next admission rather than
            // waiting out a second timer period
            self.flush_all(true, FlushReason::TimerExpiry);
        } else if !self.cfg.marker_flush && self.parked_packets > 0 {
            // No marker source: deliver opportunistically every admission
            self.flush_all(false, FlushReason::Opportunistic);
        } else if self.cfg.marker_flush && self.parked_packets > 0 && !self.marker.window_open {
            // Packets arriving outside a marker window cannot wait for a
            // trailer that may never come
            self.flush_all(false, FlushReason::MarkerRecovery);
        }
    }

    /// Deliver unclassified; the packet is never dropped for scheduling
    /// reasons
    pub(crate) fn bypass(&mut self, packet: Packet) -> AdmitOutcome {
        self.stats
            .bypassed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let core = self.cfg.default_core;
        self.deliver.deliver(packet, core);
        AdmitOutcome::Bypassed
    }
}
