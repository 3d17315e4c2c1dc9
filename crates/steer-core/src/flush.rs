//! Flush engine
//!
//! Delivers a flow's parked queue to the next stage, migrating the flow
//! between cores only when that cannot reorder it: a move waits until the
//! old core's consumption progress has caught up with the watermark taken
//! when the flow's packets started parking there. Forced flushes and
//! vanished cores override the gate; correctness of the engine then favors
//! forward progress over strict ordering.

use steer_common::{ClusterClass, CoreId, Timestamp};

use crate::flow::FlowIdx;
use crate::scheduler::{FlushArm, Inner, Scheduler};
use crate::select::{prefer_cluster, select_core};
use crate::stats::{FlushReason, SoftError, SwitchReason};

impl Scheduler {
    /// Flush one flow's parked queue.
    ///
    /// Returns true if anything was delivered. `force` overrides the
    /// watermark gate on migration.
    pub fn flush(&self, flow_hash: u64, force: bool) -> bool {
        let mut g = self.inner.lock();
        match g.flows.lookup(flow_hash) {
            Some(idx) => g.flush_one(idx, force),
            None => false,
        }
    }

    /// Flush every flow's parked queue, low-power cores first
    pub fn flush_table(&self, force: bool) {
        self.inner
            .lock()
            .flush_all(force, FlushReason::Opportunistic);
    }
}

impl Inner {
    /// Where this flow wants to run, or `None` to stay put.
    ///
    /// Overload pressure and administrative masks dominate; otherwise the
    /// control-plane hint applies when it points somewhere usable.
    pub(crate) fn desired_core(&self, idx: FlowIdx) -> Option<CoreId> {
        let rec = self.flows.get(idx)?;
        let current = rec.assigned_core;
        let eligible = self.cores.eligible_mask();
        let cur_state = self.cores.get(current)?;

        // An overloaded low-power core sheds its flows to the performance
        // cluster
        if cur_state.overloaded && cur_state.cluster == ClusterClass::LowPower {
            let mask = prefer_cluster(eligible, self.cfg.performance_mask());
            if let Some(core) = select_core(&self.cores, mask) {
                if core != current {
                    return Some(core);
                }
            }
        }

        // Current placement administratively unavailable
        if !eligible.contains(current) {
            let mask = prefer_cluster(eligible, self.cfg.cluster_mask(cur_state.cluster));
            return select_core(&self.cores, mask);
        }

        if let Some(hint) = rec.steer_hint {
            if hint != current {
                if eligible.contains(hint) {
                    let hint_overloaded =
                        self.cores.get(hint).map(|c| c.overloaded).unwrap_or(false);
                    if !hint_overloaded {
                        return Some(hint);
                    }
                } else {
                    // The hinted core is unavailable; honor the intent if it
                    // pointed across clusters, otherwise wait
                    let hint_cluster = self.cores.get(hint).map(|c| c.cluster)?;
                    if hint_cluster != cur_state.cluster {
                        let mask =
                            prefer_cluster(eligible, self.cfg.cluster_mask(hint_cluster));
                        return select_core(&self.cores, mask);
                    }
                }
            }
        }

        None
    }

    /// Flush one flow. Empty queues are a no-op returning false.
    pub(crate) fn flush_one(&mut self, idx: FlowIdx, force: bool) -> bool {
        let now = Timestamp::now();

        let (flow_hash, current, parked, watermark) = match self.flows.get(idx) {
            Some(rec) if !rec.pending.is_empty() => (
                rec.flow_hash,
                rec.assigned_core,
                rec.parked_len() as u64,
                rec.enqueue_watermark,
            ),
            _ => return false,
        };

        let mut target = current;
        let mut migrated = false;

        if !self.cores.is_online(current) {
            // The assigned core disappeared: reassign unconditionally,
            // correctness over strict ordering
            let eligible = self.cores.eligible_mask();
            let cluster = self
                .cores
                .get(current)
                .map(|c| c.cluster)
                .unwrap_or(ClusterClass::LowPower);
            let mask = prefer_cluster(eligible, self.cfg.cluster_mask(cluster));
            match select_core(&self.cores, mask) {
                Some(core) => {
                    target = core;
                    migrated = true;
                    self.stats.record_switch(SwitchReason::CoreLost);
                }
                None => {
                    // Nothing eligible: defer a bounded number of cycles,
                    // then drain to the default core to guarantee progress
                    let retries = match self.flows.get_mut(idx) {
                        Some(rec) => {
                            rec.reassign_retries += 1;
                            rec.reassign_retries
                        }
                        None => return false,
                    };
                    if retries <= self.cfg.max_reassign_retries {
                        self.stats.record_soft_error(SoftError::NoEligibleCore);
                        return false;
                    }
                    target = self.cfg.default_core;
                    migrated = true;
                    self.stats.record_switch(SwitchReason::DefaultFallback);
                }
            }
        } else if let Some(desired) = self.desired_core(idx) {
            if desired != current {
                let (processed, backlog) = self
                    .cores
                    .get(current)
                    .map(|c| (c.processed_count, c.backlog()))
                    .unwrap_or((0, 0));

                if force || processed >= watermark || backlog == 0 {
                    let reason = if processed >= watermark {
                        SwitchReason::Watermark
                    } else if backlog == 0 {
                        SwitchReason::ZeroBacklog
                    } else {
                        SwitchReason::Forced
                    };
                    if processed < watermark {
                        // Packets enqueued before ours are still unconsumed
                        // on the old core; the forced move risks reordering
                        self.stats.ooo_packets.fetch_add(
                            watermark - processed,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                    }
                    target = desired;
                    migrated = true;
                    self.stats.record_switch(reason);
                }
                // Watermark not reached: deliver to the current core this
                // round rather than reorder
            }
        }

        if migrated {
            self.cores.move_flow(idx, current, target, parked);
            if let Some(rec) = self.flows.get_mut(idx) {
                rec.assigned_core = target;
                rec.reassign_retries = 0;
                if rec.steer_hint == Some(target) {
                    rec.steer_hint = None;
                }
            }
            tracing::debug!(flow_hash, from = %current, to = %target, force, "flow migrated");
        }

        // Deliver the entire queue in FIFO order, tagged with the (possibly
        // new) destination core
        let (queue, bytes) = match self.flows.get_mut(idx) {
            Some(rec) => (
                std::mem::take(&mut rec.pending),
                std::mem::replace(&mut rec.pending_bytes, 0),
            ),
            None => return false,
        };
        let delivered = queue.len() as u64;
        let deliver = self.deliver.clone();
        for pkt in queue {
            deliver.deliver(pkt, target);
        }

        let mut new_watermark = watermark;
        if let Some(state) = self.cores.get_mut(target) {
            state.note_delivered(delivered, bytes, now, self.cfg.burst_interval_ms * 1_000_000);
            state.parked_len = state.parked_len.saturating_sub(delivered);
            // Snapshot after delivery: a later migration is only safe once
            // everything up to and including this batch has been consumed
            new_watermark = state.enqueued_count;
        }
        if let Some(rec) = self.flows.get_mut(idx) {
            rec.enqueue_watermark = new_watermark;
        }

        self.parked_packets = self.parked_packets.saturating_sub(delivered);
        self.parked_bytes = self.parked_bytes.saturating_sub(bytes);
        self.stats
            .flushed
            .fetch_add(delivered, std::sync::atomic::Ordering::Relaxed);
        self.stats
            .flushed_bytes
            .fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);

        if self.parked_packets == 0 {
            self.flush_arm = FlushArm::Idle;
        }
        true
    }

    /// Flush every core's assigned flows, low-power cluster first
    pub(crate) fn flush_all(&mut self, force: bool, reason: FlushReason) {
        self.stats.record_flush(reason);

        let mut order: Vec<CoreId> = Vec::with_capacity(self.cores.len());
        for state in self.cores.iter() {
            if state.cluster == ClusterClass::LowPower {
                order.push(state.core_id);
            }
        }
        for state in self.cores.iter() {
            if state.cluster == ClusterClass::Performance {
                order.push(state.core_id);
            }
        }

        for core in order {
            for idx in self.core_flow_indices(core) {
                self.flush_one(idx, force);
            }
        }

        if self.parked_packets == 0 {
            self.flush_arm = FlushArm::Idle;
        }
    }

    /// Drain one core's assigned flows and reset its burst window
    pub(crate) fn flush_core_set(&mut self, core: CoreId, force: bool, reason: FlushReason) {
        self.stats.record_flush(reason);
        for idx in self.core_flow_indices(core) {
            self.flush_one(idx, force);
        }
        if let Some(state) = self.cores.get_mut(core) {
            state.burst_count = 0;
        }
    }
}
