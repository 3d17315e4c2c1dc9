//! Control loop
//!
//! Runs off the packet path on a fixed period. Each tick recomputes per-flow
//! and per-core rate estimates, detects overloaded low-power cores (boost,
//! drain, cooldown), evicts inactive flows, and decides migrations. A tick
//! that runs long simply delays the next one; ticks never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use steer_common::{ClusterClass, CoreId, CoreMask, Timestamp};

use crate::flow::{FlowIdx, LatencyClass, SuggestionKind};
use crate::scheduler::{Inner, MigrationSuggestion, Scheduler};
use crate::select::{prefer_cluster, select_core};
use crate::stats::{FlushReason, SoftError};

pub(crate) async fn control_task(sched: Arc<Scheduler>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(sched.cfg.control_period_ms.max(1));
    let mut interval = tokio::time::interval(period);
    // A long tick delays the next one; the loop is never concurrent with
    // itself
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => return,
        }
        if sched.is_running() {
            sched.control_tick();
        }
    }
}

impl Scheduler {
    /// Run one control tick now.
    ///
    /// Normally driven by the task spawned in [`Scheduler::start`]; exposed
    /// for embedders that schedule the loop themselves.
    pub fn control_tick(&self) {
        self.control_tick_at(Timestamp::now());
    }

    /// Run one control tick against an explicit clock reading
    pub fn control_tick_at(&self, now: Timestamp) {
        let (live, parked) = {
            let mut g = self.inner.lock();
            g.tick(now);
            (g.flows.len(), g.parked_packets)
        };

        metrics::counter!("steer_control_ticks").increment(1);
        metrics::gauge!("steer_live_flows").set(live as f64);
        metrics::gauge!("steer_parked_packets").set(parked as f64);
    }
}

impl Inner {
    fn tick(&mut self, now: Timestamp) {
        self.stats
            .control_ticks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let period_ns = self.cfg.control_period_ms.max(1) * 1_000_000;
        let tick_delta = {
            let d = self.last_tick.nanos_until(now);
            if d < period_ns {
                period_ns
            } else {
                d
            }
        };
        self.last_tick = now;

        self.update_flow_rates(now, period_ns);
        self.update_core_rates(tick_delta);
        self.check_overload(now);
        self.evict_inactive(now);
        self.issue_suggestions();
    }

    /// Exponentially weighted blend of the per-flow rate.
    ///
    /// A flow moving up off a saturated low-power core should react fast, a
    /// flow cooling down on a performance core should move back only after
    /// sustained low traffic; the history weight expresses both.
    fn update_flow_rates(&mut self, now: Timestamp, period_ns: u64) {
        for idx in self.flows.indices() {
            let rec = match self.flows.get_mut(idx) {
                Some(rec) => rec,
                None => continue,
            };

            let new_pkts = rec.packet_count - rec.last_packet_count;
            if new_pkts == 0 {
                rec.rx_pps = 0;
                rec.rx_bps = 0;
                rec.avg_pps = 0;
                rec.inactivity_ns = rec.last_active.nanos_until(now);
                continue;
            }

            let mut tdiff = rec.last_active.nanos_until(now);
            if tdiff < period_ns {
                tdiff = period_ns;
            }
            let new_bytes = rec.byte_count - rec.last_byte_count;
            rec.rx_pps = new_pkts.saturating_mul(1_000_000_000) / tdiff;
            rec.rx_bps = new_bytes.saturating_mul(8_000_000_000) / tdiff;

            let w = self.cfg.ewma_weight as u64;
            rec.avg_pps = if rec.last_pps == 0 {
                rec.rx_pps
            } else {
                let mov = (rec.last_pps + rec.avg_pps) / 2;
                ((100 - w) * rec.rx_pps + w * mov) / 100
            };
            rec.last_pps = rec.rx_pps;
            rec.last_packet_count = rec.packet_count;
            rec.last_byte_count = rec.byte_count;
            rec.last_active = now;
            rec.inactivity_ns = 0;
        }
    }

    fn update_core_rates(&mut self, tick_delta: u64) {
        for state in self.cores.iter_mut() {
            let diff = state.delivered_packets - state.last_delivered;
            state.rx_pps = diff.saturating_mul(1_000_000_000) / tick_delta;
            state.last_delivered = state.delivered_packets;

            let backlog = state.backlog();
            if backlog > state.max_backlog_seen {
                state.max_backlog_seen = backlog;
            }
        }
    }

    /// Overload handling for the low-power cluster: boost, drain, cooldown
    fn check_overload(&mut self, now: Timestamp) {
        let lp_mask = self.cfg.low_power_mask();
        let wait_ns = self.cfg.core_wait_ms.max(1) * 1_000_000;

        let mut declare: Vec<CoreId> = Vec::new();
        let mut reset: Vec<CoreId> = Vec::new();
        for (i, state) in self.cores.iter().enumerate() {
            let profile = &self.cfg.cores[i];
            if state.overloaded {
                if let Some(deadline) = state.cooldown_deadline {
                    if now >= deadline {
                        reset.push(state.core_id);
                    }
                }
            } else if profile.cluster == ClusterClass::LowPower {
                let pressured = state.rx_pps > profile.max_pps
                    || state.burst_count >= profile.max_burst
                    || state.backlog() + state.parked_len >= profile.max_backlog;
                if pressured {
                    declare.push(state.core_id);
                }
            }
        }

        for core in declare {
            if let Some(state) = self.cores.get_mut(core) {
                state.overloaded = true;
                state.overload_since = Some(now);
                state.cooldown_deadline = Some(Timestamp::from_nanos(now.as_nanos() + wait_ns));
            }
            tracing::warn!(%core, "core overloaded; boosting and draining");
            if self.cfg.freq_boost
                && !self.boost.raise_floor(lp_mask, self.cfg.boost_floor_khz)
            {
                self.stats.record_soft_error(SoftError::BoostFailed);
            }
            self.flush_core_set(core, true, FlushReason::CoreFlush);
        }

        for core in reset {
            if let Some(state) = self.cores.get_mut(core) {
                state.clear_overload();
            }
            if self.cfg.freq_boost && !self.boost.reset_floor(lp_mask) {
                self.stats.record_soft_error(SoftError::BoostFailed);
            }
            self.flush_core_set(core, true, FlushReason::CoreReset);
            tracing::info!(%core, "overload cooldown expired; reset flush");
        }
    }

    /// Remove flows that stopped producing packets, draining any parked
    /// remainder first
    fn evict_inactive(&mut self, _now: Timestamp) {
        let threshold = self.cfg.inactivity_threshold_ns(self.flows.len());

        for idx in self.flows.indices() {
            let (expired, has_pending) = match self.flows.get(idx) {
                Some(rec) => (rec.inactivity_ns > threshold, !rec.pending.is_empty()),
                None => continue,
            };
            if !expired {
                continue;
            }
            if has_pending {
                self.stats.record_flush(FlushReason::Eviction);
                self.flush_one(idx, true);
            }
            if let Some(rec) = self.flows.remove(idx) {
                self.cores.unassign(rec.assigned_core, idx);
                self.stats
                    .flows_evicted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(flow_hash = rec.flow_hash, "inactive flow evicted");
            }
        }
    }

    /// Decide migrations; apply as placement hints when autonomous,
    /// otherwise publish to the tuning agent channel
    fn issue_suggestions(&mut self) {
        let eligible = self.cores.eligible_mask();
        let perf_mask = self.cfg.performance_mask();
        let lp_mask = self.cfg.low_power_mask();

        let mut planned: Vec<(FlowIdx, u64, CoreId, CoreId, SuggestionKind)> = Vec::new();
        for idx in self.flows.indices() {
            let rec = match self.flows.get(idx) {
                Some(rec) => rec,
                None => continue,
            };
            // Latency-sensitive flows are not steered by rate
            if rec.latency_class == LatencyClass::Match {
                continue;
            }
            let current = rec.assigned_core;
            let cur_state = match self.cores.get(current) {
                Some(s) => s,
                None => continue,
            };
            let profile = &self.cfg.cores[current.index()];

            let decision = if cur_state.overloaded && cur_state.cluster == ClusterClass::LowPower
            {
                let mask = prefer_cluster(eligible, perf_mask);
                select_core(&self.cores, mask)
                    .filter(|c| *c != current)
                    .map(|c| (c, SuggestionKind::ToPerformance))
            } else if cur_state.cluster == ClusterClass::Performance
                && rec.avg_pps > 0
                && rec.avg_pps < profile.min_pps
            {
                let mask = eligible.and(lp_mask);
                if mask.is_empty() {
                    None
                } else {
                    select_core(&self.cores, mask)
                        .filter(|c| *c != current)
                        .map(|c| (c, SuggestionKind::ToLowPower))
                }
            } else if cur_state.cluster == ClusterClass::Performance
                && cur_state.rx_pps > profile.max_pps / 2
            {
                let mask = eligible.and(perf_mask).without(CoreMask(current.bit()));
                select_core(&self.cores, mask)
                    .filter(|c| {
                        self.cores
                            .get(*c)
                            .map(|s| s.rx_pps < cur_state.rx_pps / 2)
                            .unwrap_or(false)
                    })
                    .map(|c| (c, SuggestionKind::Rebalance))
            } else {
                None
            };

            if let Some((to, kind)) = decision {
                planned.push((idx, rec.flow_hash, current, to, kind));
            }
        }

        for (idx, flow_hash, from, to, kind) in planned {
            if let Some(rec) = self.flows.get_mut(idx) {
                rec.count_suggestion(kind);
                if self.cfg.autonomous {
                    rec.steer_hint = Some(to);
                }
            }
            self.stats
                .suggestions
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if !self.cfg.autonomous
                && self
                    .suggestion_tx
                    .try_send(MigrationSuggestion {
                        flow_hash,
                        from,
                        to,
                        kind,
                    })
                    .is_err()
            {
                self.stats.record_soft_error(SoftError::SuggestionDropped);
            }
            tracing::debug!(flow_hash, %from, %to, ?kind, "migration decided");
        }
    }
}
