//! The steering engine
//!
//! A single `Scheduler` owns the flow table, the per-core state table and
//! every tunable; all shared mutation happens under its one internal mutex.
//! The admission and flush paths hold that mutex only for bounded,
//! allocation-light critical sections and never suspend; the control loop
//! and the fallback timer run as background tasks that may block on it
//! briefly.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use steer_common::{CoreId, CoreMask, Packet, SteerError, SteerResult, Timestamp};

use crate::config::SteerConfig;
use crate::cores::{CoreSnapshot, CoreTable};
use crate::filters::{FilterRule, FilterSet};
use crate::flow::{FlowIdx, FlowTable, LatencyClass, SuggestionKind};
use crate::freq::FreqBoost;
use crate::stats::{SteerStats, TotalsSnapshot};

/// Egress seam: hands a packet to the next processing stage on a specific
/// core. Non-blocking by contract; delivery cannot be refused.
pub trait Deliver: Send + Sync {
    /// Deliver one packet to the next stage, routed to `core`
    fn deliver(&self, packet: Packet, core: CoreId);
}

/// Non-binding placement advice published by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSuggestion {
    /// Flow the suggestion is about
    pub flow_hash: u64,
    /// Where the flow currently runs
    pub from: CoreId,
    /// Where it should run
    pub to: CoreId,
    /// Direction of the move
    pub kind: SuggestionKind,
}

/// Control loop lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Control loop not running (initial, and terminal after teardown)
    Stopped = 0,
    /// Control loop ticking
    Running = 1,
    /// Rate recomputation and suggestions suspended; steering continues
    Paused = 2,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Running,
            2 => EngineState::Paused,
            _ => EngineState::Stopped,
        }
    }
}

/// Fallback flush timer state.
///
/// `Pending` means the timer is running but has not expired yet; the first
/// expiry moves to `Armed`, the second one actually flushes. The two-stage
/// pattern coalesces bursts that arrive close together without delaying
/// delivery indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushArm {
    /// Nothing parked; timer idle
    Idle,
    /// Packets parked; waiting for the first expiry
    Pending,
    /// First expiry passed; next expiry (or next admission) flushes
    Armed,
}

/// Receive-window marker bookkeeping
#[derive(Debug)]
pub(crate) struct MarkerState {
    pub(crate) window_open: bool,
    pub(crate) last_seq: Option<u32>,
}

pub(crate) struct Inner {
    pub(crate) cfg: SteerConfig,
    pub(crate) flows: FlowTable,
    pub(crate) cores: CoreTable,
    pub(crate) filters: FilterSet,
    pub(crate) parked_packets: u64,
    pub(crate) parked_bytes: u64,
    pub(crate) flush_arm: FlushArm,
    pub(crate) marker: MarkerState,
    pub(crate) last_tick: Timestamp,
    pub(crate) deliver: Arc<dyn Deliver>,
    pub(crate) boost: Arc<dyn FreqBoost>,
    pub(crate) stats: Arc<SteerStats>,
    pub(crate) suggestion_tx: Sender<MigrationSuggestion>,
}

/// Flow-aware multi-core receive scheduler.
///
/// Construct once with [`Scheduler::new`], share by `Arc`, and feed packets
/// through [`Scheduler::admit`]. Background behavior (control loop, fallback
/// timer) starts with [`Scheduler::start`] inside a tokio runtime.
pub struct Scheduler {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) stats: Arc<SteerStats>,
    pub(crate) timer_kick: Arc<Notify>,
    state: AtomicU8,
    torn_down: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    suggestion_rx: Mutex<Option<Receiver<MigrationSuggestion>>>,
    pub(crate) cfg: SteerConfig,
}

impl Scheduler {
    /// Build a scheduler over the given topology, egress and boost hooks
    pub fn new(
        cfg: SteerConfig,
        deliver: Arc<dyn Deliver>,
        boost: Arc<dyn FreqBoost>,
    ) -> SteerResult<Arc<Self>> {
        cfg.validate()
            .map_err(|e| SteerError::ConfigError(e.to_string()))?;

        let now = Timestamp::now();
        let clusters: Vec<_> = cfg.cores.iter().map(|p| p.cluster).collect();
        let stats = Arc::new(SteerStats::default());
        let (tx, rx) = bounded(cfg.suggestion_depth);

        let inner = Inner {
            flows: FlowTable::new(cfg.max_flows),
            cores: CoreTable::new(&clusters, now),
            filters: FilterSet::new(cfg.max_filters),
            parked_packets: 0,
            parked_bytes: 0,
            flush_arm: FlushArm::Idle,
            marker: MarkerState {
                window_open: false,
                last_seq: None,
            },
            last_tick: now,
            deliver,
            boost,
            stats: stats.clone(),
            suggestion_tx: tx,
            cfg: cfg.clone(),
        };

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
            stats,
            timer_kick: Arc::new(Notify::new()),
            state: AtomicU8::new(EngineState::Stopped as u8),
            torn_down: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            suggestion_rx: Mutex::new(Some(rx)),
            cfg,
        }))
    }

    /// Current control-loop lifecycle state
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start the control loop and the fallback flush timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> SteerResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SteerError::NotRunning);
        }
        if self
            .state
            .compare_exchange(
                EngineState::Stopped as u8,
                EngineState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(SteerError::AlreadyRunning);
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(tx);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(crate::control::control_task(
            self.clone(),
            rx.clone(),
        )));
        tasks.push(tokio::spawn(crate::triggers::fallback_timer_task(
            self.clone(),
            rx,
        )));

        tracing::info!(cores = self.cfg.num_cores(), "steering engine started");
        Ok(())
    }

    /// Suspend rate recomputation and suggestion issuance.
    ///
    /// Admission, parking and flushing continue; intended for host
    /// low-power transitions.
    pub fn pause(&self) -> SteerResult<()> {
        self.state
            .compare_exchange(
                EngineState::Running as u8,
                EngineState::Paused as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| SteerError::NotRunning)?;
        tracing::info!("control loop paused");
        Ok(())
    }

    /// Resume from [`Scheduler::pause`]
    pub fn resume(&self) -> SteerResult<()> {
        self.state
            .compare_exchange(
                EngineState::Paused as u8,
                EngineState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| SteerError::NotRunning)?;
        tracing::info!("control loop resumed");
        Ok(())
    }

    /// Tear the engine down: cancel background work, then force-drain every
    /// flow to its assigned core and reclaim all state.
    pub fn shutdown(&self) {
        self.teardown(false);
    }

    /// Tear down discarding parked packets instead of delivering them.
    ///
    /// Shutdown-only policy for hosts whose delivery surface is already
    /// gone.
    pub fn shutdown_discard(&self) {
        self.teardown(true);
    }

    fn teardown(&self, discard: bool) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state
            .store(EngineState::Stopped as u8, Ordering::Release);

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let mut g = self.inner.lock();
        let inner = &mut *g;
        inner.flush_arm = FlushArm::Idle;
        if !discard {
            inner.flush_all(true, crate::stats::FlushReason::Shutdown);
        }
        for idx in inner.flows.indices() {
            if let Some(rec) = inner.flows.remove(idx) {
                inner.cores.unassign(rec.assigned_core, idx);
            }
        }
        for state in inner.cores.iter_mut() {
            state.parked_len = 0;
        }
        inner.parked_packets = 0;
        inner.parked_bytes = 0;
        tracing::info!(discard, "steering engine stopped");
    }

    /// Whether teardown has completed
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    // ========================================================================
    // Administrative surface
    // ========================================================================

    /// Replace the banned and reserved core masks
    pub fn set_core_masks(&self, banned: CoreMask, reserved: CoreMask) {
        let mut g = self.inner.lock();
        g.cores.set_masks(banned, reserved);
        tracing::debug!(banned = banned.0, reserved = reserved.0, "core masks updated");
    }

    /// Mark a worker core online or offline.
    ///
    /// Flows assigned to an offline core are reassigned unconditionally at
    /// their next flush.
    pub fn set_core_online(&self, core: CoreId, online: bool) -> SteerResult<()> {
        let mut g = self.inner.lock();
        if core.index() >= g.cores.len() {
            return Err(SteerError::InvalidCore(core));
        }
        g.cores.set_online(core, online);
        tracing::info!(%core, online, "core availability changed");
        Ok(())
    }

    /// Install a low-latency classification rule
    pub fn install_filter(&self, rule: FilterRule) -> SteerResult<()> {
        self.inner.lock().filters.install(rule)
    }

    /// Remove a previously installed classification rule
    pub fn remove_filter(&self, rule: &FilterRule) -> SteerResult<()> {
        self.inner.lock().filters.remove(rule)
    }

    /// Apply a placement hint from the external tuning agent.
    ///
    /// The flow migrates at its next flush, still gated by the ordering-safe
    /// watermark rule.
    pub fn apply_migration_suggestion(&self, flow_hash: u64, core: CoreId) -> SteerResult<()> {
        let mut g = self.inner.lock();
        if core.index() >= g.cores.len() {
            return Err(SteerError::InvalidCore(core));
        }
        let idx = g
            .flows
            .lookup(flow_hash)
            .ok_or(SteerError::FlowNotFound(flow_hash))?;
        if let Some(rec) = g.flows.get_mut(idx) {
            rec.steer_hint = Some(core);
        }
        Ok(())
    }

    /// Record that `count` packets were consumed by the next stage on `core`
    pub fn note_processed(&self, core: CoreId, count: u64) {
        let mut g = self.inner.lock();
        if let Some(state) = g.cores.get_mut(core) {
            state.processed_count += count;
        }
    }

    /// Record `count` packets that arrived at `core` outside this engine
    pub fn note_enqueued(&self, core: CoreId, count: u64) {
        let mut g = self.inner.lock();
        if let Some(state) = g.cores.get_mut(core) {
            state.enqueued_count += count;
        }
    }

    /// Take the migration-suggestion receiver; yields once
    pub fn suggestions(&self) -> Option<Receiver<MigrationSuggestion>> {
        self.suggestion_rx.lock().take()
    }

    // ========================================================================
    // Telemetry
    // ========================================================================

    /// Consistent-per-structure snapshot of the engine
    pub fn query_stats(&self) -> SteerSnapshot {
        let g = self.inner.lock();
        SteerSnapshot {
            totals: self.stats.totals(),
            live_flows: g.flows.len(),
            parked_packets: g.parked_packets,
            parked_bytes: g.parked_bytes,
            installed_filters: g.filters.len(),
            cores: g.cores.iter().map(|c| c.snapshot()).collect(),
        }
    }

    /// Snapshot of one flow, if live
    pub fn flow_snapshot(&self, flow_hash: u64) -> Option<FlowSnapshot> {
        let g = self.inner.lock();
        let idx = g.flows.lookup(flow_hash)?;
        let rec = g.flows.get(idx)?;
        Some(FlowSnapshot {
            flow_hash: rec.flow_hash,
            assigned_core: rec.assigned_core,
            parked: rec.parked_len() as u64,
            packet_count: rec.packet_count,
            byte_count: rec.byte_count,
            avg_pps: rec.avg_pps,
            rx_pps: rec.rx_pps,
            enqueue_watermark: rec.enqueue_watermark,
            latency_class: rec.latency_class,
            inactivity_ns: rec.inactivity_ns,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == EngineState::Running as u8
    }
}

impl Inner {
    /// Preferred-cluster eligible mask for a brand new flow
    pub(crate) fn new_flow_mask(&self) -> CoreMask {
        let eligible = self.cores.eligible_mask();
        crate::select::prefer_cluster(eligible, self.cfg.low_power_mask())
    }

    /// All live flow indices assigned to one core
    pub(crate) fn core_flow_indices(&self, core: CoreId) -> Vec<FlowIdx> {
        self.cores
            .get(core)
            .map(|c| c.assigned_flows.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Engine-wide telemetry snapshot
#[derive(Debug, Clone)]
pub struct SteerSnapshot {
    /// Global admission/flush totals
    pub totals: TotalsSnapshot,
    /// Live flow records
    pub live_flows: usize,
    /// Packets parked right now
    pub parked_packets: u64,
    /// Bytes parked right now
    pub parked_bytes: u64,
    /// Installed classification rules
    pub installed_filters: usize,
    /// Per-core view
    pub cores: Vec<CoreSnapshot>,
}

/// Telemetry snapshot of one flow
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    /// Flow hash
    pub flow_hash: u64,
    /// Current placement
    pub assigned_core: CoreId,
    /// Packets parked right now
    pub parked: u64,
    /// Total packets since creation
    pub packet_count: u64,
    /// Total bytes since creation
    pub byte_count: u64,
    /// Blended rate estimate
    pub avg_pps: u64,
    /// Instantaneous rate at the last tick
    pub rx_pps: u64,
    /// Watermark gating the next migration
    pub enqueue_watermark: u64,
    /// Latency classification
    pub latency_class: LatencyClass,
    /// Time since the flow last produced a packet
    pub inactivity_ns: u64,
}


#[cfg(test)]
mod tests {
    use super::testutil::RecordingDeliver;
    use super::*;
    use crate::freq::NoopBoost;

    fn scheduler() -> (Arc<Scheduler>, Arc<RecordingDeliver>) {
        let deliver = RecordingDeliver::new();
        let sched = Scheduler::new(
            SteerConfig::default(),
            deliver.clone(),
            Arc::new(NoopBoost),
        )
        .unwrap();
        (sched, deliver)
    }

    #[test]
    fn test_initial_state() {
        let (sched, _) = scheduler();
        assert_eq!(sched.state(), EngineState::Stopped);
        let snap = sched.query_stats();
        assert_eq!(snap.live_flows, 0);
        assert_eq!(snap.parked_packets, 0);
        assert_eq!(snap.cores.len(), 8);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = SteerConfig {
            cores: vec![],
            ..Default::default()
        };
        assert!(Scheduler::new(cfg, RecordingDeliver::new(), Arc::new(NoopBoost)).is_err());
    }

    #[test]
    fn test_admin_mask_and_online() {
        let (sched, _) = scheduler();
        sched.set_core_masks(CoreMask(0b0001), CoreMask::EMPTY);
        sched.set_core_online(CoreId(1), false).unwrap();
        assert!(sched.set_core_online(CoreId(200), false).is_err());

        let g = sched.inner.lock();
        assert!(!g.cores.is_eligible(CoreId(0)));
        assert!(!g.cores.is_eligible(CoreId(1)));
        assert!(g.cores.is_eligible(CoreId(2)));
    }

    #[test]
    fn test_filter_admin() {
        let (sched, _) = scheduler();
        let rule = FilterRule::dst_port(7777);
        sched.install_filter(rule.clone()).unwrap();
        assert!(matches!(
            sched.install_filter(rule.clone()),
            Err(SteerError::DuplicateFilter)
        ));
        sched.remove_filter(&rule).unwrap();
        assert_eq!(sched.query_stats().installed_filters, 0);
    }

    #[test]
    fn test_suggestion_receiver_takes_once() {
        let (sched, _) = scheduler();
        assert!(sched.suggestions().is_some());
        assert!(sched.suggestions().is_none());
    }

    #[test]
    fn test_counter_feeds() {
        let (sched, _) = scheduler();
        sched.note_enqueued(CoreId(1), 1000);
        sched.note_processed(CoreId(1), 480);
        let snap = sched.query_stats();
        assert_eq!(snap.cores[1].enqueued_count, 1000);
        assert_eq!(snap.cores[1].processed_count, 480);
        assert_eq!(snap.cores[1].backlog, 520);
    }

    #[test]
    fn test_shutdown_drains_parked_packets() {
        use bytes::Bytes;
        use std::net::Ipv4Addr;
        use steer_common::{FlowKey, PROTO_UDP};

        let key = FlowKey::from_v4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1234,
            443,
            PROTO_UDP,
        );

        let (sched, deliver) = scheduler();
        sched.inner.lock().marker.window_open = true;
        for _ in 0..3 {
            sched.admit(Packet::from_key(key, Bytes::from_static(&[0u8; 64])));
        }
        assert_eq!(sched.query_stats().parked_packets, 3);

        sched.shutdown();
        assert_eq!(deliver.count(), 3);
        assert_eq!(sched.query_stats().live_flows, 0);

        // Discarding teardown is covered separately: nothing delivered
        let (sched, deliver) = scheduler();
        sched.inner.lock().marker.window_open = true;
        for _ in 0..3 {
            sched.admit(Packet::from_key(key, Bytes::from_static(&[0u8; 64])));
        }
        sched.shutdown_discard();
        assert_eq!(deliver.count(), 0);
        assert_eq!(sched.query_stats().live_flows, 0);
        assert_eq!(sched.query_stats().parked_packets, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (sched, _) = scheduler();
        assert!(sched.pause().is_err());

        sched.start().unwrap();
        assert_eq!(sched.state(), EngineState::Running);
        assert!(matches!(sched.start(), Err(SteerError::AlreadyRunning)));

        sched.pause().unwrap();
        assert_eq!(sched.state(), EngineState::Paused);
        sched.resume().unwrap();
        assert_eq!(sched.state(), EngineState::Running);

        sched.shutdown();
        assert_eq!(sched.state(), EngineState::Stopped);
        assert!(sched.is_torn_down());
        assert!(sched.start().is_err());
    }
}
