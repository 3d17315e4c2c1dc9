//! Engine statistics
//!
//! Lock-free counters recording why flushes happened, why flows moved
//! between cores, and which soft errors were absorbed on the hot path.
//! Everything is `Relaxed`; telemetry readers get per-struct-consistent
//! snapshots, not a globally atomic view.

use std::sync::atomic::{AtomicU64, Ordering};

/// Why a flush cycle ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Parked-packet store limit exceeded
    PacketLimit,
    /// Parked-byte store limit exceeded
    ByteLimit,
    /// Fallback timer fired
    TimerExpiry,
    /// Receive-window-end marker
    Marker,
    /// Marker bookkeeping was out of step; flushed for availability
    MarkerRecovery,
    /// Control loop drained one overloaded core
    CoreFlush,
    /// Overload cooldown expired; reset drain
    CoreReset,
    /// No marker source configured; opportunistic flush after admission
    Opportunistic,
    /// Flow drained prior to eviction
    Eviction,
    /// Engine teardown drain
    Shutdown,
}

/// Why a flow changed cores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Watermark reached; ordering-safe migration
    Watermark,
    /// Old core had no backlog at all
    ZeroBacklog,
    /// Forced flush overrode the watermark gate
    Forced,
    /// Assigned core went offline or was banned
    CoreLost,
    /// Orphaned flow drained to the default core
    DefaultFallback,
}

/// Soft errors absorbed without failing the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftError {
    /// Live-flow cap reached; packet bypassed classification
    CapacityBypass,
    /// Selection policy found no eligible core
    NoEligibleCore,
    /// Marker sequence observed out of order
    MarkerOutOfOrder,
    /// Suggestion channel was full; suggestion dropped
    SuggestionDropped,
    /// Frequency boost request failed
    BoostFailed,
}

/// Global engine counters
#[derive(Debug, Default)]
pub struct SteerStats {
    /// Packets delivered on the low-latency fast path
    pub fast_path: AtomicU64,
    /// Packets parked for ordered delivery
    pub parked: AtomicU64,
    /// Packets delivered unclassified
    pub bypassed: AtomicU64,
    /// Packets delivered by the flush engine
    pub flushed: AtomicU64,
    /// Bytes delivered by the flush engine
    pub flushed_bytes: AtomicU64,
    /// Flow records created
    pub flows_created: AtomicU64,
    /// Flow records evicted
    pub flows_evicted: AtomicU64,
    /// Packets observed arriving out of watermark order during forced moves
    pub ooo_packets: AtomicU64,
    /// Control loop ticks executed
    pub control_ticks: AtomicU64,
    /// Migration suggestions emitted
    pub suggestions: AtomicU64,

    packet_limit_flush: AtomicU64,
    byte_limit_flush: AtomicU64,
    timer_flush: AtomicU64,
    marker_flush: AtomicU64,
    marker_recovery_flush: AtomicU64,
    core_flush: AtomicU64,
    core_reset_flush: AtomicU64,
    opportunistic_flush: AtomicU64,
    eviction_flush: AtomicU64,
    shutdown_flush: AtomicU64,

    watermark_switch: AtomicU64,
    zero_backlog_switch: AtomicU64,
    forced_switch: AtomicU64,
    core_lost_switch: AtomicU64,
    default_fallback_switch: AtomicU64,

    capacity_bypass: AtomicU64,
    no_eligible_core: AtomicU64,
    marker_out_of_order: AtomicU64,
    suggestion_dropped: AtomicU64,
    boost_failed: AtomicU64,
}

impl SteerStats {
    #[inline(always)]
    pub(crate) fn record_flush(&self, reason: FlushReason) {
        let ctr = match reason {
            FlushReason::PacketLimit => &self.packet_limit_flush,
            FlushReason::ByteLimit => &self.byte_limit_flush,
            FlushReason::TimerExpiry => &self.timer_flush,
            FlushReason::Marker => &self.marker_flush,
            FlushReason::MarkerRecovery => &self.marker_recovery_flush,
            FlushReason::CoreFlush => &self.core_flush,
            FlushReason::CoreReset => &self.core_reset_flush,
            FlushReason::Opportunistic => &self.opportunistic_flush,
            FlushReason::Eviction => &self.eviction_flush,
            FlushReason::Shutdown => &self.shutdown_flush,
        };
        ctr.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_switch(&self, reason: SwitchReason) {
        let ctr = match reason {
            SwitchReason::Watermark => &self.watermark_switch,
            SwitchReason::ZeroBacklog => &self.zero_backlog_switch,
            SwitchReason::Forced => &self.forced_switch,
            SwitchReason::CoreLost => &self.core_lost_switch,
            SwitchReason::DefaultFallback => &self.default_fallback_switch,
        };
        ctr.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_soft_error(&self, err: SoftError) {
        let ctr = match err {
            SoftError::CapacityBypass => &self.capacity_bypass,
            SoftError::NoEligibleCore => &self.no_eligible_core,
            SoftError::MarkerOutOfOrder => &self.marker_out_of_order,
            SoftError::SuggestionDropped => &self.suggestion_dropped,
            SoftError::BoostFailed => &self.boost_failed,
        };
        ctr.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads of one flush-reason counter
    pub fn flushes(&self, reason: FlushReason) -> u64 {
        let ctr = match reason {
            FlushReason::PacketLimit => &self.packet_limit_flush,
            FlushReason::ByteLimit => &self.byte_limit_flush,
            FlushReason::TimerExpiry => &self.timer_flush,
            FlushReason::Marker => &self.marker_flush,
            FlushReason::MarkerRecovery => &self.marker_recovery_flush,
            FlushReason::CoreFlush => &self.core_flush,
            FlushReason::CoreReset => &self.core_reset_flush,
            FlushReason::Opportunistic => &self.opportunistic_flush,
            FlushReason::Eviction => &self.eviction_flush,
            FlushReason::Shutdown => &self.shutdown_flush,
        };
        ctr.load(Ordering::Relaxed)
    }

    /// Reads of one switch-reason counter
    pub fn switches(&self, reason: SwitchReason) -> u64 {
        let ctr = match reason {
            SwitchReason::Watermark => &self.watermark_switch,
            SwitchReason::ZeroBacklog => &self.zero_backlog_switch,
            SwitchReason::Forced => &self.forced_switch,
            SwitchReason::CoreLost => &self.core_lost_switch,
            SwitchReason::DefaultFallback => &self.default_fallback_switch,
        };
        ctr.load(Ordering::Relaxed)
    }

    /// Reads of one soft-error counter
    pub fn soft_errors(&self, err: SoftError) -> u64 {
        let ctr = match err {
            SoftError::CapacityBypass => &self.capacity_bypass,
            SoftError::NoEligibleCore => &self.no_eligible_core,
            SoftError::MarkerOutOfOrder => &self.marker_out_of_order,
            SoftError::SuggestionDropped => &self.suggestion_dropped,
            SoftError::BoostFailed => &self.boost_failed,
        };
        ctr.load(Ordering::Relaxed)
    }

    /// Snapshot of the admission/flush totals
    pub fn totals(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            fast_path: self.fast_path.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            flushed_bytes: self.flushed_bytes.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            ooo_packets: self.ooo_packets.load(Ordering::Relaxed),
            control_ticks: self.control_ticks.load(Ordering::Relaxed),
            suggestions: self.suggestions.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic snapshot of the global totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TotalsSnapshot {
    /// Packets delivered on the low-latency fast path
    pub fast_path: u64,
    /// Packets parked
    pub parked: u64,
    /// Packets bypassed
    pub bypassed: u64,
    /// Packets flushed
    pub flushed: u64,
    /// Bytes flushed
    pub flushed_bytes: u64,
    /// Flows created
    pub flows_created: u64,
    /// Flows evicted
    pub flows_evicted: u64,
    /// Out-of-watermark packets during forced moves
    pub ooo_packets: u64,
    /// Control ticks
    pub control_ticks: u64,
    /// Suggestions emitted
    pub suggestions: u64,
}

impl TotalsSnapshot {
    /// Every admitted packet took exactly one of the three paths
    pub fn admitted(&self) -> u64 {
        self.fast_path + self.parked + self.bypassed
    }
}
