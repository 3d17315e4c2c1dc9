//! Engine configuration
//!
//! Every empirically tuned threshold, weight and duration the steering
//! algorithm depends on lives here. Defaults reflect a typical
//! 8-core 2-cluster part; embedders are expected to override per topology.

use serde::{Deserialize, Serialize};
use steer_common::{ClusterClass, CoreId, CoreMask};
use thiserror::Error;

/// Rejected topology or tuning values
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The topology has no cores
    #[error("at least one core is required")]
    NoCores,

    /// More cores than the mask representation supports
    #[error("at most {0} cores supported")]
    TooManyCores(usize),

    /// A configured core id falls outside the topology
    #[error("core {0} outside topology")]
    CoreOutsideTopology(CoreId),

    /// Blend weight must be a percentage
    #[error("ewma weight must be 0..=100, got {0}")]
    BadWeight(u16),
}

/// Per-core tunables derived from the cluster class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreProfile {
    /// Cluster the core belongs to
    pub cluster: ClusterClass,
    /// Sustained packet rate ceiling (pkts/sec) before the core counts as
    /// overloaded
    pub max_pps: u64,
    /// Rate floor (pkts/sec) below which a flow placed here is a candidate
    /// to move back to the low-power cluster
    pub min_pps: u64,
    /// Backlog (enqueued minus processed, plus parked) ceiling
    pub max_backlog: u64,
    /// Packets within one burst sampling interval before the core counts as
    /// overloaded
    pub max_burst: u64,
}

impl CoreProfile {
    /// Profile for a low-power (efficiency) core
    pub fn low_power() -> Self {
        Self {
            cluster: ClusterClass::LowPower,
            max_pps: 100_000,
            min_pps: 0,
            max_backlog: 1_100,
            max_burst: 3_100,
        }
    }

    /// Profile for a performance core
    pub fn performance() -> Self {
        Self {
            cluster: ClusterClass::Performance,
            max_pps: 210_000,
            min_pps: 40_000,
            max_backlog: 1_100,
            max_burst: 3_100,
        }
    }
}

/// Steering engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteerConfig {
    /// One profile per worker core; index is the core id
    pub cores: Vec<CoreProfile>,
    /// Core that orphaned flows drain to when nothing else is eligible
    pub default_core: CoreId,
    /// Dedicated core for latency-sensitive flows; `None` keeps such flows
    /// on their assigned core
    pub low_latency_core: Option<CoreId>,

    /// Maximum live flow records; admission bypasses classification beyond
    /// this
    pub max_flows: usize,
    /// Maximum installed low-latency classification rules
    pub max_filters: usize,

    /// Parked-packet count across all flows that forces a full flush
    pub max_parked_packets: u64,
    /// Parked-byte count across all flows that forces a full flush
    pub max_parked_bytes: u64,

    /// Fallback flush timer period (ms)
    pub fallback_timeout_ms: u64,
    /// Whether the fallback timer is armed at all
    pub fallback_timer: bool,
    /// Whether an external marker source drives flushing; when false every
    /// admission ends with an opportunistic flush
    pub marker_flush: bool,

    /// Control loop period (ms)
    pub control_period_ms: u64,
    /// Weight (0..=100) given to history in the per-flow rate blend
    pub ewma_weight: u16,

    /// Base flow inactivity threshold before eviction (ms)
    pub inactivity_ms: u64,
    /// (live-flow count, tightened threshold ms) ladder applied in order
    pub inactivity_ladder: Vec<(usize, u64)>,

    /// How long an overloaded core keeps its flows prioritized before the
    /// reset flush (ms)
    pub core_wait_ms: u64,
    /// Burst sampling interval for per-core instantaneous rate (ms)
    pub burst_interval_ms: u64,
    /// React to per-core burst pressure inline on the flush path rather
    /// than waiting for the next control tick
    pub instant_rate_switch: bool,

    /// Frequency floor (kHz) requested for low-power cores under overload
    pub boost_floor_khz: u32,
    /// Whether frequency boost requests are issued at all
    pub freq_boost: bool,

    /// Deferred flush cycles an orphaned flow may wait for an eligible core
    /// before draining to `default_core`
    pub max_reassign_retries: u32,
    /// Apply migration decisions directly instead of only emitting
    /// suggestions
    pub autonomous: bool,
    /// Capacity of the migration-suggestion channel
    pub suggestion_depth: usize,
}

impl Default for SteerConfig {
    fn default() -> Self {
        Self {
            cores: vec![
                CoreProfile::low_power(),
                CoreProfile::low_power(),
                CoreProfile::low_power(),
                CoreProfile::low_power(),
                CoreProfile::performance(),
                CoreProfile::performance(),
                CoreProfile::performance(),
                CoreProfile::performance(),
            ],
            default_core: CoreId(0),
            low_latency_core: None,
            max_flows: 700,
            max_filters: 100,
            max_parked_packets: 24_000,
            max_parked_bytes: 30_144_000,
            fallback_timeout_ms: 6,
            fallback_timer: true,
            marker_flush: true,
            control_period_ms: 100,
            ewma_weight: 80,
            inactivity_ms: 15_000,
            inactivity_ladder: vec![(140, 2_000), (70, 8_000)],
            core_wait_ms: 10,
            burst_interval_ms: 20,
            instant_rate_switch: false,
            boost_floor_khz: 1_400_000,
            freq_boost: true,
            max_reassign_retries: 3,
            autonomous: true,
            suggestion_depth: 256,
        }
    }
}

impl SteerConfig {
    /// Number of worker cores in the topology
    #[inline(always)]
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// Mask of every configured core
    pub fn all_cores(&self) -> CoreMask {
        CoreMask::first(self.cores.len())
    }

    /// Mask of the low-power cluster
    pub fn low_power_mask(&self) -> CoreMask {
        self.cores
            .iter()
            .enumerate()
            .filter(|(_, p)| p.cluster == ClusterClass::LowPower)
            .map(|(i, _)| CoreId(i as u8))
            .collect()
    }

    /// Mask of the performance cluster
    pub fn performance_mask(&self) -> CoreMask {
        self.cores
            .iter()
            .enumerate()
            .filter(|(_, p)| p.cluster == ClusterClass::Performance)
            .map(|(i, _)| CoreId(i as u8))
            .collect()
    }

    /// Cluster mask for a given class
    pub fn cluster_mask(&self, cluster: ClusterClass) -> CoreMask {
        match cluster {
            ClusterClass::LowPower => self.low_power_mask(),
            ClusterClass::Performance => self.performance_mask(),
        }
    }

    /// Inactivity threshold (ns) effective at the given live-flow count.
    ///
    /// Book-keeping is shed faster when many flows are live.
    pub fn inactivity_threshold_ns(&self, live_flows: usize) -> u64 {
        for &(limit, ms) in &self.inactivity_ladder {
            if live_flows > limit {
                return ms * 1_000_000;
            }
        }
        self.inactivity_ms * 1_000_000
    }

    /// Validate topology-dependent fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cores.is_empty() {
            return Err(ConfigError::NoCores);
        }
        if self.cores.len() > steer_common::MAX_CORES {
            return Err(ConfigError::TooManyCores(steer_common::MAX_CORES));
        }
        if self.default_core.index() >= self.cores.len() {
            return Err(ConfigError::CoreOutsideTopology(self.default_core));
        }
        if let Some(ll) = self.low_latency_core {
            if ll.index() >= self.cores.len() {
                return Err(ConfigError::CoreOutsideTopology(ll));
            }
        }
        if self.ewma_weight > 100 {
            return Err(ConfigError::BadWeight(self.ewma_weight));
        }
        Ok(())
    }
}
