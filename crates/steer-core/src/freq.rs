//! Frequency boost advisor
//!
//! Thin seam to the platform's frequency QoS mechanism. The control loop
//! requests a temporary minimum-frequency floor for the low-power cluster
//! when it detects overload and drops the request once the cooldown ends.
//! Performance cores are never floored. Failures are counted by the caller,
//! never propagated.

use parking_lot::Mutex;
use steer_common::CoreMask;

/// Platform hook for per-core frequency floors
pub trait FreqBoost: Send + Sync {
    /// Request a minimum frequency for every core in `cores`.
    ///
    /// Returns false if the platform rejected the request.
    fn raise_floor(&self, cores: CoreMask, floor_khz: u32) -> bool;

    /// Drop any previously requested floor for `cores`
    fn reset_floor(&self, cores: CoreMask) -> bool;
}

/// Advisor that ignores all requests (hosts without frequency control)
#[derive(Debug, Default)]
pub struct NoopBoost;

impl FreqBoost for NoopBoost {
    fn raise_floor(&self, _cores: CoreMask, _floor_khz: u32) -> bool {
        true
    }

    fn reset_floor(&self, _cores: CoreMask) -> bool {
        true
    }
}

/// A boost request or reset, as observed by [`RecordingBoost`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostEvent {
    /// Floor raised for the masked cores
    Raised {
        /// Cores affected
        cores: CoreMask,
        /// Requested floor (kHz)
        floor_khz: u32,
    },
    /// Floor dropped for the masked cores
    Reset {
        /// Cores affected
        cores: CoreMask,
    },
}

/// Advisor that records every request; used by tests and soak telemetry
#[derive(Debug, Default)]
pub struct RecordingBoost {
    events: Mutex<Vec<BoostEvent>>,
}

impl RecordingBoost {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events observed so far
    pub fn events(&self) -> Vec<BoostEvent> {
        self.events.lock().clone()
    }
}

impl FreqBoost for RecordingBoost {
    fn raise_floor(&self, cores: CoreMask, floor_khz: u32) -> bool {
        self.events.lock().push(BoostEvent::Raised { cores, floor_khz });
        true
    }

    fn reset_floor(&self, cores: CoreMask) -> bool {
        self.events.lock().push(BoostEvent::Reset { cores });
        true
    }
}
