//! Flush triggers
//!
//! The byte/packet store limits live on the admission path (`admit.rs`).
//! This module covers the out-of-band triggers: receive-window markers from
//! the lower layer, and the two-stage fallback timer that guarantees parked
//! packets are delivered even when markers never arrive.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use steer_common::MarkerKind;

use crate::scheduler::{FlushArm, Scheduler};
use crate::stats::{FlushReason, SoftError};

impl Scheduler {
    /// Receive-window marker from the lower layer (out-of-band path).
    ///
    /// A window end flushes everything unconditionally; this is the primary
    /// low-latency flush path when the link provides markers. Sequence
    /// anomalies are counted and never block flushing.
    pub fn on_marker(&self, marker: MarkerKind) {
        let mut g = self.inner.lock();
        let inner = &mut *g;
        match marker {
            MarkerKind::WindowStart { seq } => {
                if let Some(last) = inner.marker.last_seq {
                    if seq <= last {
                        inner.stats.record_soft_error(SoftError::MarkerOutOfOrder);
                        tracing::warn!(seq, last, "window start out of order");
                    }
                }
                inner.marker.last_seq =
                    Some(inner.marker.last_seq.map_or(seq, |last| last.max(seq)));

                // A new window while the previous one never closed means the
                // trailer was lost; drain rather than hold the backlog
                if inner.parked_packets > 0 && inner.marker.window_open {
                    inner.flush_all(false, FlushReason::MarkerRecovery);
                }
                inner.marker.window_open = true;
            }
            MarkerKind::WindowEnd { seq } => {
                if let Some(last) = inner.marker.last_seq {
                    if seq < last {
                        inner.stats.record_soft_error(SoftError::MarkerOutOfOrder);
                        tracing::warn!(seq, last, "window end out of order");
                    }
                }
                inner.marker.last_seq =
                    Some(inner.marker.last_seq.map_or(seq, |last| last.max(seq)));
                inner.marker.window_open = false;

                if inner.parked_packets > 0 {
                    inner.flush_all(true, FlushReason::Marker);
                }
            }
        }
    }
}

/// Two-stage fallback flush timer.
///
/// Armed when the first packet parks after an empty state. The first expiry
/// only marks the engine armed, coalescing bursts that arrive close
/// together; the second expiry with packets still parked performs the
/// full-table forced flush here, off the packet path. Self-cancels once
/// nothing is parked.
pub(crate) async fn fallback_timer_task(
    sched: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !sched.cfg.fallback_timer {
        return;
    }
    let timeout = Duration::from_millis(sched.cfg.fallback_timeout_ms.max(1));

    loop {
        tokio::select! {
            _ = sched.timer_kick.notified() => {}
            _ = shutdown.changed() => return,
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = shutdown.changed() => return,
            }

            let mut g = sched.inner.lock();
            if g.parked_packets == 0 {
                g.flush_arm = FlushArm::Idle;
                break;
            }
            match g.flush_arm {
                FlushArm::Pending | FlushArm::Idle => {
                    g.flush_arm = FlushArm::Armed;
                }
                FlushArm::Armed => {
                    g.flush_all(true, FlushReason::TimerExpiry);
                    if g.parked_packets == 0 {
                        g.flush_arm = FlushArm::Idle;
                        break;
                    }
                    g.flush_arm = FlushArm::Pending;
                }
            }
        }
    }
}
