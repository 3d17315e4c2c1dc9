//! Core selection policy
//!
//! Pure functions over the per-core state: no side effects, deterministic
//! for a given load picture. Two entry points exist because new flows and
//! migrating flows scan in opposite directions; both honor the same
//! priority order of idle > semi-idle > least-loaded.

use steer_common::{CoreId, CoreMask};

use crate::cores::CoreTable;

/// Pick a core for a migrating flow.
///
/// In order of priority:
///   1) the highest-indexed fully idle core (zero assigned flows)
///   2) among cores with zero measured rate but nonzero flows, the one
///      with the fewest flows
///   3) the core with the lowest measured rate
///
/// Scanning from the top index keeps the choice deterministic and avoids
/// oscillation against the ascending new-flow scan. Returns `None` when
/// `eligible` is empty; the caller falls back to the flow's current core.
pub fn select_core(cores: &CoreTable, eligible: CoreMask) -> Option<CoreId> {
    let mut min_pps = u64::MAX;
    let mut min_flows = usize::MAX;
    let mut least_loaded: Option<CoreId> = None;
    let mut semi_idle: Option<CoreId> = None;

    for core_id in eligible.iter_rev() {
        let state = match cores.get(core_id) {
            Some(s) => s,
            None => continue,
        };

        let flows = state.assigned_flows.len();
        if flows == 0 {
            // Multiple free cores: the first one scanned wins
            return Some(core_id);
        }

        if state.rx_pps == 0 && flows < min_flows {
            min_flows = flows;
            semi_idle = Some(core_id);
        }

        if state.rx_pps <= min_pps {
            min_pps = state.rx_pps;
            least_loaded = Some(core_id);
        }
    }

    semi_idle.or(least_loaded)
}

/// Pick a core for a newly observed flow.
///
/// First free core in ascending index order, otherwise the core with the
/// fewest assigned flows. Back-to-back new flows therefore spread across
/// idle cores instead of piling onto one.
pub fn select_for_new_flow(cores: &CoreTable, eligible: CoreMask) -> Option<CoreId> {
    let mut min_flows = usize::MAX;
    let mut fallback: Option<CoreId> = None;

    for core_id in eligible.iter() {
        let state = match cores.get(core_id) {
            Some(s) => s,
            None => continue,
        };

        let flows = state.assigned_flows.len();
        if flows == 0 {
            return Some(core_id);
        }
        if flows < min_flows {
            min_flows = flows;
            fallback = Some(core_id);
        }
    }

    fallback
}

/// Restrict `eligible` to the preferred cluster, unless that would leave
/// nothing to choose from
pub fn prefer_cluster(eligible: CoreMask, cluster: CoreMask) -> CoreMask {
    let preferred = eligible.and(cluster);
    if preferred.is_empty() {
        eligible
    } else {
        preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steer_common::{ClusterClass, Timestamp};

    use crate::flow::FlowIdx;

    fn table(n: usize) -> CoreTable {
        let clusters = vec![ClusterClass::LowPower; n];
        CoreTable::new(&clusters, Timestamp::from_nanos(0))
    }

    #[test]
    fn test_new_flow_prefers_first_idle() {
        let mut cores = table(4);
        cores.assign(CoreId(0), FlowIdx(1));
        let eligible = CoreMask::first(4);
        assert_eq!(select_for_new_flow(&cores, eligible), Some(CoreId(1)));
    }

    #[test]
    fn test_new_flow_fewest_flows_fallback() {
        let mut cores = table(3);
        cores.assign(CoreId(0), FlowIdx(1));
        cores.assign(CoreId(0), FlowIdx(2));
        cores.assign(CoreId(1), FlowIdx(3));
        cores.assign(CoreId(2), FlowIdx(4));
        cores.assign(CoreId(2), FlowIdx(5));
        let eligible = CoreMask::first(3);
        assert_eq!(select_for_new_flow(&cores, eligible), Some(CoreId(1)));
    }

    #[test]
    fn test_select_idle_wins_from_top() {
        let mut cores = table(4);
        cores.assign(CoreId(1), FlowIdx(1));
        let eligible = CoreMask::first(4);
        // Cores 3, 2 and 0 are idle; descending scan returns 3
        assert_eq!(select_core(&cores, eligible), Some(CoreId(3)));
    }

    #[test]
    fn test_select_semi_idle_beats_loaded() {
        let mut cores = table(3);
        for i in 0..3 {
            cores.assign(CoreId(i), FlowIdx(i as usize));
        }
        cores.assign(CoreId(0), FlowIdx(10));
        cores.get_mut(CoreId(1)).unwrap().rx_pps = 50_000;
        // Core 2: one flow, zero rate (semi-idle); core 0: two flows, zero
        // rate; core 1: active
        let eligible = CoreMask::first(3);
        assert_eq!(select_core(&cores, eligible), Some(CoreId(2)));
    }

    #[test]
    fn test_select_least_rate_when_all_active() {
        let mut cores = table(3);
        for i in 0..3u8 {
            cores.assign(CoreId(i), FlowIdx(i as usize));
            cores.get_mut(CoreId(i)).unwrap().rx_pps = 1000 * (i as u64 + 1);
        }
        let eligible = CoreMask::first(3);
        assert_eq!(select_core(&cores, eligible), Some(CoreId(0)));
    }

    #[test]
    fn test_empty_eligible_returns_none() {
        let cores = table(2);
        assert_eq!(select_core(&cores, CoreMask::EMPTY), None);
        assert_eq!(select_for_new_flow(&cores, CoreMask::EMPTY), None);
    }

    #[test]
    fn test_prefer_cluster_fallback() {
        let eligible = CoreMask(0b0011);
        let perf = CoreMask(0b1100);
        assert_eq!(prefer_cluster(eligible, perf), eligible);
        let lp = CoreMask(0b0110);
        assert_eq!(prefer_cluster(eligible, lp).0, 0b0010);
    }
}
