//! End-to-end steering scenarios
//!
//! Exercises the engine through its public surface only: admission, marker
//! and timer triggers, watermark-gated migration, capacity behavior and
//! eviction, plus a randomized check of the per-flow ordering invariant.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;

use steer_core::{
    AdmitOutcome, CoreId, CoreProfile, Deliver, FilterRule, FlowKey, MarkerKind, NoopBoost,
    Packet, Scheduler, SteerConfig, Timestamp, PROTO_UDP,
};

/// Egress harness recording (flow, sequence, core) per delivery in call
/// order
#[derive(Default)]
struct Harness {
    log: Mutex<Vec<(u64, u64, CoreId)>>,
}

impl Harness {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self) -> Vec<(u64, u64, CoreId)> {
        self.log.lock().clone()
    }

    fn total(&self) -> usize {
        self.log.lock().len()
    }

    fn for_core(&self, core: CoreId) -> usize {
        self.log.lock().iter().filter(|(_, _, c)| *c == core).count()
    }

    /// Sequence numbers delivered for one flow, in delivery order
    fn seqs_for(&self, flow_hash: u64) -> Vec<u64> {
        self.log
            .lock()
            .iter()
            .filter(|(f, _, _)| *f == flow_hash)
            .map(|(_, s, _)| *s)
            .collect()
    }
}

impl Deliver for Harness {
    fn deliver(&self, packet: Packet, core: CoreId) {
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&packet.payload[..8]);
        self.log
            .lock()
            .push((packet.flow_hash, u64::from_be_bytes(seq_bytes), core));
    }
}

fn flow_key(flow: u16) -> FlowKey {
    FlowKey::from_v4(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        1000 + flow,
        443,
        PROTO_UDP,
    )
}

fn packet(flow: u16, seq: u64) -> Packet {
    Packet::from_key(flow_key(flow), Bytes::copy_from_slice(&seq.to_be_bytes()))
}

fn two_core_scheduler() -> (Arc<Scheduler>, Arc<Harness>) {
    let cfg = SteerConfig {
        cores: vec![CoreProfile::low_power(), CoreProfile::low_power()],
        ..Default::default()
    };
    let harness = Harness::new();
    let sched = Scheduler::new(cfg, harness.clone(), Arc::new(NoopBoost)).unwrap();
    (sched, harness)
}

// Two worker cores, A idle and B already busy; a new flow lands on the
// idle core, parks, and flushes there without migrating.
#[test]
fn scenario_new_flow_prefers_idle_core() {
    let (sched, harness) = two_core_scheduler();
    let a = CoreId(0);
    let b = CoreId(1);

    sched.note_enqueued(b, 1000);
    sched.on_marker(MarkerKind::WindowStart { seq: 1 });

    for seq in 0..5 {
        assert_eq!(sched.admit(packet(1, seq)), AdmitOutcome::Parked);
    }
    let hash = flow_key(1).hash();
    let snap = sched.flow_snapshot(hash).unwrap();
    assert_eq!(snap.assigned_core, a);
    assert_eq!(snap.parked, 5);
    assert_eq!(harness.total(), 0);

    assert!(sched.flush(hash, false));
    assert_eq!(harness.for_core(a), 5);
    assert_eq!(harness.for_core(b), 0);
    assert_eq!(sched.flow_snapshot(hash).unwrap().assigned_core, a);
    assert_eq!(harness.seqs_for(hash), vec![0, 1, 2, 3, 4]);
}

// A flow parked on core A with prior unconsumed backlog must not migrate
// to B until A's consumption progress reaches the watermark; the first
// flush after the inequality holds migrates.
#[test]
fn scenario_watermark_gated_migration() {
    let (sched, harness) = two_core_scheduler();
    let a = CoreId(0);
    let b = CoreId(1);

    sched.note_enqueued(a, 500);
    sched.note_processed(a, 480);
    sched.on_marker(MarkerKind::WindowStart { seq: 1 });

    for seq in 0..5 {
        sched.admit(packet(1, seq));
    }
    let hash = flow_key(1).hash();
    assert_eq!(sched.flow_snapshot(hash).unwrap().enqueue_watermark, 500);

    sched.apply_migration_suggestion(hash, b).unwrap();

    // 480 < 500: delivery stays on A
    assert!(sched.flush(hash, false));
    assert_eq!(harness.for_core(a), 5);
    assert_eq!(harness.for_core(b), 0);
    assert_eq!(sched.flow_snapshot(hash).unwrap().assigned_core, a);

    // Our own batch moved the watermark to A's arrival count (505); catch
    // consumption up and park more traffic
    let wm = sched.flow_snapshot(hash).unwrap().enqueue_watermark;
    assert_eq!(wm, 505);
    for seq in 5..8 {
        sched.admit(packet(1, seq));
    }
    sched.note_processed(a, wm - 480 - 1); // one short of the watermark
    assert!(sched.flush(hash, false));
    assert_eq!(harness.for_core(b), 0);
    assert_eq!(sched.flow_snapshot(hash).unwrap().assigned_core, a);

    // The tick where the inequality first holds migrates
    for seq in 8..10 {
        sched.admit(packet(1, seq));
    }
    sched.note_processed(a, 4); // processed reaches the updated watermark
    assert!(sched.flush(hash, false));
    assert_eq!(sched.flow_snapshot(hash).unwrap().assigned_core, b);
    assert_eq!(harness.for_core(b), 2);

    // The flow never reordered against itself
    assert_eq!(harness.seqs_for(hash), (0..10).collect::<Vec<_>>());
}

// Forced flushes migrate immediately regardless of the watermark.
#[test]
fn scenario_forced_migration_overrides_gate() {
    let (sched, harness) = two_core_scheduler();
    let a = CoreId(0);
    let b = CoreId(1);

    sched.note_enqueued(a, 500);
    sched.note_processed(a, 480);
    sched.on_marker(MarkerKind::WindowStart { seq: 1 });
    for seq in 0..5 {
        sched.admit(packet(1, seq));
    }
    let hash = flow_key(1).hash();
    sched.apply_migration_suggestion(hash, b).unwrap();

    assert!(sched.flush(hash, true));
    assert_eq!(harness.for_core(b), 5);
    assert_eq!(sched.flow_snapshot(hash).unwrap().assigned_core, b);
}

#[test]
fn scenario_capacity_cap_and_recovery() {
    let cfg = SteerConfig {
        cores: vec![CoreProfile::low_power(), CoreProfile::low_power()],
        max_flows: 3,
        ..Default::default()
    };
    let harness = Harness::new();
    let sched = Scheduler::new(cfg, harness.clone(), Arc::new(NoopBoost)).unwrap();
    let t0 = Timestamp::now();

    sched.on_marker(MarkerKind::WindowStart { seq: 1 });
    for flow in 1..=3 {
        assert_eq!(sched.admit(packet(flow, 0)), AdmitOutcome::Parked);
    }
    // The cap holds until something is evicted
    assert_eq!(sched.admit(packet(4, 0)), AdmitOutcome::Bypassed);
    assert_eq!(sched.admit(packet(5, 0)), AdmitOutcome::Bypassed);
    assert_eq!(sched.query_stats().live_flows, 3);

    // Everything delivered exactly once so far: 3 parked + 2 bypassed
    sched.on_marker(MarkerKind::WindowEnd { seq: 1 });
    assert_eq!(harness.total(), 5);

    // Inactivity eviction frees slots and the new flow is admitted fresh
    sched.control_tick_at(Timestamp::from_nanos(t0.as_nanos() + 1_000_000_000));
    sched.control_tick_at(Timestamp::from_nanos(t0.as_nanos() + 30_000_000_000));
    assert_eq!(sched.query_stats().live_flows, 0);
    sched.on_marker(MarkerKind::WindowStart { seq: 2 });
    assert_eq!(sched.admit(packet(4, 1)), AdmitOutcome::Parked);
}

#[test]
fn scenario_low_latency_class_skips_parking() {
    let (sched, harness) = two_core_scheduler();
    sched.install_filter(FilterRule::dst_port(443)).unwrap();
    sched.on_marker(MarkerKind::WindowStart { seq: 1 });

    for seq in 0..3 {
        assert_eq!(sched.admit(packet(1, seq)), AdmitOutcome::Delivered);
    }
    // Delivered immediately despite the open window
    assert_eq!(harness.total(), 3);
    assert_eq!(sched.query_stats().parked_packets, 0);
    // Statistics still accumulate for the flow
    let snap = sched.flow_snapshot(flow_key(1).hash()).unwrap();
    assert_eq!(snap.packet_count, 3);
}

#[tokio::test]
async fn scenario_lifecycle_and_shutdown_drain() {
    let (sched, harness) = two_core_scheduler();
    sched.start().unwrap();

    sched.on_marker(MarkerKind::WindowStart { seq: 1 });
    for seq in 0..4 {
        sched.admit(packet(1, seq));
    }
    sched.pause().unwrap();
    // Paused suspends the control loop, not steering
    assert_eq!(sched.admit(packet(1, 4)), AdmitOutcome::Parked);
    sched.resume().unwrap();

    // Teardown force-drains every parked packet before reclaiming state
    sched.shutdown();
    assert_eq!(harness.total(), 5);
    assert_eq!(sched.query_stats().live_flows, 0);
    assert_eq!(sched.query_stats().parked_packets, 0);
}

// Randomized ordering invariant: whatever interleaving of admissions,
// markers, suggestions, consumption progress and flushes occurs, each flow's
// packets are delivered in admission order.
#[derive(Debug, Clone)]
enum Op {
    Admit(u16),
    WindowStart,
    WindowEnd,
    FlushFlow(u16, bool),
    FlushAll(bool),
    Suggest(u16, u8),
    Consume(u8, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u16..=4).prop_map(Op::Admit),
        1 => Just(Op::WindowStart),
        1 => Just(Op::WindowEnd),
        1 => ((1u16..=4), any::<bool>()).prop_map(|(f, force)| Op::FlushFlow(f, force)),
        1 => any::<bool>().prop_map(Op::FlushAll),
        1 => ((1u16..=4), (0u8..4)).prop_map(|(f, c)| Op::Suggest(f, c)),
        1 => ((0u8..4), (1u64..50)).prop_map(|(c, n)| Op::Consume(c, n)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_per_flow_delivery_order_is_admission_order(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let cfg = SteerConfig {
            cores: vec![
                CoreProfile::low_power(),
                CoreProfile::low_power(),
                CoreProfile::performance(),
                CoreProfile::performance(),
            ],
            ..Default::default()
        };
        let harness = Harness::new();
        let sched = Scheduler::new(cfg, harness.clone(), Arc::new(NoopBoost)).unwrap();

        let mut next_seq = [0u64; 5];
        let mut admitted = 0u64;
        for op in ops {
            match op {
                Op::Admit(flow) => {
                    let seq = next_seq[flow as usize];
                    next_seq[flow as usize] += 1;
                    admitted += 1;
                    sched.admit(packet(flow, seq));
                }
                Op::WindowStart => sched.on_marker(MarkerKind::WindowStart { seq: 1 }),
                Op::WindowEnd => sched.on_marker(MarkerKind::WindowEnd { seq: 1 }),
                Op::FlushFlow(flow, force) => {
                    sched.flush(flow_key(flow).hash(), force);
                }
                Op::FlushAll(force) => sched.flush_table(force),
                Op::Suggest(flow, core) => {
                    let _ = sched.apply_migration_suggestion(
                        flow_key(flow).hash(),
                        CoreId(core),
                    );
                }
                Op::Consume(core, n) => sched.note_processed(CoreId(core), n),
            }
        }
        sched.flush_table(true);

        // No loss: every admitted packet was delivered exactly once
        prop_assert_eq!(harness.total() as u64, admitted);

        // Ordering: per flow, delivery order equals admission order
        for flow in 1u16..=4 {
            let seqs = harness.seqs_for(flow_key(flow).hash());
            let expected: Vec<u64> = (0..next_seq[flow as usize]).collect();
            prop_assert_eq!(seqs, expected);
        }
    }
}
