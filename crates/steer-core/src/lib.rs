//! OpenSteer Core - Flow-aware multi-core receive steering
//!
//! Classifies inbound packets into flows, pins each flow to a worker core,
//! parks packets per flow to preserve ordering, and flushes them to the
//! next stage under byte/packet/timer/marker triggers - migrating flows
//! between cores without ever reordering a flow against itself.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        STEERING ENGINE                             │
//! │                                                                    │
//! │  packet ──▶ ┌───────────────┐     ┌──────────────────────────┐     │
//! │             │  Admission &  │────▶│        Flow Table        │     │
//! │             │    Parking    │     │  (slab + hash index)     │     │
//! │             └──────┬────────┘     └────────────┬─────────────┘     │
//! │                    │ limits                    │                   │
//! │                    ▼                           ▼                   │
//! │             ┌───────────────┐     ┌──────────────────────────┐     │
//! │   marker ──▶│    Flush      │────▶│     Per-Core State       │     │
//! │   timer  ──▶│    Engine     │     │ (watermarks, backlog,    │     │
//! │             └──────┬────────┘     │  assigned flows, masks)  │     │
//! │                    │              └────────────▲─────────────┘     │
//! │                    ▼                           │                   │
//! │             deliver(pkt, core)          ┌──────┴────────┐          │
//! │                                         │ Control Loop  │──▶ boost │
//! │                                         │ (rates, evict,│          │
//! │                                         │  suggestions) │          │
//! │                                         └───────────────┘          │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Execution contexts
//!
//! The admission path (`Scheduler::admit`) runs on multiple worker contexts
//! concurrently, to completion, and never blocks: one bounded critical
//! section per packet under the engine mutex, pre-sized structures, and
//! non-blocking trigger signalling. The control loop and the fallback
//! flush timer are cooperatively scheduled tokio tasks that may block on
//! the same mutex briefly and never run concurrently with themselves.
//!
//! # The ordering invariant
//!
//! For any two packets P1 admitted before P2 on the same flow, P1 reaches
//! its destination core no later than P2 in that core's own arrival order.
//! Migration is therefore watermark-gated: a flow moves cores only once the
//! old core has consumed everything enqueued ahead of the flow's parked
//! packets, unless a forced flush or a vanished core overrides the gate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admit;
pub mod config;
pub mod control;
pub mod cores;
pub mod filters;
pub mod flow;
pub mod flush;
pub mod freq;
pub mod scheduler;
pub mod select;
pub mod stats;
pub mod triggers;

pub use admit::AdmitOutcome;
pub use config::{ConfigError, CoreProfile, SteerConfig};
pub use cores::{CoreSnapshot, CoreTable};
pub use filters::{FilterRule, FilterSet};
pub use flow::{FlowRecord, FlowTable, LatencyClass, SuggestionKind};
pub use freq::{BoostEvent, FreqBoost, NoopBoost, RecordingBoost};
pub use scheduler::{
    Deliver, EngineState, FlowSnapshot, MigrationSuggestion, Scheduler, SteerSnapshot,
};
pub use stats::{FlushReason, SoftError, SteerStats, SwitchReason, TotalsSnapshot};

pub use steer_common::{
    ClusterClass, CoreId, CoreMask, FlowKey, MarkerKind, Packet, SteerError, SteerResult,
    Timestamp, PROTO_TCP, PROTO_UDP,
};
