//! CEETM egress shaping orchestrator.
//!
//! Builds per-port scheduling hierarchies on a DPAA queue manager's CEETM
//! block and runs the admission path that feeds them.
//!
//! # Architecture
//!
//! ```text
//! [policy file] ──> [CeetmOrch] ──> [HardwareResourceBinder] ──> [QmanApi]
//!                       │                                           │
//!   packets ──> [ClassifyEnqueue] ──> frame queue                   │
//!                       ↑                                           │
//!               [CongestionTracker] <──── congestion / ERN events ──┘
//! ```
//!
//! # Key Components
//!
//! - [`orch::CeetmOrch`]: configuration state machine and packet entry point
//! - [`binder`]: ordered claim and release of hardware primitives with rollback
//! - [`hierarchy`]: node model and the per-device node index
//! - [`enqueue`]: classification and congestion-aware admission
//! - [`congestion`]: per-leaf congestion flags and counters
//! - [`rate`]: rate and weight conversion to hardware coefficients

#[macro_use]
pub mod audit;
pub mod binder;
pub mod config;
pub mod congestion;
pub mod enqueue;
pub mod hierarchy;
pub mod orch;
pub mod rate;
pub mod stats;

pub use binder::{HardwareResourceBinder, PortLocation};
pub use config::{load_policy, PolicyFile, PortEntry, StaticPortMap};
pub use congestion::{CongestionState, CongestionTracker};
pub use enqueue::{
    Classifier, ClassifyEnqueue, DropAllocator, FwMarkClassifier, HardwareSink, Outcome, Packet,
    PacketAllocator, PacketSink,
};
pub use hierarchy::{FilterRule, Hierarchy, InnerConfig, NodeId, RootConfig, TopologyError};
pub use orch::{
    CeetmOrch, CeetmOrchConfig, CeetmOrchError, CeetmOrchResult, CeetmOrchStats, Collaborators,
    DeleteOutcome, HierarchyHandle, PolicyTree, PortResolver,
};
pub use rate::{RateConverter, RateError};
pub use stats::{Counters, LeafReport, StatsAggregator};
