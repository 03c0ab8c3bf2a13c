//! CEETM configuration orchestrator.
//!
//! Drives creation, mutation and teardown of scheduling hierarchies, one per
//! device, and serves the packet path against them.

#[allow(clippy::module_inception)]
mod orch;
mod types;

pub use orch::CeetmOrch;
pub use types::{
    CeetmOrchConfig, CeetmOrchError, CeetmOrchResult, CeetmOrchStats, ChannelPolicy,
    Collaborators, DeleteOutcome, HierarchyHandle, NodeDump, PolicyTree, PortResolver,
    PrioPolicy, ShaperPolicy, WbfsPolicy,
};
