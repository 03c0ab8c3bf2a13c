//! Scheduling hierarchy model.
//!
//! A hierarchy is at most three levels deep:
//!
//! ```text
//! Root (link)
//!  └─ Inner (channel)          R:n, same major as the root
//!      └─ prio scheduler P     P:1 .. P:8, priority = minor - 1
//!          └─ WBFS group W     under P:k with k >= 2
//! ```

mod tree;
mod types;

pub use tree::{Hierarchy, Walk};
pub use types::{
    ChildScheduler, FilterChain, FilterRule, GroupSlots, InnerConfig, Level, NodeConfig, NodeId,
    NodeState, ParseNodeIdError, PrioLeafConfig, RootConfig, SchedulerKind, SchedulingNode,
    TopologyError, WbfsLeafConfig,
};
