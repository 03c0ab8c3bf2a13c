//! Type-safe interface to the CEETM queue-manager scheduling primitives.
//!
//! CEETM (Customer Edge Egress Traffic Management) exposes a fixed set of
//! hardware objects that together implement a shaping and scheduling
//! hierarchy on an egress port. This crate gives each of them a distinct
//! handle type so a channel can never be released where a class queue was
//! expected, and wraps the raw status codes in a `Result` based error type.
//!
//! # Architecture
//!
//! - [`types`]: typed primitive handles and hardware value types
//! - [`error`]: status codes and the [`QmanError`] taxonomy
//! - [`api`]: the [`QmanApi`] trait every backend implements
//! - [`sim`]: an in-memory engine with finite pools and congestion signalling
//!
//! # Claim order
//!
//! ```text
//! sub-portal ─┐
//!             ├─> LNI (link shaper) ─> channel ─> 16 x CCG
//!             │                                     │
//!             └─────────────────────────────────────┴─> CQ ─> LFQ ─> FQ
//! ```

pub mod api;
pub mod error;
pub mod sim;
pub mod types;

pub use api::{CongestionListener, QmanApi};
pub use error::{QmanError, QmanResult, QmanStatus};
pub use sim::{SimConfig, SimQman};
pub use types::{
    CcgKind, CcgOid, ChannelKind, ChannelOid, ClassQueueKind, ClassQueueOid, CongestionMode,
    CongestionThresholds, DequeueStats, DomainId, Eligibility, FrameQueueKind, FrameQueueOid,
    LfqKind, LfqOid, LniKind, LniOid, QmanObjectId, QmanObjectKind, RateKind, RawQmanObjectId,
    SubportalKind, SubportalOid, TokenRate, WbfsGroup, WeightCode, CQ_PER_CHANNEL,
    PRIO_QUEUES_PER_CHANNEL,
};
