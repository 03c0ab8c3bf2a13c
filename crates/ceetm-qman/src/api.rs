//! The queue-manager primitive API.
//!
//! [`QmanApi`] is the seam between the shaping orchestrator and whatever
//! drives the hardware. Every primitive kind has a claim and a release call;
//! rates, weights and eligibility are programmed on already claimed objects.
//! Claims fail immediately with [`QmanError::Busy`](crate::QmanError::Busy) or
//! [`QmanError::NotAvailable`](crate::QmanError::NotAvailable) instead of
//! waiting for a primitive to free up.

use std::sync::Arc;

use crate::error::QmanResult;
use crate::types::{
    CcgOid, ChannelOid, ClassQueueOid, CongestionThresholds, DequeueStats, DomainId, Eligibility,
    FrameQueueOid, LfqOid, LniOid, RateKind, SubportalOid, TokenRate, WbfsGroup, WeightCode,
};

/// Receiver of asynchronous congestion-group notifications.
///
/// Implementations are called from the hardware event context and must not
/// block.
pub trait CongestionListener: Send + Sync {
    /// A congestion group crossed its enter or exit threshold.
    fn on_congestion_change(&self, ccg: CcgOid, congested: bool);

    /// A frame previously accepted on `fq` was rejected by the hardware.
    fn on_enqueue_rejected(&self, fq: FrameQueueOid);
}

/// CEETM primitive operations.
pub trait QmanApi: Send + Sync {
    /// Claims the sub-portal `index` of `domain`.
    fn claim_subportal(&self, domain: DomainId, index: u8) -> QmanResult<SubportalOid>;

    /// Releases a sub-portal.
    fn release_subportal(&self, subportal: SubportalOid) -> QmanResult<()>;

    /// Claims the logical network interface (link shaper) `index` of `domain`.
    fn claim_lni(&self, domain: DomainId, index: u8) -> QmanResult<LniOid>;

    /// Releases an LNI. The LNI must have no channels left.
    fn release_lni(&self, lni: LniOid) -> QmanResult<()>;

    /// Feeds the LNI from the given sub-portal.
    fn map_subportal(&self, lni: LniOid, subportal: SubportalOid) -> QmanResult<()>;

    /// Enables the LNI shaper with the per-frame overhead in bytes.
    fn enable_lni_shaper(&self, lni: LniOid, overhead: u32) -> QmanResult<()>;

    /// Programs one token bucket of the LNI shaper.
    fn set_lni_rate(
        &self,
        lni: LniOid,
        kind: RateKind,
        rate: TokenRate,
        limit: u16,
    ) -> QmanResult<()>;

    /// Claims a channel scheduler under the LNI.
    fn claim_channel(&self, lni: LniOid) -> QmanResult<ChannelOid>;

    /// Releases a channel. It must have no class queues or groups left.
    fn release_channel(&self, channel: ChannelOid) -> QmanResult<()>;

    /// Makes the channel shaped.
    fn enable_channel_shaper(&self, channel: ChannelOid) -> QmanResult<()>;

    /// Programs one token bucket of the channel shaper.
    fn set_channel_rate(
        &self,
        channel: ChannelOid,
        kind: RateKind,
        rate: TokenRate,
        limit: u16,
    ) -> QmanResult<()>;

    /// Sets the fair-queuing weight of an unshaped channel.
    fn set_channel_weight(&self, channel: ChannelOid, weight: u32) -> QmanResult<()>;

    /// Places a WBFS group on the channel at the given strict priority.
    fn set_channel_group(
        &self,
        channel: ChannelOid,
        group: WbfsGroup,
        priority: u8,
    ) -> QmanResult<()>;

    /// Sets committed/excess eligibility of a WBFS group.
    fn set_group_eligibility(
        &self,
        channel: ChannelOid,
        group: WbfsGroup,
        eligibility: Eligibility,
    ) -> QmanResult<()>;

    /// Claims congestion group `index` of the channel and registers the
    /// listener for its state-change notifications.
    fn claim_ccg(
        &self,
        channel: ChannelOid,
        index: u8,
        thresholds: &CongestionThresholds,
        listener: Arc<dyn CongestionListener>,
    ) -> QmanResult<CcgOid>;

    /// Releases a congestion group. No class queue may still use it.
    fn release_ccg(&self, ccg: CcgOid) -> QmanResult<()>;

    /// Claims class queue `index` of the channel, accounted to `ccg`.
    fn claim_class_queue(
        &self,
        channel: ChannelOid,
        index: u8,
        ccg: CcgOid,
    ) -> QmanResult<ClassQueueOid>;

    /// Releases a class queue. Its logical frame queue must be gone.
    fn release_class_queue(&self, cq: ClassQueueOid) -> QmanResult<()>;

    /// Sets committed/excess eligibility of a strict-priority class queue.
    fn set_queue_eligibility(
        &self,
        channel: ChannelOid,
        index: u8,
        eligibility: Eligibility,
    ) -> QmanResult<()>;

    /// Sets the WBFS weight of a class queue.
    fn set_queue_weight(&self, cq: ClassQueueOid, weight: WeightCode) -> QmanResult<()>;

    /// Reads the dequeue counters of a class queue, optionally clearing them.
    fn dequeue_stats(&self, cq: ClassQueueOid, clear: bool) -> QmanResult<DequeueStats>;

    /// Claims the logical frame queue feeding the class queue.
    fn claim_lfq(&self, cq: ClassQueueOid) -> QmanResult<LfqOid>;

    /// Releases a logical frame queue. Its frame queue must be gone.
    fn release_lfq(&self, lfq: LfqOid) -> QmanResult<()>;

    /// Creates the egress frame queue on the LFQ with the given context word.
    fn create_frame_queue(&self, lfq: LfqOid, context_a: u64) -> QmanResult<FrameQueueOid>;

    /// Retires and destroys a frame queue.
    fn destroy_frame_queue(&self, fq: FrameQueueOid) -> QmanResult<()>;

    /// Enqueues one frame.
    fn enqueue(&self, fq: FrameQueueOid, frame: &[u8]) -> QmanResult<()>;
}
