//! Claiming and releasing CEETM primitives for scheduling nodes.

use std::sync::Arc;

use ceetm_qman::{
    CcgOid, ChannelOid, ClassQueueOid, CongestionListener, CongestionThresholds, DequeueStats,
    Eligibility, LfqOid, QmanApi, QmanError, QmanResult, RateKind, TokenRate, WbfsGroup,
    CQ_PER_CHANNEL,
};
use tracing::{debug, error, info, warn};

use super::pool::DomainResourcePool;
use super::types::{
    BindError, BindResult, ChannelBinding, Claimed, HardwareBinding, LeafSetup, LinkBinding,
    PortLocation, Primitive, QueueBinding,
};
use crate::congestion::{CongestionState, CongestionTracker};
use crate::hierarchy::{InnerConfig, RootConfig};
use crate::rate::{RateConverter, RateError};

fn hw(primitive: Primitive) -> impl FnOnce(QmanError) -> BindError {
    move |source| BindError::Hardware { primitive, source }
}

fn rate(primitive: Primitive) -> impl FnOnce(RateError) -> BindError {
    move |source| BindError::Rate { primitive, source }
}

#[derive(Debug, Clone, Copy)]
struct ShaperRates {
    commit: TokenRate,
    excess: TokenRate,
}

/// Binder settings taken from the orchestrator configuration.
#[derive(Debug, Clone, Copy)]
pub struct BinderSettings {
    pub thresholds: CongestionThresholds,
    pub context_a: u64,
    pub rates: RateConverter,
    pub links_per_domain: u8,
}

/// Acquires hardware for nodes and gives it back.
///
/// Every multi-step claim records what it acquired; if a later step fails the
/// recorded primitives are released in reverse order before the error is
/// returned, so a failed claim leaves nothing behind. Teardown walks a
/// binding's claims through the same release path.
///
/// Primitives the hardware refuses to release stay with the binder, together
/// with the link index they sit on, until [`retry_stranded`] gets them back.
///
/// [`retry_stranded`]: HardwareResourceBinder::retry_stranded
pub struct HardwareResourceBinder {
    qman: Arc<dyn QmanApi>,
    tracker: Arc<CongestionTracker>,
    pool: DomainResourcePool,
    settings: BinderSettings,
    stranded: Vec<Vec<Claimed>>,
}

impl std::fmt::Debug for HardwareResourceBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareResourceBinder")
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .field("stranded", &self.stranded())
            .finish()
    }
}

impl HardwareResourceBinder {
    pub fn new(
        qman: Arc<dyn QmanApi>,
        tracker: Arc<CongestionTracker>,
        settings: BinderSettings,
    ) -> Self {
        Self {
            qman,
            tracker,
            pool: DomainResourcePool::new(settings.links_per_domain),
            settings,
            stranded: Vec::new(),
        }
    }

    pub fn pool(&self) -> &DomainResourcePool {
        &self.pool
    }

    pub fn rates(&self) -> &RateConverter {
        &self.settings.rates
    }

    /// Primitives still held after an incomplete release.
    pub fn stranded(&self) -> usize {
        self.stranded.iter().map(Vec::len).sum()
    }

    /// Claims the sub-portal and LNI of a port and programs the link shaper.
    pub fn claim_link(&mut self, port: PortLocation, root: &RootConfig) -> BindResult<LinkBinding> {
        let rates = if root.shaping_enabled {
            Some(self.shaper_rates(Primitive::LinkShaper, root.rate_bps, root.ceil_bps)?)
        } else {
            None
        };
        let mut chain = Vec::new();
        let result = self.try_claim_link(&mut chain, port, root, rates);
        self.settle(chain, result)
    }

    fn try_claim_link(
        &mut self,
        chain: &mut Vec<Claimed>,
        port: PortLocation,
        root: &RootConfig,
        rates: Option<ShaperRates>,
    ) -> BindResult<LinkBinding> {
        self.pool
            .claim_link_index(port.domain, port.link)
            .map_err(hw(Primitive::LinkIndex))?;
        chain.push(Claimed::LinkIndex {
            domain: port.domain,
            index: port.link,
        });
        let subportal = self
            .qman
            .claim_subportal(port.domain, port.subportal)
            .map_err(hw(Primitive::Subportal))?;
        chain.push(Claimed::Subportal(subportal));
        let lni = self
            .qman
            .claim_lni(port.domain, port.link)
            .map_err(hw(Primitive::Lni))?;
        chain.push(Claimed::Lni(lni));
        self.qman
            .map_subportal(lni, subportal)
            .map_err(hw(Primitive::Lni))?;

        let binding = LinkBinding {
            port,
            subportal,
            lni,
        };
        match rates {
            Some(rates) => self.program_link(&binding, root.overhead, rates)?,
            None => debug!(%lni, "unshaped link, shaper left disabled"),
        }
        info!(domain = %port.domain, link = port.link, subportal = port.subportal, %lni, "link bound");
        Ok(binding)
    }

    /// Reprograms the shaper of a bound link.
    pub fn update_link(&self, link: &LinkBinding, root: &RootConfig) -> BindResult<()> {
        if !root.shaping_enabled {
            return Ok(());
        }
        let rates = self.shaper_rates(Primitive::LinkShaper, root.rate_bps, root.ceil_bps)?;
        self.program_link(link, root.overhead, rates)
    }

    fn program_link(&self, link: &LinkBinding, overhead: u32, rates: ShaperRates) -> BindResult<()> {
        let mtu = link.port.mtu;
        self.qman
            .enable_lni_shaper(link.lni, overhead)
            .and_then(|_| {
                self.qman.set_lni_rate(
                    link.lni,
                    RateKind::Commit,
                    rates.commit,
                    RateConverter::token_limit(mtu, rates.commit.fraction),
                )
            })
            .and_then(|_| {
                self.qman.set_lni_rate(
                    link.lni,
                    RateKind::Excess,
                    rates.excess,
                    RateConverter::token_limit(mtu, rates.excess.fraction),
                )
            })
            .map_err(hw(Primitive::LinkShaper))
    }

    /// Claims a channel under the link, configures it as shaped or weighted,
    /// and claims its bank of congestion groups.
    pub fn claim_channel(
        &mut self,
        link: &LinkBinding,
        config: &InnerConfig,
    ) -> BindResult<ChannelBinding> {
        let rates = match *config {
            InnerConfig::Shaped { rate_bps, ceil_bps } => {
                Some(self.shaper_rates(Primitive::ChannelShaper, rate_bps, ceil_bps)?)
            }
            InnerConfig::Weighted { .. } => None,
        };
        let mut chain = Vec::new();
        let result = self.try_claim_channel(&mut chain, link, config, rates);
        self.settle(chain, result)
    }

    fn try_claim_channel(
        &mut self,
        chain: &mut Vec<Claimed>,
        link: &LinkBinding,
        config: &InnerConfig,
        rates: Option<ShaperRates>,
    ) -> BindResult<ChannelBinding> {
        let channel = self
            .qman
            .claim_channel(link.lni)
            .map_err(hw(Primitive::Channel))?;
        chain.push(Claimed::Channel(channel));
        let mut binding = ChannelBinding {
            channel,
            groups: Vec::with_capacity(usize::from(CQ_PER_CHANNEL)),
            mtu: link.port.mtu,
        };
        self.program_channel(&binding, config, rates)?;

        for index in 0..CQ_PER_CHANNEL {
            let ccg = self.claim_congestion_group(channel, index)?;
            chain.push(Claimed::Ccg(ccg));
            binding.groups.push(ccg);
        }
        info!(lni = %link.lni, %channel, "channel bound");
        Ok(binding)
    }

    /// Reprograms rate or weight of a bound channel.
    pub fn update_channel(&self, channel: &ChannelBinding, config: &InnerConfig) -> BindResult<()> {
        let rates = match *config {
            InnerConfig::Shaped { rate_bps, ceil_bps } => {
                Some(self.shaper_rates(Primitive::ChannelShaper, rate_bps, ceil_bps)?)
            }
            InnerConfig::Weighted { .. } => None,
        };
        self.program_channel(channel, config, rates)
    }

    fn program_channel(
        &self,
        binding: &ChannelBinding,
        config: &InnerConfig,
        rates: Option<ShaperRates>,
    ) -> BindResult<()> {
        let channel = binding.channel;
        match (config, rates) {
            (InnerConfig::Shaped { .. }, Some(rates)) => self
                .qman
                .enable_channel_shaper(channel)
                .and_then(|_| {
                    self.qman.set_channel_rate(
                        channel,
                        RateKind::Commit,
                        rates.commit,
                        RateConverter::token_limit(binding.mtu, rates.commit.fraction),
                    )
                })
                .and_then(|_| {
                    self.qman.set_channel_rate(
                        channel,
                        RateKind::Excess,
                        rates.excess,
                        RateConverter::token_limit(binding.mtu, rates.excess.fraction),
                    )
                })
                .map_err(hw(Primitive::ChannelShaper)),
            (InnerConfig::Weighted { weight }, _) => self
                .qman
                .set_channel_weight(channel, *weight)
                .map_err(hw(Primitive::Channel)),
            (InnerConfig::Shaped { .. }, None) => Err(BindError::Hardware {
                primitive: Primitive::ChannelShaper,
                source: QmanError::invalid_parameter("shaped channel without rates"),
            }),
        }
    }

    /// Claims congestion group `index` of a channel with the configured thresholds.
    pub fn claim_congestion_group(&self, channel: ChannelOid, index: u8) -> BindResult<CcgOid> {
        let listener: Arc<dyn CongestionListener> = self.tracker.clone();
        self.qman
            .claim_ccg(channel, index, &self.settings.thresholds, listener)
            .map_err(hw(Primitive::CongestionGroup))
    }

    pub fn claim_class_queue(
        &self,
        channel: ChannelOid,
        index: u8,
        ccg: CcgOid,
    ) -> BindResult<ClassQueueOid> {
        self.qman
            .claim_class_queue(channel, index, ccg)
            .map_err(hw(Primitive::ClassQueue))
    }

    pub fn claim_logical_queue(&self, cq: ClassQueueOid) -> BindResult<LfqOid> {
        self.qman.claim_lfq(cq).map_err(hw(Primitive::LogicalQueue))
    }

    /// Places a WBFS group on the channel at `priority`.
    pub fn configure_group(
        &self,
        channel: &ChannelBinding,
        group: WbfsGroup,
        priority: u8,
    ) -> BindResult<()> {
        self.qman
            .set_channel_group(channel.channel, group, priority)
            .map_err(hw(Primitive::WbfsGroup))
    }

    /// Sets group eligibility once the group's leaves are in place.
    pub fn set_group_eligibility(
        &self,
        channel: &ChannelBinding,
        group: WbfsGroup,
        eligibility: Eligibility,
    ) -> BindResult<()> {
        self.qman
            .set_group_eligibility(channel.channel, group, eligibility)
            .map_err(hw(Primitive::WbfsGroup))
    }

    /// Claims class queue `index` with its logical and egress frame queues
    /// and starts tracking its congestion.
    pub fn claim_leaf(
        &mut self,
        channel: &ChannelBinding,
        index: u8,
        setup: LeafSetup,
    ) -> BindResult<QueueBinding> {
        let mut chain = Vec::new();
        let result = self.try_claim_leaf(&mut chain, channel, index, setup);
        self.settle(chain, result)
    }

    fn try_claim_leaf(
        &mut self,
        chain: &mut Vec<Claimed>,
        channel: &ChannelBinding,
        index: u8,
        setup: LeafSetup,
    ) -> BindResult<QueueBinding> {
        let ccg = channel.group(index).ok_or_else(|| BindError::Hardware {
            primitive: Primitive::CongestionGroup,
            source: QmanError::not_found("ccg", format!("{}/{}", channel.channel, index)),
        })?;
        let class_queue = self.claim_class_queue(channel.channel, index, ccg)?;
        chain.push(Claimed::ClassQueue(class_queue));
        let scheduled = match setup {
            LeafSetup::Prio(eligibility) => self
                .qman
                .set_queue_eligibility(channel.channel, index, eligibility),
            LeafSetup::Wbfs(code) => self.qman.set_queue_weight(class_queue, code),
        };
        scheduled.map_err(hw(Primitive::ClassQueue))?;

        let lfq = self.claim_logical_queue(class_queue)?;
        chain.push(Claimed::Lfq(lfq));
        let frame_queue = self
            .qman
            .create_frame_queue(lfq, self.settings.context_a)
            .map_err(hw(Primitive::FrameQueue))?;
        chain.push(Claimed::FrameQueue(frame_queue));

        let state = Arc::new(CongestionState::new());
        self.tracker.register(ccg, frame_queue, Arc::clone(&state));
        chain.push(Claimed::Tracking {
            ccg,
            fq: frame_queue,
        });
        debug!(channel = %channel.channel, index, %class_queue, %frame_queue, "leaf bound");
        Ok(QueueBinding {
            index,
            channel: channel.channel,
            ccg,
            class_queue,
            lfq,
            frame_queue,
            state,
        })
    }

    pub fn dequeue_stats(&self, queue: &QueueBinding, clear: bool) -> QmanResult<DequeueStats> {
        self.qman.dequeue_stats(queue.class_queue, clear)
    }

    /// Releases everything a binding holds. Returns the number of primitives
    /// still held afterwards; those are kept for [`retry_stranded`].
    ///
    /// [`retry_stranded`]: HardwareResourceBinder::retry_stranded
    pub fn release(&mut self, binding: HardwareBinding) -> usize {
        self.strand(binding.into_claims())
    }

    /// Retries every incomplete release, oldest first. Returns the number of
    /// primitives still held.
    pub fn retry_stranded(&mut self) -> usize {
        for chain in std::mem::take(&mut self.stranded) {
            self.strand(chain);
        }
        self.stranded()
    }

    pub fn release_link(&mut self, link: LinkBinding) -> usize {
        self.release(HardwareBinding::Link(link))
    }

    pub fn release_channel(&mut self, channel: ChannelBinding) -> usize {
        self.release(HardwareBinding::Channel(channel))
    }

    pub fn release_queue(&mut self, queue: QueueBinding) -> usize {
        self.release(HardwareBinding::Queue(queue))
    }

    fn settle<T>(&mut self, chain: Vec<Claimed>, result: BindResult<T>) -> BindResult<T> {
        if let Err(e) = &result {
            warn!(primitive = %e.primitive(), claimed = chain.len(), "claim failed, rolling back: {}", e);
            self.strand(chain);
        }
        result
    }

    fn strand(&mut self, claims: Vec<Claimed>) -> usize {
        let kept = self.unwind(claims);
        let held = kept.len();
        if held > 0 {
            warn!(held, "release incomplete, primitives kept for retry");
            self.stranded.push(kept);
        }
        held
    }

    /// Releases `claims` in reverse and returns the ones still held, in claim
    /// order. A link index is kept while anything claimed after it is held.
    fn unwind(&mut self, claims: Vec<Claimed>) -> Vec<Claimed> {
        let mut kept = Vec::new();
        for claim in claims.into_iter().rev() {
            let released = match claim {
                Claimed::LinkIndex { domain, index } if !kept.is_empty() => {
                    debug!(%domain, index, "link index kept, primitives above it still held");
                    false
                }
                _ => self.release_one(claim),
            };
            if !released {
                kept.push(claim);
            }
        }
        kept.reverse();
        kept
    }

    fn release_one(&mut self, claim: Claimed) -> bool {
        let result = match claim {
            Claimed::LinkIndex { domain, index } => {
                if !self.pool.release_link_index(domain, index) {
                    warn!(%domain, index, "link index was not held");
                }
                Ok(())
            }
            Claimed::Subportal(sp) => self.qman.release_subportal(sp),
            Claimed::Lni(lni) => self.qman.release_lni(lni),
            Claimed::Channel(channel) => self.qman.release_channel(channel),
            Claimed::Ccg(ccg) => self.qman.release_ccg(ccg),
            Claimed::ClassQueue(cq) => self.qman.release_class_queue(cq),
            Claimed::Lfq(lfq) => self.qman.release_lfq(lfq),
            Claimed::FrameQueue(fq) => self.qman.destroy_frame_queue(fq),
            Claimed::Tracking { ccg, fq } => {
                self.tracker.unregister(ccg, fq);
                Ok(())
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(?claim, "release failed: {}", e);
                false
            }
        }
    }

    fn shaper_rates(
        &self,
        primitive: Primitive,
        rate_bps: u64,
        ceil_bps: u64,
    ) -> BindResult<ShaperRates> {
        let rates = &self.settings.rates;
        Ok(ShaperRates {
            commit: rates.to_token_rate(rate_bps).map_err(rate(primitive))?,
            excess: rates.to_token_rate(ceil_bps).map_err(rate(primitive))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceetm_qman::{DomainId, SimQman, WeightCode};
    use pretty_assertions::assert_eq;

    fn settings() -> BinderSettings {
        BinderSettings {
            thresholds: CongestionThresholds::default(),
            context_a: 0x1a00_0000_8000_0000,
            rates: RateConverter::default(),
            links_per_domain: 8,
        }
    }

    fn binder() -> (Arc<SimQman>, Arc<CongestionTracker>, HardwareResourceBinder) {
        let sim = Arc::new(SimQman::default());
        let tracker = Arc::new(CongestionTracker::new());
        let binder = HardwareResourceBinder::new(sim.clone(), tracker.clone(), settings());
        (sim, tracker, binder)
    }

    fn port() -> PortLocation {
        PortLocation {
            domain: DomainId(0),
            subportal: 2,
            link: 2,
            mtu: 1518,
        }
    }

    fn gigabit() -> RootConfig {
        RootConfig::shaped(1_000_000_000, 1_000_000_000, 24)
    }

    #[test]
    fn test_full_leaf_chain() {
        let (sim, tracker, mut binder) = binder();
        let link = binder.claim_link(port(), &gigabit()).unwrap();
        let channel = binder
            .claim_channel(&link, &InnerConfig::Weighted { weight: 10 })
            .unwrap();
        assert_eq!(channel.groups.len(), 16);
        let leaf = binder
            .claim_leaf(&channel, 3, LeafSetup::Prio(Eligibility::default()))
            .unwrap();
        assert_eq!(leaf.ccg, channel.groups[3]);
        assert_eq!(tracker.tracked_leaves(), 1);
        // sp + lni + channel + 16 ccg + cq + lfq + fq
        assert_eq!(sim.live_objects(), 22);

        assert_eq!(binder.release_queue(leaf), 0);
        assert_eq!(binder.release_channel(channel), 0);
        assert_eq!(binder.release_link(link), 0);
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(tracker.tracked_leaves(), 0);
        assert_eq!(binder.pool().outstanding(DomainId(0)), 0);
    }

    #[test]
    fn test_link_rollback_on_lni_failure() {
        let (sim, _, mut binder) = binder();
        sim.fail_claim_after(1);
        let err = binder.claim_link(port(), &gigabit()).unwrap_err();
        assert_eq!(err.primitive(), Primitive::Lni);
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.claim_release_counts(), (1, 1));
        assert_eq!(binder.pool().outstanding(DomainId(0)), 0);
    }

    #[test]
    fn test_channel_rollback_releases_groups() {
        let (sim, _, mut binder) = binder();
        let link = binder.claim_link(port(), &RootConfig::default()).unwrap();
        // channel and five groups succeed
        sim.fail_claim_after(6);
        let err = binder
            .claim_channel(&link, &InnerConfig::Weighted { weight: 1 })
            .unwrap_err();
        assert_eq!(err.primitive(), Primitive::CongestionGroup);
        assert_eq!(sim.live_objects(), 2);
        binder.release_link(link);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_leaf_rollback_unregisters_nothing_twice() {
        let (sim, tracker, mut binder) = binder();
        let link = binder.claim_link(port(), &RootConfig::default()).unwrap();
        let channel = binder
            .claim_channel(&link, &InnerConfig::Weighted { weight: 1 })
            .unwrap();
        let before = sim.live_objects();
        sim.fail_claim_after(2);
        let err = binder
            .claim_leaf(&channel, 8, LeafSetup::Wbfs(WeightCode { y: 0, x: 0 }))
            .unwrap_err();
        assert_eq!(err.primitive(), Primitive::FrameQueue);
        assert_eq!(sim.live_objects(), before);
        assert_eq!(tracker.tracked_leaves(), 0);
    }

    #[test]
    fn test_rate_error_claims_nothing() {
        let (sim, _, mut binder) = binder();
        let root = RootConfig::shaped(u64::MAX, u64::MAX, 0);
        let err = binder.claim_link(port(), &root).unwrap_err();
        assert!(matches!(
            err,
            BindError::Rate {
                primitive: Primitive::LinkShaper,
                ..
            }
        ));
        assert_eq!(sim.claim_release_counts(), (0, 0));
        assert_eq!(binder.pool().outstanding(DomainId(0)), 0);
    }

    #[test]
    fn test_link_index_held_twice() {
        let (_, _, mut binder) = binder();
        let _link = binder.claim_link(port(), &RootConfig::default()).unwrap();
        let err = binder.claim_link(port(), &RootConfig::default()).unwrap_err();
        assert_eq!(err.primitive(), Primitive::LinkIndex);
        assert!(matches!(err, BindError::Hardware { ref source, .. } if source.is_exhausted()));
    }

    #[test]
    fn test_refused_release_keeps_link_index() {
        let (sim, _, mut binder) = binder();
        let link = binder.claim_link(port(), &RootConfig::default()).unwrap();
        let channel = binder
            .claim_channel(&link, &InnerConfig::Weighted { weight: 1 })
            .unwrap();
        // the LNI still feeds a channel and keeps its sub-portal mapped
        assert_eq!(binder.release_link(link), 3);
        assert_eq!(binder.stranded(), 3);
        assert!(binder.pool().is_held(DomainId(0), 2));
        assert_eq!(binder.pool().outstanding(DomainId(0)), 1);

        let err = binder.claim_link(port(), &RootConfig::default()).unwrap_err();
        assert_eq!(err.primitive(), Primitive::LinkIndex);
        assert_eq!(binder.retry_stranded(), 3);

        assert_eq!(binder.release_channel(channel), 0);
        assert_eq!(binder.retry_stranded(), 0);
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(binder.pool().outstanding(DomainId(0)), 0);

        let link = binder.claim_link(port(), &RootConfig::default()).unwrap();
        assert_eq!(binder.release_link(link), 0);
        assert_eq!(sim.live_objects(), 0);
    }
}
