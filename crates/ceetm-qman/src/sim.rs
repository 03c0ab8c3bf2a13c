//! In-memory CEETM engine.
//!
//! `SimQman` keeps the same ownership rules as the hardware: primitives come
//! from finite per-domain pools, a primitive cannot be released while objects
//! claimed under it are still alive, and congestion groups signal their
//! listener when the frames queued behind them cross the configured
//! thresholds. Frames only leave a queue when [`SimQman::drain`] is called,
//! which stands in for the port transmitting.
//!
//! Listener callbacks are always invoked after the internal lock is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::api::{CongestionListener, QmanApi};
use crate::error::{QmanError, QmanResult};
use crate::types::{
    CcgOid, ChannelOid, ClassQueueOid, CongestionMode, CongestionThresholds, DequeueStats,
    DomainId, Eligibility, FrameQueueOid, LfqOid, LniOid, QmanObjectId, QmanObjectKind, RateKind,
    RawQmanObjectId, SubportalOid, TokenRate, WbfsGroup, WeightCode, CQ_PER_CHANNEL,
};

/// Pool sizes of the simulated engine.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub subportals_per_domain: u8,
    pub lnis_per_domain: u8,
    pub channels_per_domain: u16,
    pub lfqs_per_domain: u32,
    /// Frames a frame queue holds before further frames are rejected.
    pub queue_limit: Option<u32>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            subportals_per_domain: 10,
            lnis_per_domain: 8,
            channels_per_domain: 32,
            lfqs_per_domain: 512,
            queue_limit: None,
        }
    }
}

struct CcgState {
    channel: RawQmanObjectId,
    index: u8,
    thresholds: CongestionThresholds,
    listener: Arc<dyn CongestionListener>,
    frames: u64,
    bytes: u64,
    congested: bool,
}

impl CcgState {
    fn occupancy(&self) -> u64 {
        match self.thresholds.mode {
            CongestionMode::FrameCount => self.frames,
            CongestionMode::ByteCount => self.bytes,
        }
    }
}

enum SimObject {
    Subportal {
        domain: DomainId,
        index: u8,
    },
    Lni {
        domain: DomainId,
        index: u8,
        subportal: Option<RawQmanObjectId>,
    },
    Channel {
        domain: DomainId,
        lni: RawQmanObjectId,
        groups: Vec<(WbfsGroup, u8)>,
    },
    Ccg(CcgState),
    ClassQueue {
        channel: RawQmanObjectId,
        index: u8,
        ccg: RawQmanObjectId,
        stats: DequeueStats,
    },
    Lfq {
        domain: DomainId,
        cq: RawQmanObjectId,
    },
    FrameQueue {
        lfq: RawQmanObjectId,
        cq: RawQmanObjectId,
        ccg: RawQmanObjectId,
        frames: VecDeque<u64>,
    },
}

impl SimObject {
    fn parent(&self) -> Option<RawQmanObjectId> {
        match self {
            SimObject::Subportal { .. } => None,
            SimObject::Lni { .. } => None,
            SimObject::Channel { lni, .. } => Some(*lni),
            SimObject::Ccg(ccg) => Some(ccg.channel),
            SimObject::ClassQueue { channel, .. } => Some(*channel),
            SimObject::Lfq { cq, .. } => Some(*cq),
            SimObject::FrameQueue { lfq, .. } => Some(*lfq),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SimObject::Subportal { .. } => "subportal",
            SimObject::Lni { .. } => "lni",
            SimObject::Channel { .. } => "channel",
            SimObject::Ccg(_) => "ccg",
            SimObject::ClassQueue { .. } => "class_queue",
            SimObject::Lfq { .. } => "lfq",
            SimObject::FrameQueue { .. } => "frame_queue",
        }
    }
}

enum Notification {
    Congestion(Arc<dyn CongestionListener>, CcgOid, bool),
    Rejected(Arc<dyn CongestionListener>, FrameQueueOid),
}

impl Notification {
    fn deliver(self) {
        match self {
            Notification::Congestion(listener, ccg, congested) => {
                listener.on_congestion_change(ccg, congested)
            }
            Notification::Rejected(listener, fq) => listener.on_enqueue_rejected(fq),
        }
    }
}

#[derive(Default)]
struct SimState {
    objects: HashMap<RawQmanObjectId, SimObject>,
    subportals: HashSet<(DomainId, u8)>,
    lnis: HashSet<(DomainId, u8)>,
    channel_slots: HashSet<(RawQmanObjectId, u8)>,
    cq_slots: HashSet<(RawQmanObjectId, u8)>,
    next_oid: RawQmanObjectId,
    fail_after: Option<usize>,
    claims: usize,
    releases: usize,
}

impl SimState {
    fn allocate<T: QmanObjectKind>(&mut self, object: SimObject) -> QmanObjectId<T> {
        let raw = self.next_oid;
        self.next_oid += 1;
        self.objects.insert(raw, object);
        self.claims += 1;
        QmanObjectId::from_raw(raw).unwrap_or_default()
    }

    fn check_fault(&mut self, kind: &'static str) -> QmanResult<()> {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                Err(QmanError::not_available(kind, "injected claim failure"))
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn has_dependents(&self, raw: RawQmanObjectId) -> bool {
        self.objects.values().any(|o| o.parent() == Some(raw))
    }

    fn expect_kind<T: QmanObjectKind>(
        &self,
        id: QmanObjectId<T>,
        kind: &'static str,
    ) -> QmanResult<&SimObject> {
        match self.objects.get(&id.as_raw()) {
            Some(obj) if obj.kind() == kind => Ok(obj),
            _ => Err(QmanError::not_found(kind, id)),
        }
    }

    fn remove<T: QmanObjectKind>(
        &mut self,
        id: QmanObjectId<T>,
        kind: &'static str,
    ) -> QmanResult<SimObject> {
        self.expect_kind(id, kind)?;
        if self.has_dependents(id.as_raw()) {
            return Err(QmanError::busy(kind, format!("{} still has dependents", id)));
        }
        self.releases += 1;
        self.objects
            .remove(&id.as_raw())
            .ok_or_else(|| QmanError::not_found(kind, id))
    }

    fn domain_of_channel(&self, channel: RawQmanObjectId) -> Option<DomainId> {
        match self.objects.get(&channel) {
            Some(SimObject::Channel { domain, .. }) => Some(*domain),
            _ => None,
        }
    }

    fn channels_in(&self, domain: DomainId) -> usize {
        self.objects
            .values()
            .filter(|o| matches!(o, SimObject::Channel { domain: d, .. } if *d == domain))
            .count()
    }

    fn lfqs_in(&self, domain: DomainId) -> usize {
        self.objects
            .values()
            .filter(|o| matches!(o, SimObject::Lfq { domain: d, .. } if *d == domain))
            .count()
    }

    fn ccg_mut(&mut self, raw: RawQmanObjectId) -> Option<&mut CcgState> {
        match self.objects.get_mut(&raw) {
            Some(SimObject::Ccg(ccg)) => Some(ccg),
            _ => None,
        }
    }
}

/// Simulated CEETM engine.
pub struct SimQman {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimQman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimQman")
            .field("config", &self.config)
            .field("live_objects", &state.objects.len())
            .field("claims", &state.claims)
            .field("releases", &state.releases)
            .finish()
    }
}

impl Default for SimQman {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimQman {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState {
                next_oid: 0x1000,
                ..SimState::default()
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Lets the next `successful` claims through and fails the one after.
    pub fn fail_claim_after(&self, successful: usize) {
        self.state.lock().fail_after = Some(successful);
    }

    /// Number of primitives currently held.
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Total claims and releases performed so far.
    pub fn claim_release_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.claims, state.releases)
    }

    /// Handles of every live frame queue.
    pub fn frame_queues(&self) -> Vec<FrameQueueOid> {
        let state = self.state.lock();
        let mut queues: Vec<FrameQueueOid> = state
            .objects
            .iter()
            .filter(|(_, o)| matches!(o, SimObject::FrameQueue { .. }))
            .filter_map(|(raw, _)| FrameQueueOid::from_raw(*raw))
            .collect();
        queues.sort_by_key(|fq| fq.as_raw());
        queues
    }

    /// Frames waiting on a frame queue.
    pub fn depth(&self, fq: FrameQueueOid) -> Option<usize> {
        match self.state.lock().objects.get(&fq.as_raw()) {
            Some(SimObject::FrameQueue { frames, .. }) => Some(frames.len()),
            _ => None,
        }
    }

    /// Transmits up to `max` frames from the frame queue.
    pub fn drain(&self, fq: FrameQueueOid, max: usize) -> usize {
        let mut notifications = Vec::new();
        let sent = {
            let mut state = self.state.lock();
            Self::drain_locked(&mut state, fq.as_raw(), max, &mut notifications)
        };
        notifications.into_iter().for_each(Notification::deliver);
        sent
    }

    /// Transmits up to `max_per_queue` frames from every frame queue.
    pub fn drain_all(&self, max_per_queue: usize) -> usize {
        let mut notifications = Vec::new();
        let sent = {
            let mut state = self.state.lock();
            let queues: Vec<RawQmanObjectId> = state
                .objects
                .iter()
                .filter(|(_, o)| matches!(o, SimObject::FrameQueue { .. }))
                .map(|(raw, _)| *raw)
                .collect();
            queues
                .into_iter()
                .map(|raw| Self::drain_locked(&mut state, raw, max_per_queue, &mut notifications))
                .sum()
        };
        notifications.into_iter().for_each(Notification::deliver);
        sent
    }

    /// Forces a congestion transition on a group, as a hardware event would.
    pub fn signal_congestion(&self, ccg: CcgOid, congested: bool) -> QmanResult<()> {
        let listener = {
            let mut state = self.state.lock();
            let group = state
                .ccg_mut(ccg.as_raw())
                .ok_or_else(|| QmanError::not_found("ccg", ccg))?;
            group.congested = congested;
            Arc::clone(&group.listener)
        };
        listener.on_congestion_change(ccg, congested);
        Ok(())
    }

    fn drain_locked(
        state: &mut SimState,
        fq: RawQmanObjectId,
        max: usize,
        notifications: &mut Vec<Notification>,
    ) -> usize {
        let (cq, ccg, sent_bytes) = match state.objects.get_mut(&fq) {
            Some(SimObject::FrameQueue {
                cq, ccg, frames, ..
            }) => {
                let n = max.min(frames.len());
                let bytes: u64 = frames.drain(..n).sum();
                (*cq, *ccg, (n, bytes))
            }
            _ => return 0,
        };
        let (sent, bytes) = sent_bytes;
        if sent == 0 {
            return 0;
        }
        if let Some(SimObject::ClassQueue { stats, .. }) = state.objects.get_mut(&cq) {
            stats.frames += sent as u64;
            stats.bytes += bytes;
        }
        if let Some(group) = state.ccg_mut(ccg) {
            group.frames = group.frames.saturating_sub(sent as u64);
            group.bytes = group.bytes.saturating_sub(bytes);
            if group.congested && group.occupancy() <= u64::from(group.thresholds.exit) {
                group.congested = false;
                if let Some(oid) = CcgOid::from_raw(ccg) {
                    notifications.push(Notification::Congestion(
                        Arc::clone(&group.listener),
                        oid,
                        false,
                    ));
                }
            }
        }
        sent
    }
}

impl QmanApi for SimQman {
    fn claim_subportal(&self, domain: DomainId, index: u8) -> QmanResult<SubportalOid> {
        let mut state = self.state.lock();
        if index >= self.config.subportals_per_domain {
            return Err(QmanError::not_available(
                "subportal",
                format!("{} has no sub-portal {}", domain, index),
            ));
        }
        if state.subportals.contains(&(domain, index)) {
            return Err(QmanError::busy("subportal", format!("{}/{}", domain, index)));
        }
        state.check_fault("subportal")?;
        state.subportals.insert((domain, index));
        let oid = state.allocate(SimObject::Subportal { domain, index });
        debug!(%domain, index, ?oid, "claimed sub-portal");
        Ok(oid)
    }

    fn release_subportal(&self, subportal: SubportalOid) -> QmanResult<()> {
        let mut state = self.state.lock();
        let mapped = state.objects.values().any(|o| {
            matches!(o, SimObject::Lni { subportal: Some(sp), .. } if *sp == subportal.as_raw())
        });
        if mapped {
            return Err(QmanError::busy(
                "subportal",
                format!("{} still mapped to an LNI", subportal),
            ));
        }
        if let SimObject::Subportal { domain, index } = state.remove(subportal, "subportal")? {
            state.subportals.remove(&(domain, index));
        }
        Ok(())
    }

    fn claim_lni(&self, domain: DomainId, index: u8) -> QmanResult<LniOid> {
        let mut state = self.state.lock();
        if index >= self.config.lnis_per_domain {
            return Err(QmanError::not_available(
                "lni",
                format!("{} has no LNI {}", domain, index),
            ));
        }
        if state.lnis.contains(&(domain, index)) {
            return Err(QmanError::busy("lni", format!("{}/{}", domain, index)));
        }
        state.check_fault("lni")?;
        state.lnis.insert((domain, index));
        let oid = state.allocate(SimObject::Lni {
            domain,
            index,
            subportal: None,
        });
        debug!(%domain, index, ?oid, "claimed LNI");
        Ok(oid)
    }

    fn release_lni(&self, lni: LniOid) -> QmanResult<()> {
        let mut state = self.state.lock();
        if let SimObject::Lni { domain, index, .. } = state.remove(lni, "lni")? {
            state.lnis.remove(&(domain, index));
        }
        Ok(())
    }

    fn map_subportal(&self, lni: LniOid, subportal: SubportalOid) -> QmanResult<()> {
        let mut state = self.state.lock();
        state.expect_kind(subportal, "subportal")?;
        match state.objects.get_mut(&lni.as_raw()) {
            Some(SimObject::Lni { subportal: sp, .. }) => {
                *sp = Some(subportal.as_raw());
                Ok(())
            }
            _ => Err(QmanError::not_found("lni", lni)),
        }
    }

    fn enable_lni_shaper(&self, lni: LniOid, _overhead: u32) -> QmanResult<()> {
        self.state.lock().expect_kind(lni, "lni").map(|_| ())
    }

    fn set_lni_rate(
        &self,
        lni: LniOid,
        _kind: RateKind,
        rate: TokenRate,
        _limit: u16,
    ) -> QmanResult<()> {
        check_token_rate(rate)?;
        self.state.lock().expect_kind(lni, "lni").map(|_| ())
    }

    fn claim_channel(&self, lni: LniOid) -> QmanResult<ChannelOid> {
        let mut state = self.state.lock();
        let domain = match state.expect_kind(lni, "lni")? {
            SimObject::Lni { domain, .. } => *domain,
            _ => return Err(QmanError::not_found("lni", lni)),
        };
        if state.channels_in(domain) >= usize::from(self.config.channels_per_domain) {
            return Err(QmanError::not_available(
                "channel",
                format!("{} channel pool exhausted", domain),
            ));
        }
        state.check_fault("channel")?;
        let oid = state.allocate(SimObject::Channel {
            domain,
            lni: lni.as_raw(),
            groups: Vec::new(),
        });
        debug!(?lni, ?oid, "claimed channel");
        Ok(oid)
    }

    fn release_channel(&self, channel: ChannelOid) -> QmanResult<()> {
        self.state.lock().remove(channel, "channel").map(|_| ())
    }

    fn enable_channel_shaper(&self, channel: ChannelOid) -> QmanResult<()> {
        self.state.lock().expect_kind(channel, "channel").map(|_| ())
    }

    fn set_channel_rate(
        &self,
        channel: ChannelOid,
        _kind: RateKind,
        rate: TokenRate,
        _limit: u16,
    ) -> QmanResult<()> {
        check_token_rate(rate)?;
        self.state.lock().expect_kind(channel, "channel").map(|_| ())
    }

    fn set_channel_weight(&self, channel: ChannelOid, weight: u32) -> QmanResult<()> {
        if weight == 0 || weight > u32::from(u16::MAX) {
            return Err(QmanError::invalid_parameter(format!(
                "channel weight {} out of range",
                weight
            )));
        }
        self.state.lock().expect_kind(channel, "channel").map(|_| ())
    }

    fn set_channel_group(
        &self,
        channel: ChannelOid,
        group: WbfsGroup,
        priority: u8,
    ) -> QmanResult<()> {
        let mut state = self.state.lock();
        match state.objects.get_mut(&channel.as_raw()) {
            Some(SimObject::Channel { groups, .. }) => {
                groups.retain(|(g, _)| *g != group);
                groups.push((group, priority));
                Ok(())
            }
            _ => Err(QmanError::not_found("channel", channel)),
        }
    }

    fn set_group_eligibility(
        &self,
        channel: ChannelOid,
        _group: WbfsGroup,
        _eligibility: Eligibility,
    ) -> QmanResult<()> {
        self.state.lock().expect_kind(channel, "channel").map(|_| ())
    }

    fn claim_ccg(
        &self,
        channel: ChannelOid,
        index: u8,
        thresholds: &CongestionThresholds,
        listener: Arc<dyn CongestionListener>,
    ) -> QmanResult<CcgOid> {
        let mut state = self.state.lock();
        state.expect_kind(channel, "channel")?;
        if index >= CQ_PER_CHANNEL {
            return Err(QmanError::not_available(
                "ccg",
                format!("channel {} has no group {}", channel, index),
            ));
        }
        if state.channel_slots.contains(&(channel.as_raw(), index)) {
            return Err(QmanError::busy("ccg", format!("{}/{}", channel, index)));
        }
        if thresholds.exit > thresholds.enter {
            return Err(QmanError::invalid_parameter(
                "congestion exit threshold above enter threshold",
            ));
        }
        state.check_fault("ccg")?;
        state.channel_slots.insert((channel.as_raw(), index));
        Ok(state.allocate(SimObject::Ccg(CcgState {
            channel: channel.as_raw(),
            index,
            thresholds: *thresholds,
            listener,
            frames: 0,
            bytes: 0,
            congested: false,
        })))
    }

    fn release_ccg(&self, ccg: CcgOid) -> QmanResult<()> {
        let mut state = self.state.lock();
        let in_use = state.objects.values().any(
            |o| matches!(o, SimObject::ClassQueue { ccg: group, .. } if *group == ccg.as_raw()),
        );
        if in_use {
            return Err(QmanError::busy(
                "ccg",
                format!("{} still accounts a class queue", ccg),
            ));
        }
        if let SimObject::Ccg(group) = state.remove(ccg, "ccg")? {
            state.channel_slots.remove(&(group.channel, group.index));
        }
        Ok(())
    }

    fn claim_class_queue(
        &self,
        channel: ChannelOid,
        index: u8,
        ccg: CcgOid,
    ) -> QmanResult<ClassQueueOid> {
        let mut state = self.state.lock();
        state.expect_kind(channel, "channel")?;
        state.expect_kind(ccg, "ccg")?;
        if index >= CQ_PER_CHANNEL {
            return Err(QmanError::not_available(
                "class_queue",
                format!("channel {} has no class queue {}", channel, index),
            ));
        }
        if state.cq_slots.contains(&(channel.as_raw(), index)) {
            return Err(QmanError::busy(
                "class_queue",
                format!("{}/{}", channel, index),
            ));
        }
        state.check_fault("class_queue")?;
        state.cq_slots.insert((channel.as_raw(), index));
        Ok(state.allocate(SimObject::ClassQueue {
            channel: channel.as_raw(),
            index,
            ccg: ccg.as_raw(),
            stats: DequeueStats::default(),
        }))
    }

    fn release_class_queue(&self, cq: ClassQueueOid) -> QmanResult<()> {
        let mut state = self.state.lock();
        if let SimObject::ClassQueue { channel, index, .. } = state.remove(cq, "class_queue")? {
            state.cq_slots.remove(&(channel, index));
        }
        Ok(())
    }

    fn set_queue_eligibility(
        &self,
        channel: ChannelOid,
        index: u8,
        _eligibility: Eligibility,
    ) -> QmanResult<()> {
        let state = self.state.lock();
        state.expect_kind(channel, "channel")?;
        if !state.cq_slots.contains(&(channel.as_raw(), index)) {
            return Err(QmanError::not_found("class_queue", format!("{}/{}", channel, index)));
        }
        Ok(())
    }

    fn set_queue_weight(&self, cq: ClassQueueOid, weight: WeightCode) -> QmanResult<()> {
        if weight.y > WeightCode::MAX_Y || weight.x > WeightCode::MAX_X {
            return Err(QmanError::invalid_parameter(format!(
                "weight code y={} x={}",
                weight.y, weight.x
            )));
        }
        self.state.lock().expect_kind(cq, "class_queue").map(|_| ())
    }

    fn dequeue_stats(&self, cq: ClassQueueOid, clear: bool) -> QmanResult<DequeueStats> {
        let mut state = self.state.lock();
        match state.objects.get_mut(&cq.as_raw()) {
            Some(SimObject::ClassQueue { stats, .. }) => {
                let current = *stats;
                if clear {
                    *stats = DequeueStats::default();
                }
                Ok(current)
            }
            _ => Err(QmanError::not_found("class_queue", cq)),
        }
    }

    fn claim_lfq(&self, cq: ClassQueueOid) -> QmanResult<LfqOid> {
        let mut state = self.state.lock();
        let channel = match state.expect_kind(cq, "class_queue")? {
            SimObject::ClassQueue { channel, .. } => *channel,
            _ => return Err(QmanError::not_found("class_queue", cq)),
        };
        let domain = state
            .domain_of_channel(channel)
            .ok_or_else(|| QmanError::not_found("channel", format!("0x{:x}", channel)))?;
        if state.lfqs_in(domain) >= self.config.lfqs_per_domain as usize {
            return Err(QmanError::not_available(
                "lfq",
                format!("{} LFQ pool exhausted", domain),
            ));
        }
        state.check_fault("lfq")?;
        Ok(state.allocate(SimObject::Lfq {
            domain,
            cq: cq.as_raw(),
        }))
    }

    fn release_lfq(&self, lfq: LfqOid) -> QmanResult<()> {
        self.state.lock().remove(lfq, "lfq").map(|_| ())
    }

    fn create_frame_queue(&self, lfq: LfqOid, _context_a: u64) -> QmanResult<FrameQueueOid> {
        let mut state = self.state.lock();
        let cq = match state.expect_kind(lfq, "lfq")? {
            SimObject::Lfq { cq, .. } => *cq,
            _ => return Err(QmanError::not_found("lfq", lfq)),
        };
        let ccg = match state.objects.get(&cq) {
            Some(SimObject::ClassQueue { ccg, .. }) => *ccg,
            _ => return Err(QmanError::not_found("class_queue", format!("0x{:x}", cq))),
        };
        state.check_fault("frame_queue")?;
        Ok(state.allocate(SimObject::FrameQueue {
            lfq: lfq.as_raw(),
            cq,
            ccg,
            frames: VecDeque::new(),
        }))
    }

    fn destroy_frame_queue(&self, fq: FrameQueueOid) -> QmanResult<()> {
        let mut state = self.state.lock();
        if let SimObject::FrameQueue { ccg, frames, .. } = state.remove(fq, "frame_queue")? {
            let pending = frames.len() as u64;
            let bytes: u64 = frames.iter().sum();
            if let Some(group) = state.ccg_mut(ccg) {
                group.frames = group.frames.saturating_sub(pending);
                group.bytes = group.bytes.saturating_sub(bytes);
            }
        }
        Ok(())
    }

    fn enqueue(&self, fq: FrameQueueOid, frame: &[u8]) -> QmanResult<()> {
        let notification = {
            let mut state = self.state.lock();
            let len = frame.len() as u64;
            let (ccg, depth) = match state.objects.get(&fq.as_raw()) {
                Some(SimObject::FrameQueue { ccg, frames, .. }) => (*ccg, frames.len()),
                _ => return Err(QmanError::not_found("frame_queue", fq)),
            };

            if let Some(limit) = self.config.queue_limit {
                if depth >= limit as usize {
                    // Accepted by the portal, rejected later by the queue.
                    return match state.ccg_mut(ccg) {
                        Some(group) => {
                            let listener = Arc::clone(&group.listener);
                            drop(state);
                            listener.on_enqueue_rejected(fq);
                            Ok(())
                        }
                        None => Ok(()),
                    };
                }
            }

            if let Some(SimObject::FrameQueue { frames, .. }) = state.objects.get_mut(&fq.as_raw())
            {
                frames.push_back(len);
            }
            match state.ccg_mut(ccg) {
                Some(group) => {
                    group.frames += 1;
                    group.bytes += len;
                    if !group.congested && group.occupancy() >= u64::from(group.thresholds.enter) {
                        group.congested = true;
                        CcgOid::from_raw(ccg).map(|oid| {
                            Notification::Congestion(Arc::clone(&group.listener), oid, true)
                        })
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(notification) = notification {
            notification.deliver();
        }
        Ok(())
    }
}

fn check_token_rate(rate: TokenRate) -> QmanResult<()> {
    if rate.whole > TokenRate::MAX_WHOLE || rate.fraction > TokenRate::MAX_FRACTION {
        return Err(QmanError::invalid_parameter(format!(
            "token rate {}.{} not representable",
            rate.whole, rate.fraction
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<(CcgOid, bool)>>,
        rejected: StdMutex<Vec<FrameQueueOid>>,
    }

    impl CongestionListener for RecordingListener {
        fn on_congestion_change(&self, ccg: CcgOid, congested: bool) {
            self.events.lock().unwrap().push((ccg, congested));
        }

        fn on_enqueue_rejected(&self, fq: FrameQueueOid) {
            self.rejected.lock().unwrap().push(fq);
        }
    }

    fn thresholds(enter: u32, exit: u32) -> CongestionThresholds {
        CongestionThresholds {
            mode: CongestionMode::FrameCount,
            enter,
            exit,
        }
    }

    struct Queue {
        channel: ChannelOid,
        ccg: CcgOid,
        cq: ClassQueueOid,
        lfq: LfqOid,
        fq: FrameQueueOid,
    }

    fn build_queue(sim: &SimQman, listener: Arc<RecordingListener>, t: CongestionThresholds) -> Queue {
        let domain = DomainId(0);
        let sp = sim.claim_subportal(domain, 0).unwrap();
        let lni = sim.claim_lni(domain, 0).unwrap();
        sim.map_subportal(lni, sp).unwrap();
        let channel = sim.claim_channel(lni).unwrap();
        let ccg = sim.claim_ccg(channel, 0, &t, listener).unwrap();
        let cq = sim.claim_class_queue(channel, 0, ccg).unwrap();
        let lfq = sim.claim_lfq(cq).unwrap();
        let fq = sim.create_frame_queue(lfq, 0).unwrap();
        Queue {
            channel,
            ccg,
            cq,
            lfq,
            fq,
        }
    }

    #[test]
    fn test_lni_claim_busy_and_out_of_range() {
        let sim = SimQman::default();
        sim.claim_lni(DomainId(0), 1).unwrap();
        assert!(matches!(
            sim.claim_lni(DomainId(0), 1),
            Err(QmanError::Busy { .. })
        ));
        assert!(matches!(
            sim.claim_lni(DomainId(0), 8),
            Err(QmanError::NotAvailable { .. })
        ));
        // Other domains have their own pool.
        assert!(sim.claim_lni(DomainId(1), 1).is_ok());
    }

    #[test]
    fn test_release_requires_dependents_gone() {
        let sim = SimQman::default();
        let listener = Arc::new(RecordingListener::default());
        let q = build_queue(&sim, listener, thresholds(4, 2));

        assert!(matches!(
            sim.release_channel(q.channel),
            Err(QmanError::Busy { .. })
        ));
        assert!(matches!(sim.release_ccg(q.ccg), Err(QmanError::Busy { .. })));

        sim.destroy_frame_queue(q.fq).unwrap();
        sim.release_lfq(q.lfq).unwrap();
        sim.release_class_queue(q.cq).unwrap();
        sim.release_ccg(q.ccg).unwrap();
        sim.release_channel(q.channel).unwrap();
        assert!(matches!(
            sim.release_channel(q.channel),
            Err(QmanError::NotFound { .. })
        ));
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let sim = SimQman::default();
        sim.fail_claim_after(1);
        assert!(sim.claim_subportal(DomainId(0), 0).is_ok());
        assert!(matches!(
            sim.claim_lni(DomainId(0), 0),
            Err(QmanError::NotAvailable { .. })
        ));
        assert!(sim.claim_lni(DomainId(0), 0).is_ok());
    }

    #[test]
    fn test_congestion_enter_and_exit() {
        let sim = SimQman::default();
        let listener = Arc::new(RecordingListener::default());
        let q = build_queue(&sim, Arc::clone(&listener), thresholds(4, 2));

        for _ in 0..4 {
            sim.enqueue(q.fq, &[0u8; 100]).unwrap();
        }
        assert_eq!(*listener.events.lock().unwrap(), vec![(q.ccg, true)]);

        assert_eq!(sim.drain(q.fq, 1), 1);
        assert_eq!(listener.events.lock().unwrap().len(), 1);
        assert_eq!(sim.drain(q.fq, 1), 1);
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![(q.ccg, true), (q.ccg, false)]
        );

        let stats = sim.dequeue_stats(q.cq, true).unwrap();
        assert_eq!(stats, DequeueStats { frames: 2, bytes: 200 });
        assert_eq!(sim.dequeue_stats(q.cq, false).unwrap(), DequeueStats::default());
    }

    #[test]
    fn test_queue_limit_rejects_through_listener() {
        let sim = SimQman::new(SimConfig {
            queue_limit: Some(1),
            ..SimConfig::default()
        });
        let listener = Arc::new(RecordingListener::default());
        let q = build_queue(&sim, Arc::clone(&listener), thresholds(64, 32));

        sim.enqueue(q.fq, &[1, 2, 3]).unwrap();
        sim.enqueue(q.fq, &[1, 2, 3]).unwrap();
        assert_eq!(sim.depth(q.fq), Some(1));
        assert_eq!(*listener.rejected.lock().unwrap(), vec![q.fq]);
    }
}
