//! Hardware binding types.

use std::fmt;
use std::sync::Arc;

use ceetm_qman::{
    CcgOid, ChannelOid, ClassQueueOid, DomainId, Eligibility, FrameQueueOid, LfqOid, LniOid,
    QmanError, SubportalOid, WeightCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::congestion::CongestionState;
use crate::rate::RateError;

/// Kind of hardware primitive an operation was working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    LinkIndex,
    Subportal,
    Lni,
    LinkShaper,
    Channel,
    ChannelShaper,
    CongestionGroup,
    ClassQueue,
    LogicalQueue,
    FrameQueue,
    WbfsGroup,
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Primitive::LinkIndex => "link index",
            Primitive::Subportal => "sub-portal",
            Primitive::Lni => "LNI",
            Primitive::LinkShaper => "link shaper",
            Primitive::Channel => "channel",
            Primitive::ChannelShaper => "channel shaper",
            Primitive::CongestionGroup => "congestion group",
            Primitive::ClassQueue => "class queue",
            Primitive::LogicalQueue => "logical frame queue",
            Primitive::FrameQueue => "frame queue",
            Primitive::WbfsGroup => "WBFS group",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("{primitive}: {source}")]
    Hardware {
        primitive: Primitive,
        #[source]
        source: QmanError,
    },

    #[error("{primitive}: {source}")]
    Rate {
        primitive: Primitive,
        #[source]
        source: RateError,
    },
}

impl BindError {
    pub fn primitive(&self) -> Primitive {
        match self {
            BindError::Hardware { primitive, .. } | BindError::Rate { primitive, .. } => *primitive,
        }
    }
}

pub type BindResult<T> = Result<T, BindError>;

/// Where a device sits on the queue manager, as the naming service reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortLocation {
    pub domain: DomainId,
    pub subportal: u8,
    /// LNI index inside the domain.
    pub link: u8,
    pub mtu: u16,
}

/// Primitives held by a root node.
#[derive(Debug)]
pub struct LinkBinding {
    pub port: PortLocation,
    pub subportal: SubportalOid,
    pub lni: LniOid,
}

/// Primitives held by an inner node: the channel and its congestion groups.
#[derive(Debug)]
pub struct ChannelBinding {
    pub channel: ChannelOid,
    /// Group `i` accounts class queue `i`.
    pub groups: Vec<CcgOid>,
    pub mtu: u16,
}

impl ChannelBinding {
    pub fn group(&self, index: u8) -> Option<CcgOid> {
        self.groups.get(usize::from(index)).copied()
    }
}

/// Primitives held by a leaf: one class queue and the queues feeding it.
#[derive(Debug)]
pub struct QueueBinding {
    pub index: u8,
    pub channel: ChannelOid,
    pub ccg: CcgOid,
    pub class_queue: ClassQueueOid,
    pub lfq: LfqOid,
    pub frame_queue: FrameQueueOid,
    pub state: Arc<CongestionState>,
}

/// Everything a node holds in hardware. Exactly one node owns each binding.
#[derive(Debug)]
pub enum HardwareBinding {
    Link(LinkBinding),
    Channel(ChannelBinding),
    Queue(QueueBinding),
}

impl HardwareBinding {
    pub fn as_link(&self) -> Option<&LinkBinding> {
        match self {
            HardwareBinding::Link(link) => Some(link),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&ChannelBinding> {
        match self {
            HardwareBinding::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn as_queue(&self) -> Option<&QueueBinding> {
        match self {
            HardwareBinding::Queue(queue) => Some(queue),
            _ => None,
        }
    }

    /// The primitives behind this binding, in the order they were claimed.
    pub(crate) fn into_claims(self) -> Vec<Claimed> {
        match self {
            HardwareBinding::Link(link) => vec![
                Claimed::LinkIndex {
                    domain: link.port.domain,
                    index: link.port.link,
                },
                Claimed::Subportal(link.subportal),
                Claimed::Lni(link.lni),
            ],
            HardwareBinding::Channel(channel) => {
                let mut claims = Vec::with_capacity(channel.groups.len() + 1);
                claims.push(Claimed::Channel(channel.channel));
                claims.extend(channel.groups.into_iter().map(Claimed::Ccg));
                claims
            }
            HardwareBinding::Queue(queue) => vec![
                Claimed::ClassQueue(queue.class_queue),
                Claimed::Lfq(queue.lfq),
                Claimed::FrameQueue(queue.frame_queue),
                Claimed::Tracking {
                    ccg: queue.ccg,
                    fq: queue.frame_queue,
                },
            ],
        }
    }
}

/// How a new leaf's class queue is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafSetup {
    Prio(Eligibility),
    Wbfs(WeightCode),
}

/// One acquired resource. Released in reverse claim order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claimed {
    LinkIndex { domain: DomainId, index: u8 },
    Subportal(SubportalOid),
    Lni(LniOid),
    Channel(ChannelOid),
    Ccg(CcgOid),
    ClassQueue(ClassQueueOid),
    Lfq(LfqOid),
    FrameQueue(FrameQueueOid),
    Tracking { ccg: CcgOid, fq: FrameQueueOid },
}
