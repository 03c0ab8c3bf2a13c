//! Type-safe CEETM object handles and hardware value types.
//!
//! Every claimed primitive is identified by a raw 64-bit token handed out by
//! the queue manager. The phantom kind parameter keeps tokens of different
//! primitives apart at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Raw handle value as returned by the queue manager.
pub type RawQmanObjectId = u64;

/// Number of class queues (and congestion groups) behind one channel.
pub const CQ_PER_CHANNEL: u8 = 16;

/// Number of strict-priority class queues behind one channel.
pub const PRIO_QUEUES_PER_CHANNEL: u8 = 8;

/// Marker trait for CEETM object kinds.
pub trait QmanObjectKind: Send + Sync + 'static {
    /// Returns the primitive name used in logs and errors.
    fn type_name() -> &'static str;
}

/// A type-safe handle to a claimed CEETM primitive.
///
/// # Examples
///
/// ```
/// use ceetm_qman::{ChannelOid, LniOid};
///
/// let lni = LniOid::from_raw(0x1000).unwrap();
/// let channel = ChannelOid::from_raw(0x1001).unwrap();
/// assert_eq!(format!("{:?}", lni), "Lni(0x0000000000001000)");
///
/// // fn takes_lni(l: LniOid) {}
/// // takes_lni(channel);  // Error: expected LniOid, found ChannelOid
/// # let _ = channel;
/// ```
pub struct QmanObjectId<T: QmanObjectKind> {
    raw: RawQmanObjectId,
    _marker: PhantomData<T>,
}

impl<T: QmanObjectKind> QmanObjectId<T> {
    /// The null handle.
    pub const NULL: Self = Self {
        raw: 0,
        _marker: PhantomData,
    };

    /// Creates a handle from a raw value.
    ///
    /// Returns `None` if the raw value is 0.
    pub fn from_raw(raw: RawQmanObjectId) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self {
                raw,
                _marker: PhantomData,
            })
        }
    }

    /// Returns the raw handle value.
    pub const fn as_raw(&self) -> RawQmanObjectId {
        self.raw
    }

    /// Returns true if this is the null handle.
    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }
}

// written out so the handle is Copy whatever the marker type is
impl<T: QmanObjectKind> Clone for QmanObjectId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: QmanObjectKind> Copy for QmanObjectId<T> {}

impl<T: QmanObjectKind> fmt::Debug for QmanObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:016x})", T::type_name(), self.raw)
    }
}

impl<T: QmanObjectKind> fmt::Display for QmanObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.raw)
    }
}

impl<T: QmanObjectKind> PartialEq for QmanObjectId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: QmanObjectKind> Eq for QmanObjectId<T> {}

impl<T: QmanObjectKind> Hash for QmanObjectId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: QmanObjectKind> Default for QmanObjectId<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T: QmanObjectKind> Serialize for QmanObjectId<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

macro_rules! define_object_kind {
    ($name:ident, $type_name:literal, $oid_alias:ident) => {
        /// Marker type for CEETM
        #[doc = $type_name]
        /// objects.
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl QmanObjectKind for $name {
            fn type_name() -> &'static str {
                $type_name
            }
        }

        /// Handle to a claimed
        #[doc = $type_name]
        pub type $oid_alias = QmanObjectId<$name>;
    };
}

define_object_kind!(SubportalKind, "Subportal", SubportalOid);
define_object_kind!(LniKind, "Lni", LniOid);
define_object_kind!(ChannelKind, "Channel", ChannelOid);
define_object_kind!(CcgKind, "Ccg", CcgOid);
define_object_kind!(ClassQueueKind, "ClassQueue", ClassQueueOid);
define_object_kind!(LfqKind, "Lfq", LfqOid);
define_object_kind!(FrameQueueKind, "FrameQueue", FrameQueueOid);

/// Queue-manager domain (one per DCP portal) that owns a pool of LNIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub u8);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dcp{}", self.0)
    }
}

/// Hardware-native token rate: bytes per update tick as an 11.13 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TokenRate {
    pub whole: u16,
    pub fraction: u16,
}

impl TokenRate {
    pub const WHOLE_BITS: u32 = 11;
    pub const FRACTION_BITS: u32 = 13;
    pub const MAX_WHOLE: u16 = (1 << Self::WHOLE_BITS) - 1;
    pub const MAX_FRACTION: u16 = (1 << Self::FRACTION_BITS) - 1;

    /// Returns the rate as a single fixed-point value.
    pub const fn as_scaled(&self) -> u32 {
        ((self.whole as u32) << Self::FRACTION_BITS) | self.fraction as u32
    }
}

/// Which token bucket of a dual-rate shaper is being programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateKind {
    /// Committed rate (CR).
    Commit,
    /// Excess rate (ER), the peak above committed.
    Excess,
}

impl fmt::Display for RateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateKind::Commit => write!(f, "commit"),
            RateKind::Excess => write!(f, "excess"),
        }
    }
}

/// Log-scale WBFS queue weight: `weight = (8 + x) * 2^y / 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WeightCode {
    pub y: u8,
    pub x: u8,
}

impl WeightCode {
    pub const MAX_Y: u8 = 7;
    pub const MAX_X: u8 = 7;

    /// Returns the weight this code represents, rounded down.
    pub const fn weight(&self) -> u32 {
        ((8 + self.x as u32) << self.y) / 8
    }
}

/// Committed/excess eligibility of a queue or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Eligibility {
    #[serde(default = "default_eligible")]
    pub cr: bool,
    #[serde(default = "default_eligible")]
    pub er: bool,
}

fn default_eligible() -> bool {
    true
}

impl Default for Eligibility {
    fn default() -> Self {
        Self { cr: true, er: true }
    }
}

/// WBFS group selector on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WbfsGroup {
    /// First half group, class queues 8..12.
    A,
    /// Second half group, class queues 12..16.
    B,
    /// Single group spanning class queues 8..16.
    Both,
}

impl WbfsGroup {
    /// First class-queue index used by the group.
    pub const fn first_queue(&self) -> u8 {
        match self {
            WbfsGroup::A | WbfsGroup::Both => PRIO_QUEUES_PER_CHANNEL,
            WbfsGroup::B => PRIO_QUEUES_PER_CHANNEL + 4,
        }
    }

    /// Number of class queues in the group.
    pub const fn queue_count(&self) -> u8 {
        match self {
            WbfsGroup::A | WbfsGroup::B => 4,
            WbfsGroup::Both => 8,
        }
    }
}

impl fmt::Display for WbfsGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WbfsGroup::A => write!(f, "A"),
            WbfsGroup::B => write!(f, "B"),
            WbfsGroup::Both => write!(f, "A+B"),
        }
    }
}

/// How a congestion group measures its occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionMode {
    ByteCount,
    FrameCount,
}

/// Enter/exit thresholds of a congestion group.
///
/// The group turns congested once occupancy reaches `enter` and clears again
/// when it falls to `exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CongestionThresholds {
    pub mode: CongestionMode,
    pub enter: u32,
    pub exit: u32,
}

impl Default for CongestionThresholds {
    fn default() -> Self {
        Self {
            mode: CongestionMode::FrameCount,
            enter: 64,
            exit: 32,
        }
    }
}

/// Dequeue counters of a class queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DequeueStats {
    pub frames: u64,
    pub bytes: u64,
}
