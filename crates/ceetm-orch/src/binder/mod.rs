//! Hardware resource binding for scheduling nodes.
//!
//! A root node holds a [`LinkBinding`], an inner node a [`ChannelBinding`]
//! and a leaf a [`QueueBinding`]. The [`HardwareResourceBinder`] is the only
//! place primitives are claimed or released.

mod claim;
mod pool;
mod types;

pub use claim::{BinderSettings, HardwareResourceBinder};
pub use pool::DomainResourcePool;
pub use types::{
    BindError, BindResult, ChannelBinding, HardwareBinding, LeafSetup, LinkBinding, PortLocation,
    Primitive, QueueBinding,
};
