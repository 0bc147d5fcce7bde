pub mod backend;
pub mod balancer;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod events;
pub mod inventory;
pub mod memory;
pub mod pacing;
pub mod peer;
pub mod stats;
pub mod sync;

pub use backend::{DeviceBackend, VulkanBackend};
pub use config::{DeviceGroupConfig, MgpuConfig};
pub use context::DeviceGroupContext;
pub use error::{GroupError, Result};
pub use events::{EventSink, GroupEvent, TracingSink};
pub use inventory::{enumerate, GpuDescriptor};
pub use memory::MemoryId;
pub use pacing::FrameState;
pub use peer::PeerAccessLink;
pub use stats::{StatsAggregator, StatsSnapshot};
pub use sync::{SharedFenceId, SharedSemaphoreId};
