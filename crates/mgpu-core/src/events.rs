use std::time::Duration;

use tracing::{debug, info};

/// Structured event emitted at the coordinator's lifecycle points.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    DeviceCreated { gpu: usize, gpu_count: usize },
    DeviceGroupReady { gpu_count: usize },
    DeviceGroupDestroyed { gpu_count: usize },
    PrimaryChanged { gpu: usize },
    MemoryAllocated { gpu: usize, size: u64 },
    MemoryFreed { gpu: usize, size: u64 },
    MemoryBound { gpu: usize, gpu_mask: u32 },
    WorkSubmitted { gpu: usize, command_buffers: usize, bytes: u64 },
    PeerAccessChanged { source: usize, dest: usize, enabled: bool },
    LoadBalanced { distribution: Vec<f32> },
    FrameCompleted { frame: u64, frame_time: Duration },
}

/// Receiver for [`GroupEvent`]s. Fire-and-forget: the coordinator never
/// looks at what the sink does with an event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &GroupEvent);
}

/// Default sink: forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &GroupEvent) {
        match event {
            GroupEvent::DeviceCreated { gpu, gpu_count } => {
                info!(gpu, gpu_count, "logical device created");
            }
            GroupEvent::DeviceGroupReady { gpu_count } => {
                info!(gpu_count, "device group ready");
            }
            GroupEvent::DeviceGroupDestroyed { gpu_count } => {
                info!(gpu_count, "device group destroyed");
            }
            GroupEvent::PrimaryChanged { gpu } => {
                info!(gpu, "primary GPU changed");
            }
            GroupEvent::MemoryAllocated { gpu, size } => {
                debug!(gpu, size, "device memory allocated");
            }
            GroupEvent::MemoryFreed { gpu, size } => {
                debug!(gpu, size, "device memory freed");
            }
            GroupEvent::MemoryBound { gpu, gpu_mask } => {
                debug!(gpu, gpu_mask, "device memory bound to GPU mask");
            }
            GroupEvent::WorkSubmitted {
                gpu,
                command_buffers,
                bytes,
            } => {
                debug!(gpu, command_buffers, bytes, "work submitted");
            }
            GroupEvent::PeerAccessChanged {
                source,
                dest,
                enabled,
            } => {
                info!(source, dest, enabled, "peer access changed");
            }
            GroupEvent::LoadBalanced { distribution } => {
                info!(?distribution, "load distribution updated");
            }
            GroupEvent::FrameCompleted { frame, frame_time } => {
                debug!(frame, ?frame_time, "frame completed");
            }
        }
    }
}
