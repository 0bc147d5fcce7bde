//! Per-GPU logical device ownership.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::backend::{DeviceBackend, QueueRequest};
use crate::config::{AFFINITY_COMPUTE, AFFINITY_GRAPHICS, AFFINITY_TRANSFER};
use crate::inventory::QueueFamilyInfo;

/// Which queue families to request for one GPU, given its affinity byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePlan {
    pub graphics_family: Option<u32>,
    pub compute_family: Option<u32>,
    pub transfer_family: Option<u32>,
}

impl QueuePlan {
    pub fn select(families: &[QueueFamilyInfo], affinity: u8) -> Self {
        let compute = find_family(families, |f| f.compute);

        let graphics_family = if affinity & AFFINITY_GRAPHICS != 0 {
            find_family(families, |f| f.graphics)
        } else {
            None
        };

        let compute_family = if affinity & AFFINITY_COMPUTE != 0 {
            compute
        } else {
            None
        };

        // Prefer a DMA-only family, then share the compute family, then anything.
        let transfer_family = if affinity & AFFINITY_TRANSFER != 0 {
            find_family(families, QueueFamilyInfo::is_dedicated_transfer)
                .or(compute)
                .or_else(|| find_family(families, |f| f.transfer))
        } else {
            None
        };

        Self {
            graphics_family,
            compute_family,
            transfer_family,
        }
    }

    /// Distinct families to create queues from. Never empty when any family
    /// has queues, since a logical device needs at least one.
    pub fn requests(&self, families: &[QueueFamilyInfo]) -> Vec<QueueRequest> {
        let mut out: Vec<QueueRequest> = Vec::with_capacity(3);
        for family in [self.graphics_family, self.compute_family, self.transfer_family]
            .into_iter()
            .flatten()
        {
            if !out.iter().any(|r| r.family_index == family) {
                out.push(QueueRequest { family_index: family });
            }
        }

        if out.is_empty() {
            if let Some(i) = families.iter().position(|f| f.queue_count > 0) {
                out.push(QueueRequest {
                    family_index: i as u32,
                });
            }
        }
        out
    }
}

fn find_family(
    families: &[QueueFamilyInfo],
    pred: impl Fn(&QueueFamilyInfo) -> bool,
) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && pred(f))
        .map(|i| i as u32)
}

/// A logical device plus the handles derived from it.
///
/// Dropping it destroys the frame fence and then the device; queues are
/// owned by the device and go with it.
pub struct OwnedDevice {
    backend: Arc<dyn DeviceBackend>,
    pub(crate) raw: vk::Device,
    pub(crate) compute_queue: Option<vk::Queue>,
    pub(crate) transfer_queue: Option<vk::Queue>,
    /// Signaled when the GPU's last submission completes
    pub(crate) frame_fence: vk::Fence,
}

impl OwnedDevice {
    pub(crate) fn create(
        backend: &Arc<dyn DeviceBackend>,
        physical_device: vk::PhysicalDevice,
        families: &[QueueFamilyInfo],
        plan: &QueuePlan,
    ) -> Result<Self, vk::Result> {
        let requests = plan.requests(families);
        let raw = backend.create_device(physical_device, &requests)?;

        let mut device = Self {
            backend: Arc::clone(backend),
            raw,
            compute_queue: None,
            transfer_queue: None,
            frame_fence: vk::Fence::null(),
        };

        device.compute_queue = plan.compute_family.map(|f| backend.device_queue(raw, f, 0));
        device.transfer_queue = plan.transfer_family.map(|f| backend.device_queue(raw, f, 0));
        // Created signaled so a wait before the first submission returns at once.
        device.frame_fence = backend.create_fence(raw, true)?;

        Ok(device)
    }

    pub fn handle(&self) -> vk::Device {
        self.raw
    }

    /// Swap the frame fence for a new signaled one (the host cannot signal
    /// a fence that was reset but never submitted).
    pub(crate) fn replace_frame_fence(&mut self) -> Result<(), vk::Result> {
        let fresh = self.backend.create_fence(self.raw, true)?;
        let stale = std::mem::replace(&mut self.frame_fence, fresh);
        self.backend.destroy_fence(self.raw, stale);
        Ok(())
    }
}

impl Drop for OwnedDevice {
    fn drop(&mut self) {
        if self.frame_fence != vk::Fence::null() {
            self.backend.destroy_fence(self.raw, self.frame_fence);
        }
        self.backend.destroy_device(self.raw);
        debug!("released logical device {:?}", self.raw);
    }
}
