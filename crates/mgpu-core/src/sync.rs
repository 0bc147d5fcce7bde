//! Group-wide fences and semaphores, completion waits and work submission.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use tracing::{debug, warn};

use crate::backend::DeviceBackend;
use crate::context::DeviceGroupContext;
use crate::error::{GroupError, Result};
use crate::events::GroupEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedFenceId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedSemaphoreId(u64);

/// One fence per logical device in the group, indexed by GPU ordinal.
pub struct SharedFence {
    backend: Arc<dyn DeviceBackend>,
    fences: Vec<(vk::Device, vk::Fence)>,
}

/// One binary semaphore per logical device in the group.
pub struct SharedSemaphore {
    backend: Arc<dyn DeviceBackend>,
    semaphores: Vec<(vk::Device, vk::Semaphore)>,
}

impl SharedFence {
    pub fn handle(&self, gpu: usize) -> Option<vk::Fence> {
        self.fences.get(gpu).map(|(_, f)| *f)
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

impl SharedSemaphore {
    pub fn handle(&self, gpu: usize) -> Option<vk::Semaphore> {
        self.semaphores.get(gpu).map(|(_, s)| *s)
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }
}

impl Drop for SharedFence {
    fn drop(&mut self) {
        for (device, fence) in self.fences.drain(..) {
            self.backend.destroy_fence(device, fence);
        }
    }
}

impl Drop for SharedSemaphore {
    fn drop(&mut self) {
        for (device, semaphore) in self.semaphores.drain(..) {
            self.backend.destroy_semaphore(device, semaphore);
        }
    }
}

impl DeviceGroupContext {
    /// Create an unsignaled fence on every GPU. The context keeps it until teardown.
    pub fn create_shared_fence(&mut self) -> Result<SharedFenceId> {
        let devices = self.all_device_handles()?;
        let mut shared = SharedFence {
            backend: Arc::clone(&self.backend),
            fences: Vec::with_capacity(devices.len()),
        };
        for device in devices {
            // Partial sets are released by SharedFence's Drop on the error path.
            let fence = self
                .backend
                .create_fence(device, false)
                .map_err(GroupError::Vulkan)?;
            shared.fences.push((device, fence));
        }

        let id = SharedFenceId(self.take_sync_id());
        self.fences.insert(id, shared);
        debug!("shared fence {:?} created across {} GPU(s)", id, self.gpu_count());
        Ok(id)
    }

    pub fn create_shared_semaphore(&mut self) -> Result<SharedSemaphoreId> {
        let devices = self.all_device_handles()?;
        let mut shared = SharedSemaphore {
            backend: Arc::clone(&self.backend),
            semaphores: Vec::with_capacity(devices.len()),
        };
        for device in devices {
            let semaphore = self
                .backend
                .create_semaphore(device)
                .map_err(GroupError::Vulkan)?;
            shared.semaphores.push((device, semaphore));
        }

        let id = SharedSemaphoreId(self.take_sync_id());
        self.semaphores.insert(id, shared);
        debug!("shared semaphore {:?} created across {} GPU(s)", id, self.gpu_count());
        Ok(id)
    }

    pub fn shared_fence(&self, id: SharedFenceId) -> Option<&SharedFence> {
        self.fences.get(&id)
    }

    pub fn shared_semaphore(&self, id: SharedSemaphoreId) -> Option<&SharedSemaphore> {
        self.semaphores.get(&id)
    }

    /// Mask with one bit set per GPU in the group.
    pub fn all_gpus_mask(&self) -> u32 {
        match self.gpu_count() {
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }

    /// Block until every GPU in `gpu_mask` has signaled its frame fence.
    ///
    /// `timeout` bounds the whole call, not each GPU. Fails with `Timeout`
    /// when it elapses, and with `Config` for an empty mask, a bit beyond the
    /// group, or a group that has not been created.
    pub fn wait_for_completion(&self, gpu_mask: u32, timeout: Duration) -> Result<()> {
        let selected = self.gpus_in_mask(gpu_mask)?;
        let mut targets = Vec::with_capacity(selected.len());
        for &gpu in &selected {
            targets.push((gpu, self.materialized_device(gpu)?));
        }

        let start = Instant::now();
        let deadline = start.checked_add(timeout);

        for (gpu, device) in targets {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            let timeout_ns = u64::try_from(remaining.as_nanos()).unwrap_or(u64::MAX);

            match self
                .backend
                .wait_for_fence(device.raw, device.frame_fence, timeout_ns)
            {
                Ok(()) => {}
                Err(vk::Result::TIMEOUT) => {
                    debug!(gpu, "wait for completion timed out after {:?}", start.elapsed());
                    return Err(GroupError::Timeout(timeout));
                }
                Err(e) => return Err(GroupError::Vulkan(e)),
            }
        }
        Ok(())
    }

    /// Submit command buffers to `gpu`'s compute queue (transfer queue if the
    /// affinity mask left it without one), signaling its frame fence, and
    /// count `bytes` as transferred by that GPU.
    pub fn submit_work(
        &mut self,
        gpu: usize,
        command_buffers: &[vk::CommandBuffer],
        bytes: u64,
    ) -> Result<()> {
        let device = self.materialized_device(gpu)?;
        let queue = device
            .compute_queue
            .or(device.transfer_queue)
            .ok_or_else(|| {
                GroupError::Unsupported(format!(
                    "GPU {} has no compute or transfer queue under its affinity mask",
                    gpu
                ))
            })?;
        let (raw, fence) = (device.raw, device.frame_fence);

        self.backend
            .reset_fence(raw, fence)
            .map_err(GroupError::Vulkan)?;
        if let Err(e) = self.backend.queue_submit(raw, queue, command_buffers, fence) {
            // Nothing will signal the reset fence now; give the GPU a signaled one.
            if let Err(replace) = self.materialized_device_mut(gpu)?.replace_frame_fence() {
                warn!(gpu, "could not restore frame fence after failed submit: {}", replace);
            }
            return Err(GroupError::Vulkan(e));
        }

        self.stats.record_submission(gpu);
        self.stats.record_transfer(gpu, bytes);
        self.events.emit(&GroupEvent::WorkSubmitted {
            gpu,
            command_buffers: command_buffers.len(),
            bytes,
        });
        Ok(())
    }

    /// Ordinals selected by `gpu_mask`. `Config` for an empty mask or a bit
    /// beyond the group.
    pub(crate) fn gpus_in_mask(&self, gpu_mask: u32) -> Result<Vec<usize>> {
        if gpu_mask == 0 {
            return Err(GroupError::Config("GPU mask selects no GPU".to_string()));
        }
        let stray = gpu_mask & !self.all_gpus_mask();
        if stray != 0 {
            return Err(GroupError::Config(format!(
                "GPU mask {:#x} selects GPU(s) outside the group of {}",
                gpu_mask,
                self.gpu_count()
            )));
        }
        Ok((0..self.gpu_count())
            .filter(|&gpu| gpu < 32 && gpu_mask & (1 << gpu) != 0)
            .collect())
    }

    fn take_sync_id(&mut self) -> u64 {
        let id = self.next_sync_id;
        self.next_sync_id += 1;
        id
    }

    fn all_device_handles(&self) -> Result<Vec<vk::Device>> {
        (0..self.gpu_count())
            .map(|gpu| self.materialized_device(gpu).map(|d| d.raw))
            .collect()
    }
}
