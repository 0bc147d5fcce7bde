use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::backend::DeviceBackend;
use crate::config::DeviceGroupConfig;
use crate::device::{OwnedDevice, QueuePlan};
use crate::error::{GroupError, Result};
use crate::events::{EventSink, GroupEvent, TracingSink};
use crate::inventory::GpuDescriptor;
use crate::memory::{MemoryAllocation, MemoryId};
use crate::pacing::FramePacer;
use crate::peer::PeerAccessLink;
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::sync::{SharedFence, SharedFenceId, SharedSemaphore, SharedSemaphoreId};

/// Runtime state of one multi-GPU session.
///
/// Owns a logical device, compute queue, transfer queue and frame fence per
/// GPU, plus the group's statistics, peer links and shared primitives. All
/// per-GPU storage is sized once in [`create`](Self::create) and indexed by
/// group ordinal.
pub struct DeviceGroupContext {
    pub(crate) config: DeviceGroupConfig,
    pub(crate) backend: Arc<dyn DeviceBackend>,
    pub(crate) events: Arc<dyn EventSink>,
    /// None until `create_device_group` succeeds
    pub(crate) devices: Box<[Option<OwnedDevice>]>,
    pub(crate) stats: Arc<StatsAggregator>,
    pub(crate) target_distribution: Box<[f32]>,
    pub(crate) peer_links: BTreeSet<PeerAccessLink>,
    pub(crate) fences: HashMap<SharedFenceId, SharedFence>,
    pub(crate) semaphores: HashMap<SharedSemaphoreId, SharedSemaphore>,
    /// Never reused, so ids from before a `destroy` stay dead
    pub(crate) next_sync_id: u64,
    pub(crate) allocations: HashMap<MemoryId, MemoryAllocation>,
    pub(crate) next_memory_id: u64,
    pub(crate) pacer: FramePacer,
}

impl DeviceGroupContext {
    /// Create a context that reports events through `tracing`.
    pub fn create(config: DeviceGroupConfig, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        Self::with_event_sink(config, backend, Arc::new(TracingSink))
    }

    /// Create a context with an explicit event sink.
    ///
    /// Fails with `Config` for an empty group or an affinity mask whose length
    /// differs from the GPU count, and with `OutOfMemory` when per-GPU storage
    /// cannot be reserved. An out-of-range primary GPU is clamped to 0.
    pub fn with_event_sink(
        mut config: DeviceGroupConfig,
        backend: Arc<dyn DeviceBackend>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let gpu_count = config.gpu_count();
        if gpu_count == 0 {
            return Err(GroupError::Config(
                "device group needs at least one GPU".to_string(),
            ));
        }

        if let Some(mask) = &config.affinity_mask {
            if mask.len() != gpu_count {
                return Err(GroupError::Config(format!(
                    "affinity mask has {} entries for {} GPU(s)",
                    mask.len(),
                    gpu_count
                )));
            }
        }

        if config.primary_gpu >= gpu_count {
            debug!(
                "primary GPU {} out of range for {} GPU(s), using 0",
                config.primary_gpu, gpu_count
            );
            config.primary_gpu = 0;
        }

        for (i, gpu) in config.gpus.iter_mut().enumerate() {
            gpu.index = i as u32;
        }

        let devices = fixed_len(gpu_count, "logical devices", || None)?;
        let target_distribution =
            fixed_len(gpu_count, "load distribution", || 1.0 / gpu_count as f32)?;
        let stats = Arc::new(StatsAggregator::new(gpu_count)?);

        info!(
            "device group context: {} GPU(s), primary {}",
            gpu_count, config.primary_gpu
        );

        Ok(Self {
            config,
            backend,
            events,
            devices,
            stats,
            target_distribution,
            peer_links: BTreeSet::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            next_sync_id: 1,
            allocations: HashMap::new(),
            next_memory_id: 1,
            pacer: FramePacer::default(),
        })
    }

    /// Materialize a logical device, queues and a frame fence on every GPU.
    ///
    /// On failure every device created by this call is destroyed again and
    /// `DeviceCreation` names the GPU that failed. A group that is already
    /// materialized is left alone.
    pub fn create_device_group(&mut self) -> Result<()> {
        let gpu_count = self.gpu_count();
        if gpu_count == 0 {
            return Err(GroupError::Config("device group has no GPUs".to_string()));
        }
        if self.is_materialized() {
            debug!("device group already materialized");
            return Ok(());
        }

        let mut created: Vec<OwnedDevice> = Vec::with_capacity(gpu_count);

        for (gpu, desc) in self.config.gpus.iter().enumerate() {
            let plan = QueuePlan::select(&desc.queue_families, self.config.affinity_for(gpu));

            let device = OwnedDevice::create(
                &self.backend,
                desc.physical_device,
                &desc.queue_families,
                &plan,
            )
            .map_err(|result| {
                warn!(
                    gpu,
                    "logical device creation failed ({}), rolling back {} device(s)",
                    result,
                    created.len()
                );
                GroupError::DeviceCreation { gpu, result }
            })?;

            self.events.emit(&GroupEvent::DeviceCreated { gpu, gpu_count });
            created.push(device);
        }

        for (slot, device) in self.devices.iter_mut().zip(created) {
            *slot = Some(device);
        }

        self.events.emit(&GroupEvent::DeviceGroupReady { gpu_count });
        Ok(())
    }

    /// Release every native resource the context owns.
    ///
    /// Shared primitives go first, then memory, then logical devices (each
    /// taking its frame fence with it). Calling it again, or on a group that
    /// was never materialized, does nothing.
    pub fn destroy(&mut self) {
        let was_materialized = self.devices.iter().any(Option::is_some);

        self.fences.clear();
        self.semaphores.clear();
        for (_, alloc) in self.allocations.drain() {
            self.stats.record_free(alloc.gpu, alloc.size);
        }
        self.peer_links.clear();
        for slot in self.devices.iter_mut() {
            slot.take();
        }

        if was_materialized {
            self.events.emit(&GroupEvent::DeviceGroupDestroyed {
                gpu_count: self.gpu_count(),
            });
        }
    }

    pub fn set_primary_gpu(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        self.config.primary_gpu = index;
        self.events.emit(&GroupEvent::PrimaryChanged { gpu: index });
        Ok(())
    }

    /// Replace the affinity byte of one GPU. Queue selection picks it up on
    /// the next `create_device_group` after a `destroy`.
    pub fn set_gpu_affinity(&mut self, index: usize, mask: u8) -> Result<()> {
        self.check_index(index)?;
        let gpu_count = self.gpu_count();
        let masks = self
            .config
            .affinity_mask
            .get_or_insert_with(|| vec![crate::config::AFFINITY_ALL; gpu_count]);
        masks[index] = mask;
        Ok(())
    }

    pub fn gpu_count(&self) -> usize {
        self.config.gpu_count()
    }

    pub fn primary_gpu(&self) -> usize {
        self.config.primary_gpu
    }

    pub fn config(&self) -> &DeviceGroupConfig {
        &self.config
    }

    pub fn gpu_info(&self, index: usize) -> Result<&GpuDescriptor> {
        self.check_index(index)?;
        Ok(&self.config.gpus[index])
    }

    /// True once every GPU has a logical device.
    pub fn is_materialized(&self) -> bool {
        self.devices.iter().all(Option::is_some)
    }

    pub fn logical_device(&self, index: usize) -> Option<vk::Device> {
        self.device(index).map(OwnedDevice::handle)
    }

    pub fn compute_queue(&self, index: usize) -> Option<vk::Queue> {
        self.device(index).and_then(|d| d.compute_queue)
    }

    pub fn transfer_queue(&self, index: usize) -> Option<vk::Queue> {
        self.device(index).and_then(|d| d.transfer_queue)
    }

    // ── Statistics ──────────────────────────────────────────

    /// `(utilization, bytes_transferred)`; zeros for an out-of-range index.
    pub fn get_gpu_stats(&self, index: usize) -> (f32, u64) {
        self.stats.gpu_stats(index)
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle for monitoring threads polling alongside the frame loop.
    pub fn stats_handle(&self) -> Arc<StatsAggregator> {
        Arc::clone(&self.stats)
    }

    /// Feed a utilization sample (already smoothed by the caller).
    pub fn record_utilization(&mut self, gpu: usize, sample: f32) {
        self.stats.record_utilization(gpu, sample);
    }

    pub fn record_transfer(&mut self, gpu: usize, bytes: u64) {
        self.stats.record_transfer(gpu, bytes);
    }

    // ── Internal helpers ────────────────────────────────────

    pub(crate) fn check_index(&self, index: usize) -> Result<()> {
        let count = self.gpu_count();
        if index >= count {
            return Err(GroupError::Index { index, count });
        }
        Ok(())
    }

    pub(crate) fn device(&self, index: usize) -> Option<&OwnedDevice> {
        self.devices.get(index).and_then(Option::as_ref)
    }

    /// The GPU's device, or `Config` when the group has not been created yet.
    pub(crate) fn materialized_device(&self, index: usize) -> Result<&OwnedDevice> {
        self.check_index(index)?;
        self.device(index).ok_or_else(not_materialized)
    }

    pub(crate) fn materialized_device_mut(&mut self, index: usize) -> Result<&mut OwnedDevice> {
        self.check_index(index)?;
        self.devices
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(not_materialized)
    }
}

fn not_materialized() -> GroupError {
    GroupError::Config("device group has not been created".to_string())
}

impl Drop for DeviceGroupContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Fixed-length per-GPU storage, reserved fallibly.
pub(crate) fn fixed_len<T>(len: usize, what: &str, fill: impl FnMut() -> T) -> Result<Box<[T]>> {
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(len)
        .map_err(|_| GroupError::OutOfMemory(format!("{what} for {len} GPU(s)")))?;
    storage.extend(std::iter::repeat_with(fill).take(len));
    Ok(storage.into_boxed_slice())
}
