//! Device memory placed on a chosen GPU.

use std::sync::Arc;

use ash::vk;

use crate::backend::DeviceBackend;
use crate::context::DeviceGroupContext;
use crate::error::{GroupError, Result};
use crate::events::GroupEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId(u64);

/// A device-memory allocation on one GPU, freed when dropped.
pub struct MemoryAllocation {
    backend: Arc<dyn DeviceBackend>,
    device: vk::Device,
    memory: vk::DeviceMemory,
    pub(crate) gpu: usize,
    pub(crate) size: u64,
    /// GPUs allowed to access the memory; starts as just the owner
    gpu_mask: u32,
}

impl MemoryAllocation {
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn gpu(&self) -> usize {
        self.gpu
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_mask(&self) -> u32 {
        self.gpu_mask
    }
}

impl Drop for MemoryAllocation {
    fn drop(&mut self) {
        self.backend.free_memory(self.device, self.memory);
    }
}

impl DeviceGroupContext {
    /// Allocate `size` bytes of `memory_type_index` memory on `target_gpu`.
    pub fn allocate_memory(
        &mut self,
        target_gpu: usize,
        size: u64,
        memory_type_index: u32,
    ) -> Result<MemoryId> {
        if size == 0 {
            return Err(GroupError::Range("allocation size must be non-zero".to_string()));
        }
        let device = self.materialized_device(target_gpu)?.raw;

        let memory = self
            .backend
            .allocate_memory(device, size, memory_type_index)
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    GroupError::OutOfMemory(format!(
                        "{} bytes on GPU {} ({})",
                        size, target_gpu, e
                    ))
                }
                other => GroupError::Vulkan(other),
            })?;

        let id = MemoryId(self.next_memory_id);
        self.next_memory_id += 1;
        self.allocations.insert(
            id,
            MemoryAllocation {
                backend: Arc::clone(&self.backend),
                device,
                memory,
                gpu: target_gpu,
                size,
                gpu_mask: owner_mask(target_gpu),
            },
        );

        self.stats.record_allocation(target_gpu, size);
        self.events.emit(&GroupEvent::MemoryAllocated {
            gpu: target_gpu,
            size,
        });
        Ok(id)
    }

    /// Free an allocation. Unknown ids are ignored.
    pub fn free_memory(&mut self, id: MemoryId) {
        if let Some(alloc) = self.allocations.remove(&id) {
            self.stats.record_free(alloc.gpu, alloc.size);
            self.events.emit(&GroupEvent::MemoryFreed {
                gpu: alloc.gpu,
                size: alloc.size,
            });
        }
    }

    /// Make an allocation visible to every GPU in `gpu_mask`.
    ///
    /// The mask is checked like `wait_for_completion`'s. Each GPU in it other
    /// than the owner needs a peer link from the owner, else `Unsupported`.
    /// Leaving the owner out of the mask is allowed.
    pub fn bind_to_gpus(&mut self, id: MemoryId, gpu_mask: u32) -> Result<()> {
        let selected = self.gpus_in_mask(gpu_mask)?;
        let owner = self
            .allocations
            .get(&id)
            .map(|a| a.gpu)
            .ok_or_else(|| GroupError::Config(format!("unknown memory allocation {:?}", id)))?;

        if let Some(gpu) = selected
            .iter()
            .copied()
            .find(|&gpu| gpu != owner && !self.has_peer_access(owner, gpu))
        {
            return Err(GroupError::Unsupported(format!(
                "GPU {} has no peer access to memory on GPU {}",
                gpu, owner
            )));
        }

        if let Some(alloc) = self.allocations.get_mut(&id) {
            alloc.gpu_mask = gpu_mask;
        }
        self.events.emit(&GroupEvent::MemoryBound {
            gpu: owner,
            gpu_mask,
        });
        Ok(())
    }

    pub fn memory_allocation(&self, id: MemoryId) -> Option<&MemoryAllocation> {
        self.allocations.get(&id)
    }

    /// Bytes currently allocated on `gpu` through this context.
    pub fn allocated_bytes(&self, gpu: usize) -> u64 {
        self.stats.allocated_bytes(gpu)
    }
}

fn owner_mask(gpu: usize) -> u32 {
    u32::try_from(gpu)
        .ok()
        .and_then(|bit| 1u32.checked_shl(bit))
        .unwrap_or(0)
}
