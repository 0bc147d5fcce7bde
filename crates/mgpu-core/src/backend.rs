//! Native driver seam.
//!
//! Every call that touches a real GPU goes through [`DeviceBackend`]. The
//! coordinator only stores raw `ash::vk` handles; the backend owns whatever
//! function tables are needed to act on them.

use std::ffi::CStr;

use ash::vk;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{GroupError, Result};
use crate::inventory::{AdapterProperties, GpuDeviceType, MemoryHeapInfo, QueueFamilyInfo};

/// One queue requested from a family when creating a logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub family_index: u32,
}

/// Operations the coordinator needs from the native driver.
///
/// Handles passed back in are always ones this backend produced.
pub trait DeviceBackend: Send + Sync {
    fn physical_devices(&self) -> std::result::Result<Vec<vk::PhysicalDevice>, vk::Result>;

    fn adapter_properties(&self, physical_device: vk::PhysicalDevice) -> AdapterProperties;

    /// Whether `source` can read `dest`'s memory without a host round-trip.
    fn peer_access_supported(&self, source: vk::PhysicalDevice, dest: vk::PhysicalDevice) -> bool;

    fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        queues: &[QueueRequest],
    ) -> std::result::Result<vk::Device, vk::Result>;

    fn device_queue(&self, device: vk::Device, family_index: u32, queue_index: u32) -> vk::Queue;

    fn destroy_device(&self, device: vk::Device);

    fn create_fence(&self, device: vk::Device, signaled: bool)
        -> std::result::Result<vk::Fence, vk::Result>;

    fn destroy_fence(&self, device: vk::Device, fence: vk::Fence);

    fn reset_fence(&self, device: vk::Device, fence: vk::Fence) -> std::result::Result<(), vk::Result>;

    /// Wait for `fence`; `Err(vk::Result::TIMEOUT)` when `timeout_ns` elapses first.
    fn wait_for_fence(
        &self,
        device: vk::Device,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> std::result::Result<(), vk::Result>;

    fn create_semaphore(&self, device: vk::Device) -> std::result::Result<vk::Semaphore, vk::Result>;

    fn destroy_semaphore(&self, device: vk::Device, semaphore: vk::Semaphore);

    fn queue_submit(
        &self,
        device: vk::Device,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> std::result::Result<(), vk::Result>;

    fn allocate_memory(
        &self,
        device: vk::Device,
        size: u64,
        memory_type_index: u32,
    ) -> std::result::Result<vk::DeviceMemory, vk::Result>;

    fn free_memory(&self, device: vk::Device, memory: vk::DeviceMemory);
}

/// [`DeviceBackend`] over a real Vulkan instance (via `ash`).
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    /// Raw device handle -> loaded device wrapper
    devices: DashMap<vk::Device, ash::Device>,
}

impl VulkanBackend {
    /// Load the Vulkan loader and create an instance (API 1.1, needed for device groups).
    pub fn new() -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GroupError::Enumeration(format!("failed to load Vulkan: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"mgpu")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"mgpu")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 1, 0));

        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| GroupError::Enumeration(format!("vkCreateInstance: {e}")))?;

        info!("Vulkan instance created");

        Ok(Self {
            _entry: entry,
            instance,
            devices: DashMap::new(),
        })
    }

    fn physical_device_groups(&self) -> std::result::Result<Vec<Vec<vk::PhysicalDevice>>, vk::Result> {
        let count = unsafe { self.instance.enumerate_physical_device_groups_len()? };
        let mut groups = vec![vk::PhysicalDeviceGroupProperties::default(); count];
        unsafe { self.instance.enumerate_physical_device_groups(&mut groups)? };

        Ok(groups
            .iter()
            .map(|g| g.physical_devices[..g.physical_device_count as usize].to_vec())
            .collect())
    }
}

impl DeviceBackend for VulkanBackend {
    fn physical_devices(&self) -> std::result::Result<Vec<vk::PhysicalDevice>, vk::Result> {
        unsafe { self.instance.enumerate_physical_devices() }
    }

    fn adapter_properties(&self, pd: vk::PhysicalDevice) -> AdapterProperties {
        let props = unsafe { self.instance.get_physical_device_properties(pd) };
        let mem_props = unsafe { self.instance.get_physical_device_memory_properties(pd) };
        let families = unsafe { self.instance.get_physical_device_queue_family_properties(pd) };

        let device_name = unsafe {
            CStr::from_ptr(props.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        let memory_heaps = mem_props.memory_heaps[..mem_props.memory_heap_count as usize]
            .iter()
            .map(|heap| MemoryHeapInfo {
                size: heap.size,
                is_device_local: heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
            })
            .collect();

        let queue_families = families
            .iter()
            .map(|f| QueueFamilyInfo {
                graphics: f.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                compute: f.queue_flags.contains(vk::QueueFlags::COMPUTE),
                transfer: f.queue_flags.contains(vk::QueueFlags::TRANSFER),
                queue_count: f.queue_count,
            })
            .collect();

        AdapterProperties {
            device_name,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            device_type: GpuDeviceType::from(props.device_type),
            memory_heaps,
            queue_families,
        }
    }

    fn peer_access_supported(&self, source: vk::PhysicalDevice, dest: vk::PhysicalDevice) -> bool {
        match self.physical_device_groups() {
            Ok(groups) => groups
                .iter()
                .any(|g| g.contains(&source) && g.contains(&dest)),
            Err(e) => {
                warn!("vkEnumeratePhysicalDeviceGroups failed: {}", e);
                false
            }
        }
    }

    fn create_device(
        &self,
        pd: vk::PhysicalDevice,
        queues: &[QueueRequest],
    ) -> std::result::Result<vk::Device, vk::Result> {
        let priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queues
            .iter()
            .map(|q| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(q.family_index)
                    .queue_priorities(&priorities)
            })
            .collect();

        let create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

        let device = unsafe { self.instance.create_device(pd, &create_info, None)? };
        let raw = device.handle();
        self.devices.insert(raw, device);
        debug!("created Vulkan device {:?} with {} queue(s)", raw, queues.len());
        Ok(raw)
    }

    fn device_queue(&self, device: vk::Device, family_index: u32, queue_index: u32) -> vk::Queue {
        match self.devices.get(&device) {
            Some(dev) => unsafe { dev.get_device_queue(family_index, queue_index) },
            None => vk::Queue::null(),
        }
    }

    fn destroy_device(&self, device: vk::Device) {
        if let Some((_, dev)) = self.devices.remove(&device) {
            unsafe { dev.destroy_device(None) };
            debug!("destroyed Vulkan device {:?}", device);
        }
    }

    fn create_fence(
        &self,
        device: vk::Device,
        signaled: bool,
    ) -> std::result::Result<vk::Fence, vk::Result> {
        let dev = self.devices.get(&device).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let mut create_info = vk::FenceCreateInfo::default();
        if signaled {
            create_info = create_info.flags(vk::FenceCreateFlags::SIGNALED);
        }
        unsafe { dev.create_fence(&create_info, None) }
    }

    fn destroy_fence(&self, device: vk::Device, fence: vk::Fence) {
        if let Some(dev) = self.devices.get(&device) {
            unsafe { dev.destroy_fence(fence, None) };
        }
    }

    fn reset_fence(&self, device: vk::Device, fence: vk::Fence) -> std::result::Result<(), vk::Result> {
        let dev = self.devices.get(&device).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        unsafe { dev.reset_fences(&[fence]) }
    }

    fn wait_for_fence(
        &self,
        device: vk::Device,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> std::result::Result<(), vk::Result> {
        let dev = self.devices.get(&device).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        unsafe { dev.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn create_semaphore(&self, device: vk::Device) -> std::result::Result<vk::Semaphore, vk::Result> {
        let dev = self.devices.get(&device).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        unsafe { dev.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
    }

    fn destroy_semaphore(&self, device: vk::Device, semaphore: vk::Semaphore) {
        if let Some(dev) = self.devices.get(&device) {
            unsafe { dev.destroy_semaphore(semaphore, None) };
        }
    }

    fn queue_submit(
        &self,
        device: vk::Device,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> std::result::Result<(), vk::Result> {
        let dev = self.devices.get(&device).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let submit = vk::SubmitInfo::default().command_buffers(command_buffers);
        unsafe { dev.queue_submit(queue, &[submit], fence) }
    }

    fn allocate_memory(
        &self,
        device: vk::Device,
        size: u64,
        memory_type_index: u32,
    ) -> std::result::Result<vk::DeviceMemory, vk::Result> {
        let dev = self.devices.get(&device).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { dev.allocate_memory(&alloc_info, None) }
    }

    fn free_memory(&self, device: vk::Device, memory: vk::DeviceMemory) {
        if let Some(dev) = self.devices.get(&device) {
            unsafe { dev.free_memory(memory, None) };
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        // Devices the coordinator failed to release still must go before the instance.
        for (raw, dev) in std::mem::take(&mut self.devices) {
            warn!("destroying leaked Vulkan device {:?}", raw);
            unsafe { dev.destroy_device(None) };
        }
        unsafe { self.instance.destroy_instance(None) };
    }
}
