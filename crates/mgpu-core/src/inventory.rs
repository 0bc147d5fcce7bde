use ash::vk;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::DeviceBackend;
use crate::error::{GroupError, Result};

/// Longest device name kept in a descriptor, in bytes.
pub const MAX_DEVICE_NAME_LEN: usize = 255;

/// Static facts about one adapter, captured once at enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct GpuDescriptor {
    /// Ordinal within the inventory (or within the group, once configured)
    pub index: u32,
    /// PCI vendor ID
    pub vendor_id: u32,
    /// PCI device ID
    pub device_id: u32,
    /// Device type classification
    pub device_type: GpuDeviceType,
    /// Sum of all device-local heaps
    pub dedicated_vram: u64,
    /// Sum of all host-visible (non device-local) heaps
    pub shared_vram: u64,
    /// Human-readable name, at most `MAX_DEVICE_NAME_LEN` bytes
    pub device_name: String,
    /// Queue family layout, used when materializing the logical device
    pub queue_families: Vec<QueueFamilyInfo>,
    #[serde(skip)]
    pub physical_device: vk::PhysicalDevice,
}

impl GpuDescriptor {
    pub fn total_vram(&self) -> u64 {
        self.dedicated_vram.saturating_add(self.shared_vram)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuDeviceType {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

impl From<vk::PhysicalDeviceType> for GpuDeviceType {
    fn from(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::DiscreteGpu,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::IntegratedGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::VirtualGpu,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryHeapInfo {
    pub size: u64,
    pub is_device_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueFamilyInfo {
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    pub queue_count: u32,
}

impl QueueFamilyInfo {
    /// Transfer-capable family with no graphics or compute support (a DMA engine).
    pub fn is_dedicated_transfer(&self) -> bool {
        self.transfer && !self.graphics && !self.compute
    }
}

/// Everything the backend reports about one physical device.
#[derive(Debug, Clone)]
pub struct AdapterProperties {
    pub device_name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: GpuDeviceType,
    pub memory_heaps: Vec<MemoryHeapInfo>,
    pub queue_families: Vec<QueueFamilyInfo>,
}

/// Enumerate every adapter the backend can see.
/// An empty vector means the instance works but has no adapters.
pub fn enumerate(backend: &dyn DeviceBackend) -> Result<Vec<GpuDescriptor>> {
    let physical_devices = backend
        .physical_devices()
        .map_err(|e| GroupError::Enumeration(format!("vkEnumeratePhysicalDevices: {e}")))?;

    if physical_devices.is_empty() {
        warn!("no GPUs discovered on this machine");
        return Ok(Vec::new());
    }

    let mut gpus = Vec::with_capacity(physical_devices.len());

    for (idx, &pd) in physical_devices.iter().enumerate() {
        let props = backend.adapter_properties(pd);
        let (dedicated_vram, shared_vram) = classify_heaps(&props.memory_heaps);

        let gpu = GpuDescriptor {
            index: idx as u32,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            device_type: props.device_type,
            dedicated_vram,
            shared_vram,
            device_name: bounded_name(&props.device_name),
            queue_families: props.queue_families,
            physical_device: pd,
        };

        info!(
            "GPU {}: {} ({:?}, {}MB dedicated, {}MB shared)",
            idx,
            gpu.device_name,
            gpu.device_type,
            gpu.dedicated_vram / (1024 * 1024),
            gpu.shared_vram / (1024 * 1024),
        );

        gpus.push(gpu);
    }

    Ok(gpus)
}

/// Sum heap sizes into (dedicated, shared).
pub fn classify_heaps(heaps: &[MemoryHeapInfo]) -> (u64, u64) {
    heaps.iter().fold((0, 0), |(dedicated, shared), heap| {
        if heap.is_device_local {
            (dedicated.saturating_add(heap.size), shared)
        } else {
            (dedicated, shared.saturating_add(heap.size))
        }
    })
}

fn bounded_name(name: &str) -> String {
    if name.len() <= MAX_DEVICE_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_DEVICE_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
