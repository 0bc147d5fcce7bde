//! Scripted in-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use parking_lot::{Mutex, MutexGuard};

use mgpu_core::backend::{DeviceBackend, QueueRequest};
use mgpu_core::inventory::{AdapterProperties, GpuDeviceType, MemoryHeapInfo, QueueFamilyInfo};
use mgpu_core::{DeviceGroupConfig, DeviceGroupContext, EventSink, GroupEvent};

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Default)]
pub struct FakeState {
    pub adapters: Vec<AdapterProperties>,
    /// Adapter indices that form one physical device group
    pub peer_groups: Vec<Vec<usize>>,
    pub enumerate_error: Option<vk::Result>,
    /// Adapter whose logical device creation fails
    pub fail_device_for: Option<usize>,
    pub fail_allocation: Option<vk::Result>,
    pub fail_submit: Option<vk::Result>,
    /// Leave fences unsignaled after a submit
    pub hold_submissions: bool,

    next_handle: u64,
    pub live_devices: HashMap<u64, usize>,
    pub destroyed_devices: Vec<u64>,
    /// (adapter, requested families) per create_device call
    pub queue_requests: Vec<(usize, Vec<u32>)>,
    pub live_fences: HashSet<u64>,
    pub unsignaled: HashSet<u64>,
    pub live_semaphores: HashSet<u64>,
    pub live_memory: HashMap<u64, u64>,
    /// (queue, command buffer count)
    pub submissions: Vec<(u64, usize)>,
}

impl FakeState {
    /// Child objects must be released while their device is still alive.
    fn assert_device_alive(&self, device: vk::Device, what: &str) {
        assert!(
            self.live_devices.contains_key(&device.as_raw()),
            "{} released after its device {:?}",
            what,
            device
        );
    }

    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        0x1000 + self.next_handle
    }
}

pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new(adapters: Vec<AdapterProperties>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                adapters,
                ..FakeState::default()
            }),
        }
    }

    /// `count` identical discrete GPUs, none of them peer-capable.
    pub fn with_gpus(count: usize) -> Self {
        Self::new((0..count).map(|i| discrete_adapter(&format!("Fake GPU {i}"))).collect())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn physical_device(index: usize) -> vk::PhysicalDevice {
        vk::PhysicalDevice::from_raw(index as u64 + 1)
    }

    fn adapter_index(pd: vk::PhysicalDevice) -> usize {
        (pd.as_raw() - 1) as usize
    }
}

/// Graphics+compute+transfer family plus a DMA-only family; 8 GiB local, 16 GiB host.
pub fn discrete_adapter(name: &str) -> AdapterProperties {
    AdapterProperties {
        device_name: name.to_string(),
        vendor_id: 0x10DE,
        device_id: 0x2684,
        device_type: GpuDeviceType::DiscreteGpu,
        memory_heaps: vec![
            MemoryHeapInfo {
                size: 8 * GIB,
                is_device_local: true,
            },
            MemoryHeapInfo {
                size: 16 * GIB,
                is_device_local: false,
            },
        ],
        queue_families: vec![
            QueueFamilyInfo {
                graphics: true,
                compute: true,
                transfer: true,
                queue_count: 16,
            },
            QueueFamilyInfo {
                graphics: false,
                compute: false,
                transfer: true,
                queue_count: 2,
            },
        ],
    }
}

impl DeviceBackend for FakeBackend {
    fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, vk::Result> {
        let state = self.state();
        if let Some(e) = state.enumerate_error {
            return Err(e);
        }
        Ok((0..state.adapters.len()).map(Self::physical_device).collect())
    }

    fn adapter_properties(&self, pd: vk::PhysicalDevice) -> AdapterProperties {
        self.state().adapters[Self::adapter_index(pd)].clone()
    }

    fn peer_access_supported(&self, source: vk::PhysicalDevice, dest: vk::PhysicalDevice) -> bool {
        let (s, d) = (Self::adapter_index(source), Self::adapter_index(dest));
        self.state()
            .peer_groups
            .iter()
            .any(|g| g.contains(&s) && g.contains(&d))
    }

    fn create_device(
        &self,
        pd: vk::PhysicalDevice,
        queues: &[QueueRequest],
    ) -> Result<vk::Device, vk::Result> {
        let adapter = Self::adapter_index(pd);
        let mut state = self.state();
        state
            .queue_requests
            .push((adapter, queues.iter().map(|q| q.family_index).collect()));
        if state.fail_device_for == Some(adapter) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let raw = state.alloc_handle();
        state.live_devices.insert(raw, adapter);
        Ok(vk::Device::from_raw(raw))
    }

    fn device_queue(&self, device: vk::Device, family_index: u32, queue_index: u32) -> vk::Queue {
        vk::Queue::from_raw(device.as_raw() * 100 + u64::from(family_index) * 10 + u64::from(queue_index))
    }

    fn destroy_device(&self, device: vk::Device) {
        let mut state = self.state();
        assert!(
            state.live_devices.remove(&device.as_raw()).is_some(),
            "device {:?} destroyed twice or never created",
            device
        );
        state.destroyed_devices.push(device.as_raw());
    }

    fn create_fence(&self, _device: vk::Device, signaled: bool) -> Result<vk::Fence, vk::Result> {
        let mut state = self.state();
        let raw = state.alloc_handle();
        state.live_fences.insert(raw);
        if !signaled {
            state.unsignaled.insert(raw);
        }
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, device: vk::Device, fence: vk::Fence) {
        let mut state = self.state();
        state.assert_device_alive(device, "fence");
        assert!(state.live_fences.remove(&fence.as_raw()), "fence destroyed twice");
        state.unsignaled.remove(&fence.as_raw());
    }

    fn reset_fence(&self, _device: vk::Device, fence: vk::Fence) -> Result<(), vk::Result> {
        self.state().unsignaled.insert(fence.as_raw());
        Ok(())
    }

    fn wait_for_fence(
        &self,
        _device: vk::Device,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        let pending = {
            let state = self.state();
            if !state.live_fences.contains(&fence.as_raw()) {
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
            state.unsignaled.contains(&fence.as_raw())
        };
        if !pending {
            return Ok(());
        }
        std::thread::sleep(Duration::from_nanos(timeout_ns).min(Duration::from_millis(20)));
        Err(vk::Result::TIMEOUT)
    }

    fn create_semaphore(&self, _device: vk::Device) -> Result<vk::Semaphore, vk::Result> {
        let mut state = self.state();
        let raw = state.alloc_handle();
        state.live_semaphores.insert(raw);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, device: vk::Device, semaphore: vk::Semaphore) {
        let mut state = self.state();
        state.assert_device_alive(device, "semaphore");
        assert!(
            state.live_semaphores.remove(&semaphore.as_raw()),
            "semaphore destroyed twice"
        );
    }

    fn queue_submit(
        &self,
        _device: vk::Device,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let mut state = self.state();
        if let Some(e) = state.fail_submit {
            return Err(e);
        }
        state.submissions.push((queue.as_raw(), command_buffers.len()));
        if !state.hold_submissions {
            state.unsignaled.remove(&fence.as_raw());
        }
        Ok(())
    }

    fn allocate_memory(
        &self,
        _device: vk::Device,
        size: u64,
        _memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let mut state = self.state();
        if let Some(e) = state.fail_allocation {
            return Err(e);
        }
        let raw = state.alloc_handle();
        state.live_memory.insert(raw, size);
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, device: vk::Device, memory: vk::DeviceMemory) {
        let mut state = self.state();
        state.assert_device_alive(device, "memory");
        assert!(
            state.live_memory.remove(&memory.as_raw()).is_some(),
            "memory freed twice"
        );
    }
}

/// Sink that keeps every event for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GroupEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<GroupEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &GroupEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Group config over every adapter of `backend`.
pub fn config_for(backend: &FakeBackend) -> DeviceGroupConfig {
    let gpus = mgpu_core::enumerate(backend).expect("enumeration");
    DeviceGroupConfig::new(gpus)
}

/// Backend with `count` GPUs and a context over all of them.
pub fn group(count: usize) -> (Arc<FakeBackend>, DeviceGroupContext) {
    mgpu_common::logging::init_test_logging();
    let backend = Arc::new(FakeBackend::with_gpus(count));
    let config = config_for(&backend);
    let dyn_backend: Arc<dyn DeviceBackend> = backend.clone();
    let ctx = DeviceGroupContext::create(config, dyn_backend).expect("create context");
    (backend, ctx)
}

/// Same as [`group`], with the device group already materialized.
pub fn materialized_group(count: usize) -> (Arc<FakeBackend>, DeviceGroupContext) {
    let (backend, mut ctx) = group(count);
    ctx.create_device_group().expect("create device group");
    (backend, ctx)
}
