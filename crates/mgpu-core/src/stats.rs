use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::context::fixed_len;
use crate::error::Result;

/// Live per-GPU counters.
///
/// Shared with monitoring threads through an `Arc`; every field is atomic so
/// readers never block the frame loop. Writers are expected to be serialized
/// by the owning [`DeviceGroupContext`](crate::DeviceGroupContext).
pub struct StatsAggregator {
    gpus: Box<[GpuCounters]>,
    total_frames: AtomicU64,
}

#[derive(Default)]
struct GpuCounters {
    /// f32 bit pattern
    utilization: AtomicU32,
    bytes_transferred: AtomicU64,
    submissions: AtomicU64,
    /// Gauge of live allocations; not cleared by `reset`
    allocated_bytes: AtomicU64,
}

/// Immutable copy of the counters at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_frames: u64,
    pub gpus: Vec<GpuStatsSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpuStatsSnapshot {
    pub gpu_index: u32,
    pub utilization: f32,
    pub bytes_transferred: u64,
    pub submissions: u64,
    pub allocated_bytes: u64,
}

impl StatsAggregator {
    pub fn new(gpu_count: usize) -> Result<Self> {
        Ok(Self {
            gpus: fixed_len(gpu_count, "statistics", GpuCounters::default)?,
            total_frames: AtomicU64::new(0),
        })
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    /// Utilization of `gpu`, 0.0 when out of range.
    pub fn utilization(&self, gpu: usize) -> f32 {
        self.gpus
            .get(gpu)
            .map_or(0.0, |c| f32::from_bits(c.utilization.load(Ordering::Relaxed)))
    }

    pub fn bytes_transferred(&self, gpu: usize) -> u64 {
        self.gpus
            .get(gpu)
            .map_or(0, |c| c.bytes_transferred.load(Ordering::Relaxed))
    }

    /// `(utilization, bytes_transferred)`; zeros for an unknown GPU.
    pub fn gpu_stats(&self, gpu: usize) -> (f32, u64) {
        (self.utilization(gpu), self.bytes_transferred(gpu))
    }

    /// Bytes of live allocations on `gpu`, 0 when out of range.
    pub fn allocated_bytes(&self, gpu: usize) -> u64 {
        self.gpus
            .get(gpu)
            .map_or(0, |c| c.allocated_bytes.load(Ordering::Relaxed))
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    /// Store a utilization sample, clamped to [0, 1]. NaN counts as idle.
    pub fn record_utilization(&self, gpu: usize, sample: f32) {
        if let Some(c) = self.gpus.get(gpu) {
            let value = if sample.is_nan() { 0.0 } else { sample.clamp(0.0, 1.0) };
            c.utilization.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn record_transfer(&self, gpu: usize, bytes: u64) {
        if let Some(c) = self.gpus.get(gpu) {
            c.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_submission(&self, gpu: usize) {
        if let Some(c) = self.gpus.get(gpu) {
            c.submissions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_allocation(&self, gpu: usize, bytes: u64) {
        if let Some(c) = self.gpus.get(gpu) {
            c.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_free(&self, gpu: usize, bytes: u64) {
        if let Some(c) = self.gpus.get(gpu) {
            let _ = c
                .allocated_bytes
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(bytes))
                });
        }
    }

    /// Count one frame; returns the new total.
    pub fn record_frame(&self) -> u64 {
        self.total_frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Zero utilization, transfer and submission counters and the frame count.
    pub fn reset(&self) {
        for c in self.gpus.iter() {
            c.utilization.store(0.0f32.to_bits(), Ordering::Relaxed);
            c.bytes_transferred.store(0, Ordering::Relaxed);
            c.submissions.store(0, Ordering::Relaxed);
        }
        self.total_frames.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_frames: self.total_frames(),
            gpus: self
                .gpus
                .iter()
                .enumerate()
                .map(|(i, c)| GpuStatsSnapshot {
                    gpu_index: i as u32,
                    utilization: f32::from_bits(c.utilization.load(Ordering::Relaxed)),
                    bytes_transferred: c.bytes_transferred.load(Ordering::Relaxed),
                    submissions: c.submissions.load(Ordering::Relaxed),
                    allocated_bytes: c.allocated_bytes.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}
