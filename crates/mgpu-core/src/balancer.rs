//! GPU selection policy.
//!
//! The base policy only looks at live utilization: the least busy GPU wins
//! and ties go to the lowest ordinal. The workload size hint is accepted so
//! callers do not need to change when a weighting policy is added, but it is
//! not used yet. Externally supplied weights are kept as a normalized target
//! distribution for callers that want to bias their own routing.

use crate::context::DeviceGroupContext;
use crate::error::{GroupError, Result};
use crate::events::GroupEvent;

impl DeviceGroupContext {
    /// Ordinal of the least utilized GPU (0 for an empty group).
    pub fn select_gpu(&self, _workload_size_hint: u64) -> usize {
        least_utilized((0..self.gpu_count()).map(|gpu| self.stats.utilization(gpu)))
    }

    /// GPU for the next unit of work, as a frame loop should route it.
    ///
    /// Work stays on the primary while load balancing is disabled or the
    /// primary is below the threshold; otherwise the balancer picks.
    pub fn route_work(&self, workload_size_hint: u64) -> usize {
        let primary = self.config.primary_gpu;
        if !self.config.load_balance_enabled
            || self.stats.utilization(primary) < self.config.load_balance_threshold
        {
            return primary;
        }
        self.select_gpu(workload_size_hint)
    }

    /// Recompute the target distribution from one non-negative weight per GPU.
    /// All-zero weights mean an even split.
    pub fn balance_load(&mut self, weights: &[f32]) -> Result<()> {
        let gpu_count = self.gpu_count();
        if weights.len() != gpu_count {
            return Err(GroupError::Config(format!(
                "{} weight(s) supplied for {} GPU(s)",
                weights.len(),
                gpu_count
            )));
        }
        if let Some((gpu, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(GroupError::Range(format!(
                "weight {} for GPU {} must be finite and non-negative",
                w, gpu
            )));
        }

        let total: f32 = weights.iter().sum();
        for (share, weight) in self.target_distribution.iter_mut().zip(weights) {
            *share = if total > 0.0 {
                weight / total
            } else {
                1.0 / gpu_count as f32
            };
        }

        self.events.emit(&GroupEvent::LoadBalanced {
            distribution: self.target_distribution.to_vec(),
        });
        Ok(())
    }

    /// Normalized share of work each GPU should receive (sums to 1).
    pub fn target_distribution(&self) -> &[f32] {
        &self.target_distribution
    }

    pub fn set_load_balance_threshold(&mut self, threshold: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(GroupError::Range(format!(
                "load balance threshold {} outside 0.0-1.0",
                threshold
            )));
        }
        self.config.load_balance_threshold = threshold;
        Ok(())
    }

    pub fn set_load_balancing(&mut self, enabled: bool) {
        self.config.load_balance_enabled = enabled;
    }
}

/// Index of the strictly lowest sample; the first one seen wins ties.
pub fn least_utilized(samples: impl IntoIterator<Item = f32>) -> usize {
    let mut best: Option<(usize, f32)> = None;
    for (gpu, load) in samples.into_iter().enumerate() {
        let better = match best {
            None => true,
            Some((_, incumbent)) => load < incumbent,
        };
        if better {
            best = Some((gpu, load));
        }
    }
    best.map_or(0, |(gpu, _)| gpu)
}
