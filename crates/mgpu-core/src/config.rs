use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::inventory::GpuDescriptor;

/// Affinity bit: the GPU may run graphics work.
pub const AFFINITY_GRAPHICS: u8 = 1 << 0;
/// Affinity bit: the GPU may run compute work.
pub const AFFINITY_COMPUTE: u8 = 1 << 1;
/// Affinity bit: the GPU may run copy/transfer work.
pub const AFFINITY_TRANSFER: u8 = 1 << 2;
/// Every purpose; used for GPUs without an explicit mask.
pub const AFFINITY_ALL: u8 = AFFINITY_GRAPHICS | AFFINITY_COMPUTE | AFFINITY_TRANSFER;

/// Top-level configuration, loaded from mgpu.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MgpuConfig {
    #[serde(default)]
    pub group: GroupSettings,
}

/// Device group policy as written by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    /// Which inventory ordinals to include (None = all)
    pub include_gpus: Option<Vec<u32>>,
    /// Primary GPU, as an ordinal within the group
    #[serde(default)]
    pub primary_gpu: u32,
    /// One affinity byte per group GPU
    pub affinity: Option<Vec<u8>>,
    #[serde(default)]
    pub load_balance: LoadBalanceSettings,
    #[serde(default)]
    pub frame_pacing: FramePacingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalanceSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Primary utilization at which the balancer takes over (0.0 - 1.0)
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramePacingSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u32,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            include_gpus: None,
            primary_gpu: 0,
            affinity: None,
            load_balance: LoadBalanceSettings::default(),
            frame_pacing: FramePacingSettings::default(),
        }
    }
}

impl Default for LoadBalanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
        }
    }
}

impl Default for FramePacingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

impl MgpuConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigLoadError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigLoadError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigLoadError::Io(_)) => Self::default(),
            Err(e) => {
                warn!("ignoring {}: {}", path, e);
                Self::default()
            }
        }
    }
}

/// Returns the default config file path.
/// Search order: `/etc/mgpu/mgpu.toml` (or `%PROGRAMDATA%\mgpu\mgpu.toml`), then `./mgpu.toml`.
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\mgpu\mgpu.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/mgpu/mgpu.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "mgpu.toml".to_string()
}

/// Runtime policy for one device group. The context keeps its own copy.
#[derive(Debug, Clone)]
pub struct DeviceGroupConfig {
    /// GPUs in group order; `gpus[i].index == i`
    pub gpus: Vec<GpuDescriptor>,
    pub primary_gpu: usize,
    /// One byte per GPU, `AFFINITY_*` bits (None = every purpose everywhere)
    pub affinity_mask: Option<Vec<u8>>,
    pub load_balance_enabled: bool,
    pub load_balance_threshold: f32,
    pub frame_pacing_enabled: bool,
    pub frame_interval_ms: u32,
}

impl DeviceGroupConfig {
    /// Group over `gpus` with default policy.
    pub fn new(gpus: Vec<GpuDescriptor>) -> Self {
        let defaults = GroupSettings::default();
        Self {
            gpus,
            primary_gpu: 0,
            affinity_mask: None,
            load_balance_enabled: defaults.load_balance.enabled,
            load_balance_threshold: defaults.load_balance.threshold,
            frame_pacing_enabled: defaults.frame_pacing.enabled,
            frame_interval_ms: defaults.frame_pacing.interval_ms,
        }
    }

    /// Build a group from an inventory, filtered and renumbered per `settings`.
    pub fn from_settings(inventory: &[GpuDescriptor], settings: &GroupSettings) -> Self {
        let mut gpus: Vec<GpuDescriptor> = match &settings.include_gpus {
            Some(include) => {
                for idx in include {
                    if !inventory.iter().any(|g| g.index == *idx) {
                        warn!("include_gpus lists GPU {} which was not discovered", idx);
                    }
                }
                inventory
                    .iter()
                    .filter(|g| include.contains(&g.index))
                    .cloned()
                    .collect()
            }
            None => inventory.to_vec(),
        };

        for (i, gpu) in gpus.iter_mut().enumerate() {
            gpu.index = i as u32;
        }

        let mut threshold = settings.load_balance.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            warn!(
                "load_balance.threshold {} outside 0.0-1.0, using {}",
                threshold,
                default_threshold()
            );
            threshold = default_threshold();
        }

        Self {
            gpus,
            primary_gpu: settings.primary_gpu as usize,
            affinity_mask: settings.affinity.clone(),
            load_balance_enabled: settings.load_balance.enabled,
            load_balance_threshold: threshold,
            frame_pacing_enabled: settings.frame_pacing.enabled,
            frame_interval_ms: settings.frame_pacing.interval_ms,
        }
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    /// Affinity byte for `gpu`, `AFFINITY_ALL` when no mask was configured.
    pub fn affinity_for(&self, gpu: usize) -> u8 {
        self.affinity_mask
            .as_ref()
            .and_then(|mask| mask.get(gpu))
            .copied()
            .unwrap_or(AFFINITY_ALL)
    }
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f32 {
    0.75
}

fn default_interval_ms() -> u32 {
    16
}
