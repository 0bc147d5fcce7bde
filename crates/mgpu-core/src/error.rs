use std::time::Duration;

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("GPU index {index} out of range (group has {count} GPU(s))")]
    Index { index: usize, count: usize },

    #[error("value out of range: {0}")]
    Range(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("logical device creation failed for GPU {gpu}: {result}")]
    DeviceCreation { gpu: usize, result: vk::Result },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("GPU enumeration failed: {0}")]
    Enumeration(String),

    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

pub type Result<T> = std::result::Result<T, GroupError>;
