//! Device context configuration.

use serde::Deserialize;

use crate::error::{Result, VulkanError};

/// Environment variable enabling the Khronos validation layer (`1` or `true`).
pub const ENV_VALIDATION: &str = "VK_COMPUTE_VALIDATION";
/// Environment variable selecting a physical device by enumeration index.
pub const ENV_DEVICE: &str = "VK_COMPUTE_DEVICE";
/// Environment variable bounding blocking transfer waits, in nanoseconds.
pub const ENV_TRANSFER_TIMEOUT: &str = "VK_COMPUTE_TRANSFER_TIMEOUT_NS";

/// Configuration for [`DeviceContext::new`](crate::DeviceContext::new).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Application name reported to the driver.
    pub application_name: String,
    /// Request `VK_LAYER_KHRONOS_validation` and forward its messages to `tracing`.
    pub enable_validation: bool,
    /// Physical device index. `None` prefers a discrete GPU.
    pub device_index: Option<usize>,
    /// Default bound for blocking buffer copies and fills.
    pub transfer_timeout_ns: u64,
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `VK_COMPUTE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| VulkanError::invalid(format!("context config: {}", e)))
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(ENV_VALIDATION) {
            self.enable_validation = matches!(v.trim(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(v) = lookup(ENV_DEVICE) {
            let index = v.trim().parse::<usize>().map_err(|_| {
                VulkanError::invalid(format!("{} must be a device index, got {:?}", ENV_DEVICE, v))
            })?;
            self.device_index = Some(index);
        }
        if let Some(v) = lookup(ENV_TRANSFER_TIMEOUT) {
            self.transfer_timeout_ns = v.trim().parse::<u64>().map_err(|_| {
                VulkanError::invalid(format!(
                    "{} must be a nanosecond count, got {:?}",
                    ENV_TRANSFER_TIMEOUT, v
                ))
            })?;
        }
        Ok(self)
    }

    /// Enable or disable the validation layer.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Pick the physical device at `index`.
    pub fn with_device_index(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    /// Set the default transfer timeout.
    pub fn with_transfer_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.transfer_timeout_ns = timeout_ns;
        self
    }

    /// Set the application name.
    pub fn with_application_name(mut self, name: &str) -> Self {
        self.application_name = name.to_string();
        self
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: "vk-compute".to_string(),
            enable_validation: false,
            device_index: None,
            transfer_timeout_ns: u64::MAX,
        }
    }
}
