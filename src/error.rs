//! Error type for device, memory, and pipeline operations.

use ash::vk;
use thiserror::Error;

/// Coarse classification of a [`VulkanError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any device call was made. Deterministic for the same inputs.
    Validation,
    /// The driver or device reported a failure.
    Device,
    /// Loader, instance, or physical-device setup failed.
    Setup,
    /// Reading a shader binary from disk failed.
    Io,
}

/// Error type for Vulkan compute operations.
#[derive(Debug, Error)]
pub enum VulkanError {
    /// A caller-supplied argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A byte range falls outside the buffer, or is empty.
    #[error("range out of bounds: offset={offset} length={length} size={size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    /// The buffer's host-access mode does not allow the requested direction.
    #[error("host access {requested} not permitted on a buffer created with {available}")]
    AccessMode {
        requested: &'static str,
        available: &'static str,
    },

    /// A value exceeds a device-advertised limit.
    #[error("{what} = {value} exceeds device limit {limit}")]
    LimitExceeded {
        what: &'static str,
        value: u64,
        limit: u64,
    },

    /// A value does not satisfy a required alignment.
    #[error("{what} = {value} is not a multiple of {alignment}")]
    Misaligned {
        what: &'static str,
        value: u64,
        alignment: u64,
    },

    /// The shader binary is not a well-formed SPIR-V stream.
    #[error("invalid SPIR-V: {0}")]
    InvalidShader(String),

    /// Timing was requested on a program without a timestamp query pool.
    #[error("timestamp queries are not available for this program")]
    TimingUnavailable,

    /// Vulkan API returned an error code.
    #[error("{}", describe_vk(.result, .context))]
    Vk {
        result: vk::Result,
        context: &'static str,
    },

    /// No memory type satisfied any of the requested property tiers.
    #[error("no suitable memory type")]
    NoMemoryType,

    /// A fence wait hit its timeout. The submitted work keeps running.
    #[error("timed out waiting for the device")]
    Timeout,

    /// The Vulkan loader could not be found or initialized.
    #[error("failed to load the Vulkan loader: {0}")]
    Loader(String),

    /// No Vulkan-capable GPU found.
    #[error("no Vulkan-capable GPU found")]
    NoGpu,

    /// No compute queue family found.
    #[error("no compute queue family found")]
    NoComputeQueue,

    /// Reading a shader binary from a file or reader failed.
    #[error("failed to read shader binary: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VulkanError>;

impl VulkanError {
    /// Wrap a raw result code with the name of the call that produced it.
    pub fn vk(context: &'static str) -> impl FnOnce(vk::Result) -> VulkanError {
        move |result| VulkanError::Vk { result, context }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VulkanError::InvalidArgument(_)
            | VulkanError::OutOfRange { .. }
            | VulkanError::AccessMode { .. }
            | VulkanError::LimitExceeded { .. }
            | VulkanError::Misaligned { .. }
            | VulkanError::InvalidShader(_)
            | VulkanError::TimingUnavailable => ErrorKind::Validation,
            VulkanError::Vk { .. } | VulkanError::NoMemoryType | VulkanError::Timeout => {
                ErrorKind::Device
            }
            VulkanError::Loader(_) | VulkanError::NoGpu | VulkanError::NoComputeQueue => {
                ErrorKind::Setup
            }
            VulkanError::Io(_) => ErrorKind::Io,
        }
    }

    /// True for errors detected before any device call.
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// The raw Vulkan result code, if the driver produced this error.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            VulkanError::Vk { result, .. } => Some(*result),
            _ => None,
        }
    }
}

fn describe_vk(result: &vk::Result, context: &str) -> String {
    let result = *result;
    let name = vk_result_name(result);
    let code = result.as_raw();
    match result {
        vk::Result::ERROR_DEVICE_LOST => format!(
            "{context}: {name} ({code}), GPU device lost, restart may be required"
        ),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => format!(
            "{context}: {name} ({code}), GPU out of memory, reduce allocation size"
        ),
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            format!("{context}: {name} ({code}), host out of memory")
        }
        _ => format!("{context}: {name} ({code})"),
    }
}

/// Human-readable name for a `vk::Result` code.
pub fn vk_result_name(result: vk::Result) -> &'static str {
    match result {
        vk::Result::SUCCESS => "VK_SUCCESS",
        vk::Result::NOT_READY => "VK_NOT_READY",
        vk::Result::TIMEOUT => "VK_TIMEOUT",
        vk::Result::EVENT_SET => "VK_EVENT_SET",
        vk::Result::EVENT_RESET => "VK_EVENT_RESET",
        vk::Result::INCOMPLETE => "VK_INCOMPLETE",
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => "VK_ERROR_OUT_OF_HOST_MEMORY",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => "VK_ERROR_OUT_OF_DEVICE_MEMORY",
        vk::Result::ERROR_INITIALIZATION_FAILED => "VK_ERROR_INITIALIZATION_FAILED",
        vk::Result::ERROR_DEVICE_LOST => "VK_ERROR_DEVICE_LOST",
        vk::Result::ERROR_MEMORY_MAP_FAILED => "VK_ERROR_MEMORY_MAP_FAILED",
        vk::Result::ERROR_LAYER_NOT_PRESENT => "VK_ERROR_LAYER_NOT_PRESENT",
        vk::Result::ERROR_EXTENSION_NOT_PRESENT => "VK_ERROR_EXTENSION_NOT_PRESENT",
        vk::Result::ERROR_FEATURE_NOT_PRESENT => "VK_ERROR_FEATURE_NOT_PRESENT",
        vk::Result::ERROR_INCOMPATIBLE_DRIVER => "VK_ERROR_INCOMPATIBLE_DRIVER",
        vk::Result::ERROR_TOO_MANY_OBJECTS => "VK_ERROR_TOO_MANY_OBJECTS",
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => "VK_ERROR_FORMAT_NOT_SUPPORTED",
        vk::Result::ERROR_FRAGMENTED_POOL => "VK_ERROR_FRAGMENTED_POOL",
        vk::Result::ERROR_OUT_OF_POOL_MEMORY => "VK_ERROR_OUT_OF_POOL_MEMORY",
        vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => "VK_ERROR_INVALID_EXTERNAL_HANDLE",
        vk::Result::ERROR_FRAGMENTATION => "VK_ERROR_FRAGMENTATION",
        vk::Result::ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS => {
            "VK_ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS"
        }
        vk::Result::PIPELINE_COMPILE_REQUIRED => "VK_PIPELINE_COMPILE_REQUIRED",
        _ => "VK_ERROR_UNKNOWN",
    }
}
