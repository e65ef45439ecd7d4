//! Device context: the logical device, its compute queue, cached hardware
//! limits, and the transient command path used for buffer transfers.

use std::cell::{Cell, RefCell};
use std::fmt;

use ash::vk;

use crate::config::ContextConfig;
use crate::driver::vulkan::VulkanDriver;
use crate::driver::{Command, DeviceProperties, Driver, MemoryType};
use crate::error::{Result, VulkanError};

/// Hardware limits read once at device creation.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceLimits {
    pub non_coherent_atom_size: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_storage_buffer_range: u64,
    pub max_uniform_buffer_range: u64,
    pub max_push_constants_size: u32,
    pub max_compute_work_group_size: [u32; 3],
    pub max_compute_work_group_invocations: u32,
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_shared_memory_size: u32,
    pub max_bound_descriptor_sets: u32,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    /// Meaningful low bits of a compute-queue timestamp; 0 when unsupported.
    pub timestamp_valid_bits: u32,
    /// The compute queue can write timestamps.
    pub timestamps_supported: bool,
}

impl DeviceLimits {
    pub(crate) fn from_vk(limits: &vk::PhysicalDeviceLimits, timestamp_valid_bits: u32) -> Self {
        Self {
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment.max(1),
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment.max(1),
            max_storage_buffer_range: u64::from(limits.max_storage_buffer_range),
            max_uniform_buffer_range: u64::from(limits.max_uniform_buffer_range),
            max_push_constants_size: limits.max_push_constants_size,
            max_compute_work_group_size: limits.max_compute_work_group_size,
            max_compute_work_group_invocations: limits.max_compute_work_group_invocations,
            max_compute_work_group_count: limits.max_compute_work_group_count,
            max_compute_shared_memory_size: limits.max_compute_shared_memory_size,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            timestamp_period: limits.timestamp_period,
            timestamp_valid_bits,
            timestamps_supported: timestamp_valid_bits > 0 && limits.timestamp_period > 0.0,
        }
    }
}

impl Default for DeviceLimits {
    /// The minimums every conformant Vulkan 1.0 implementation guarantees.
    fn default() -> Self {
        Self {
            non_coherent_atom_size: 256,
            min_storage_buffer_offset_alignment: 256,
            min_uniform_buffer_offset_alignment: 256,
            max_storage_buffer_range: 1 << 27,
            max_uniform_buffer_range: 16384,
            max_push_constants_size: 128,
            max_compute_work_group_size: [128, 128, 64],
            max_compute_work_group_invocations: 128,
            max_compute_work_group_count: [65535, 65535, 65535],
            max_compute_shared_memory_size: 16384,
            max_bound_descriptor_sets: 4,
            timestamp_period: 1.0,
            timestamp_valid_bits: 0,
            timestamps_supported: false,
        }
    }
}

/// Human-readable description of the selected GPU.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub vendor_name: &'static str,
    pub device_type: vk::PhysicalDeviceType,
    /// `(major, minor, patch)` of the device's supported API version.
    pub api_version: (u32, u32, u32),
    /// Subgroup width, or 0 when the device predates Vulkan 1.1.
    pub subgroup_size: u32,
}

impl DeviceInfo {
    fn from_properties(props: &DeviceProperties) -> Self {
        Self {
            name: props.name.clone(),
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            vendor_name: vendor_name(props.vendor_id),
            device_type: props.device_type,
            api_version: (
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version),
                vk::api_version_patch(props.api_version),
            ),
            subgroup_size: props.subgroup_size,
        }
    }

    pub fn device_type_name(&self) -> &'static str {
        match self.device_type {
            vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
            vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
            vk::PhysicalDeviceType::CPU => "cpu",
            vk::PhysicalDeviceType::OTHER => "other",
            _ => "unknown",
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, patch) = self.api_version;
        write!(
            f,
            "{} ({}, {}, Vulkan {}.{}.{})",
            self.name,
            self.vendor_name,
            self.device_type_name(),
            major,
            minor,
            patch
        )
    }
}

/// Map a PCI vendor id to a vendor name.
pub fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x10DE => "NVIDIA",
        0x1002 => "AMD",
        0x8086 => "Intel",
        0x106B => "Apple",
        0x13B5 => "ARM",
        0x5143 => "Qualcomm",
        _ => "unknown",
    }
}

/// Fence, command buffer, and buffer handles of one in-flight transfer.
struct Transfer {
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    /// Buffers the transfer copies or fills.
    buffers: Vec<vk::Buffer>,
}

impl Transfer {
    fn touches(&self, buffer: vk::Buffer) -> bool {
        self.buffers.contains(&buffer)
    }
}

/// Buffers read or written by transfer commands.
fn transfer_buffers(commands: &[Command]) -> Vec<vk::Buffer> {
    let mut buffers = Vec::new();
    for command in commands {
        match *command {
            Command::CopyBuffer { src, dst, .. } => buffers.extend([src, dst]),
            Command::FillBuffer { buffer, .. } => buffers.push(buffer),
            _ => {}
        }
    }
    buffers.dedup();
    buffers
}

/// A submitted one-shot transfer (copy or fill).
///
/// Pass it to [`DeviceContext::wait_transfer`] (or call [`wait`](Self::wait)).
/// Dropping it unwaited blocks for up to the context's transfer timeout; if
/// that expires the fence and command buffer are retired to the context.
#[must_use = "a pending transfer must be waited on"]
pub struct PendingTransfer<'a> {
    ctx: &'a DeviceContext,
    transfer: Option<Transfer>,
}

impl<'a> PendingTransfer<'a> {
    /// Non-blocking completion check.
    pub fn is_complete(&self) -> Result<bool> {
        let Some(transfer) = &self.transfer else {
            return Ok(true);
        };
        unsafe { self.ctx.driver.fence_signaled(transfer.fence) }
            .map_err(VulkanError::vk("vkGetFenceStatus"))
    }

    /// Block until the transfer finishes or `timeout_ns` elapses.
    pub fn wait(self, timeout_ns: u64) -> Result<()> {
        self.ctx.wait_transfer(self, timeout_ns)
    }
}

impl Drop for PendingTransfer<'_> {
    fn drop(&mut self) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        if let Err(e) = self.ctx.finish_transfer(transfer, self.ctx.transfer_timeout_ns) {
            tracing::error!(error = %e, "unwaited transfer did not complete");
        }
    }
}

/// Owns the logical device and compute queue; every buffer and program
/// borrows it.
pub struct DeviceContext {
    driver: Box<dyn Driver>,
    properties: DeviceProperties,
    transfer_pool: vk::CommandPool,
    /// Transfers whose wait timed out.
    retired: RefCell<Vec<Transfer>>,
    transfer_timeout_ns: u64,
    torn_down: Cell<bool>,
}

impl DeviceContext {
    /// Create a context on a real GPU.
    pub fn new(config: &ContextConfig) -> Result<Self> {
        let driver = VulkanDriver::new(config)?;
        Self::with_driver(Box::new(driver), config)
    }

    /// Create a context over an already initialized driver.
    pub fn with_driver(driver: Box<dyn Driver>, config: &ContextConfig) -> Result<Self> {
        let properties = driver.properties();
        let transfer_pool = match unsafe { driver.create_command_pool() } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { driver.destroy() };
                return Err(VulkanError::vk("vkCreateCommandPool")(e));
            }
        };
        if !properties.limits.timestamps_supported {
            tracing::warn!(device = %properties.name, "compute queue does not support timestamps");
        }
        tracing::debug!(
            device = %properties.name,
            memory_types = properties.memory_types.len(),
            "device context ready"
        );
        Ok(Self {
            driver,
            properties,
            transfer_pool,
            retired: RefCell::new(Vec::new()),
            transfer_timeout_ns: config.transfer_timeout_ns,
            torn_down: Cell::new(false),
        })
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.properties.limits
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo::from_properties(&self.properties)
    }

    pub fn memory_types(&self) -> &[MemoryType] {
        &self.properties.memory_types
    }

    /// Default bound for blocking transfers.
    pub fn transfer_timeout_ns(&self) -> u64 {
        self.transfer_timeout_ns
    }

    pub fn is_valid(&self) -> bool {
        !self.torn_down.get()
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.torn_down.get() {
            return Err(VulkanError::invalid("device context has been torn down"));
        }
        Ok(())
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// First memory type allowed by `type_bits` that has every flag in `required`.
    pub fn find_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Option<u32> {
        self.properties
            .memory_types
            .iter()
            .enumerate()
            .find(|(i, t)| type_bits & (1 << i) != 0 && t.flags.contains(required))
            .map(|(i, _)| i as u32)
    }

    /// Block until the queue is idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.ensure_valid()?;
        unsafe { self.driver.wait_idle() }.map_err(VulkanError::vk("vkDeviceWaitIdle"))
    }

    /// Record `commands` into a one-shot command buffer from the transfer pool
    /// and submit it with a fresh fence.
    pub(crate) fn submit_transient(&self, commands: &[Command]) -> Result<PendingTransfer<'_>> {
        self.ensure_valid()?;
        self.reclaim_retired(false);

        let d = self.driver.as_ref();
        let command_buffer = unsafe { d.allocate_command_buffer(self.transfer_pool) }
            .map_err(VulkanError::vk("vkAllocateCommandBuffers"))?;
        let release_cb = || unsafe { d.free_command_buffer(self.transfer_pool, command_buffer) };

        if let Err(e) = unsafe { d.record(command_buffer, true, commands) } {
            release_cb();
            return Err(VulkanError::vk("vkEndCommandBuffer")(e));
        }
        let fence = match unsafe { d.create_fence() } {
            Ok(fence) => fence,
            Err(e) => {
                release_cb();
                return Err(VulkanError::vk("vkCreateFence")(e));
            }
        };
        if let Err(e) = unsafe { d.submit(command_buffer, fence) } {
            unsafe { d.destroy_fence(fence) };
            release_cb();
            return Err(VulkanError::vk("vkQueueSubmit")(e));
        }

        Ok(PendingTransfer {
            ctx: self,
            transfer: Some(Transfer {
                fence,
                command_buffer,
                buffers: transfer_buffers(commands),
            }),
        })
    }

    /// Submit `commands` and wait up to `timeout_ns`.
    pub(crate) fn run_transient(&self, commands: &[Command], timeout_ns: u64) -> Result<()> {
        let pending = self.submit_transient(commands)?;
        self.wait_transfer(pending, timeout_ns)
    }

    /// Wait for a transfer and release its fence and command buffer.
    ///
    /// On timeout the transfer keeps running. Its resources move to the
    /// context and are freed once its fence signals or one of its buffers
    /// is destroyed.
    pub fn wait_transfer(&self, mut pending: PendingTransfer<'_>, timeout_ns: u64) -> Result<()> {
        if !std::ptr::eq(pending.ctx, self) {
            return Err(VulkanError::invalid("transfer belongs to a different device context"));
        }
        match pending.transfer.take() {
            Some(transfer) => self.finish_transfer(transfer, timeout_ns),
            None => Ok(()),
        }
    }

    fn finish_transfer(&self, transfer: Transfer, timeout_ns: u64) -> Result<()> {
        match unsafe { self.driver.wait_fence(transfer.fence, timeout_ns) } {
            Ok(true) => {
                self.free_transfer(&transfer);
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(timeout_ns, "transfer wait timed out, retiring its fence");
                self.retired.borrow_mut().push(transfer);
                Err(VulkanError::Timeout)
            }
            Err(e) => {
                self.retired.borrow_mut().push(transfer);
                Err(VulkanError::vk("vkWaitForFences")(e))
            }
        }
    }

    fn free_transfer(&self, transfer: &Transfer) {
        unsafe {
            self.driver.destroy_fence(transfer.fence);
            self.driver.free_command_buffer(self.transfer_pool, transfer.command_buffer);
        }
    }

    /// Free retired transfers whose fence has signaled, or all of them when
    /// `force` is set (only after the device is idle).
    fn reclaim_retired(&self, force: bool) {
        let mut retired = self.retired.borrow_mut();
        retired.retain(|transfer| {
            let done =
                force || matches!(unsafe { self.driver.fence_signaled(transfer.fence) }, Ok(true));
            if done {
                self.free_transfer(transfer);
            }
            !done
        });
    }

    /// Block until no retired transfer still uses `buffer`, so it can be
    /// destroyed.
    pub(crate) fn release_buffer(&self, buffer: vk::Buffer) {
        let mut retired = self.retired.borrow_mut();
        if !retired.iter().any(|t| t.touches(buffer)) {
            return;
        }
        retired.retain(|transfer| {
            if !transfer.touches(buffer) {
                return true;
            }
            if let Err(e) = unsafe { self.driver.wait_fence(transfer.fence, u64::MAX) } {
                tracing::error!(error = ?e, "retired transfer wait failed, idling the device");
                if let Err(e) = unsafe { self.driver.wait_idle() } {
                    tracing::error!(error = ?e, "vkDeviceWaitIdle failed");
                }
            }
            self.free_transfer(transfer);
            false
        });
        tracing::debug!(remaining = retired.len(), "released retired transfers of a buffer");
    }

    /// Number of timed-out transfers not yet reclaimed.
    pub fn retired_transfers(&self) -> usize {
        self.retired.borrow().len()
    }

    /// Wait for the device, free all context-owned objects, and destroy the
    /// device. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.torn_down.replace(true) {
            return;
        }
        if let Err(e) = unsafe { self.driver.wait_idle() } {
            tracing::error!(error = ?e, "vkDeviceWaitIdle failed during teardown");
        }
        self.reclaim_retired(true);
        unsafe {
            self.driver.destroy_command_pool(self.transfer_pool);
            self.driver.destroy();
        }
        tracing::debug!(device = %self.properties.name, "device context torn down");
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
