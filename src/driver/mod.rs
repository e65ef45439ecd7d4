//! Handle-level device-call seam.
//!
//! [`Driver`] is the narrow set of Vulkan entry points the rest of the crate
//! issues. [`vulkan::VulkanDriver`] forwards each call to `ash`. Everything
//! above this layer (alignment, fallback, ledgers, barriers) is expressed once
//! against the trait.
//!
//! Command buffers are recorded from a list of [`Command`]s so that the exact
//! sequence a dispatch emits is an ordinary value.

use std::ffi::CString;

use ash::vk;

use crate::device::DeviceLimits;

pub mod vulkan;

#[cfg(test)]
pub(crate) mod fake;

pub type VkResult<T> = std::result::Result<T, vk::Result>;

/// One memory type advertised by the physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

/// Static facts about the device a driver is bound to.
#[derive(Clone, Debug)]
pub struct DeviceProperties {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub subgroup_size: u32,
    pub queue_family_index: u32,
    pub limits: DeviceLimits,
    pub memory_types: Vec<MemoryType>,
}

/// A descriptor slot in a set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
}

/// One buffer descriptor update.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// Everything needed to compile one compute pipeline.
#[derive(Clone, Debug)]
pub struct PipelineDesc {
    pub module: vk::ShaderModule,
    pub layout: vk::PipelineLayout,
    pub entry_point: CString,
    /// `(constant_id, value)` pairs, packed as consecutive 4-byte words.
    pub specialization: Vec<(u32, u32)>,
}

/// Memory dependencies recorded around dispatches and transfers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    /// Host writes become visible to shader reads.
    HostToDevice,
    /// Shader writes become visible to host reads.
    DeviceToHost,
    /// Transfer writes become visible to host reads.
    TransferToHost,
}

impl Barrier {
    /// `(src_stage, src_access, dst_stage, dst_access)`.
    pub fn masks(
        self,
    ) -> (
        vk::PipelineStageFlags,
        vk::AccessFlags,
        vk::PipelineStageFlags,
        vk::AccessFlags,
    ) {
        match self {
            Barrier::HostToDevice => (
                vk::PipelineStageFlags::HOST,
                vk::AccessFlags::HOST_WRITE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            Barrier::DeviceToHost => (
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::HOST,
                vk::AccessFlags::HOST_READ,
            ),
            Barrier::TransferToHost => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::HOST,
                vk::AccessFlags::HOST_READ,
            ),
        }
    }
}

/// A single recorded command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        offset: u32,
        bytes: Vec<u8>,
    },
    Barrier(Barrier),
    ResetQueries {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        pool: vk::QueryPool,
        query: u32,
        stage: vk::PipelineStageFlags,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    FillBuffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        word: u32,
    },
}

/// The device calls this crate issues.
///
/// # Safety
///
/// Every method is a thin wrapper over a Vulkan entry point and inherits its
/// valid-usage rules: handles must come from this driver, must not be
/// destroyed twice, and must not be destroyed while the device still uses
/// them. Callers uphold these through the ownership types in this crate.
pub trait Driver {
    fn properties(&self) -> DeviceProperties;

    unsafe fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer>;
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);
    unsafe fn memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    unsafe fn allocate_memory(&self, size: u64, memory_type_index: u32)
        -> VkResult<vk::DeviceMemory>;
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);
    unsafe fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory)
        -> VkResult<()>;

    /// Map `[offset, offset + size)`. The pointer addresses `offset`.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64)
        -> VkResult<*mut u8>;
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// `size` may be `vk::WHOLE_SIZE` to reach the end of the current mapping.
    unsafe fn flush_range(&self, memory: vk::DeviceMemory, offset: u64, size: u64)
        -> VkResult<()>;
    unsafe fn invalidate_range(&self, memory: vk::DeviceMemory, offset: u64, size: u64)
        -> VkResult<()>;

    unsafe fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule);
    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// `push_constants` is `(offset, size)`; a zero size declares no range.
    unsafe fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: (u32, u32),
    ) -> VkResult<vk::PipelineLayout>;
    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    unsafe fn write_descriptor_sets(&self, writes: &[DescriptorWrite]);
    unsafe fn create_compute_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline>;
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Pools are created on the compute queue family with per-buffer reset.
    unsafe fn create_command_pool(&self) -> VkResult<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool)
        -> VkResult<vk::CommandBuffer>;
    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    /// Reset, begin, record `commands`, and end.
    unsafe fn record(
        &self,
        buffer: vk::CommandBuffer,
        one_time: bool,
        commands: &[Command],
    ) -> VkResult<()>;
    unsafe fn submit(&self, buffer: vk::CommandBuffer, fence: vk::Fence) -> VkResult<()>;

    unsafe fn create_fence(&self) -> VkResult<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// `Ok(false)` when `timeout_ns` elapsed before the fence signaled.
    unsafe fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool>;
    unsafe fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;

    unsafe fn create_query_pool(&self, count: u32) -> VkResult<vk::QueryPool>;
    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool);
    /// Raw timestamp values, or `None` while any query is still unavailable.
    unsafe fn query_timestamps(
        &self,
        pool: vk::QueryPool,
        count: u32,
        wait: bool,
    ) -> VkResult<Option<Vec<u64>>>;

    unsafe fn wait_idle(&self) -> VkResult<()>;
    /// Destroy the logical device and everything the driver owns.
    unsafe fn destroy(&self);
}
