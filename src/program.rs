//! Compute programs: the shader, descriptor, pipeline and command objects
//! behind one kernel, built in a fixed order and unwound through a ledger.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::CString;

use ash::vk;

use crate::binding::{Binding, BindingSet};
use crate::device::DeviceContext;
use crate::dispatch::DispatchState;
use crate::driver::{DescriptorWrite, PipelineDesc};
use crate::error::{Result, VulkanError};
use crate::spirv::ShaderCode;

/// Shape of a compute program, fixed at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramConfig {
    /// Workgroup size, passed as specialization constants 0, 1 and 2.
    pub local_size: [u32; 3],
    /// Bytes of push-constant space declared in the pipeline layout.
    pub push_constant_capacity: u32,
    /// Start of the push-constant range within the device's budget.
    pub push_constant_offset: u32,
    /// Workgroup memory lengths keyed by index; index `i` is specialization
    /// constant `3 + i`.
    pub shared_memory: BTreeMap<u32, u32>,
    pub entry_point: String,
    /// Create a timestamp query pool so dispatches can be timed.
    pub timing: bool,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            local_size: [1, 1, 1],
            push_constant_capacity: 0,
            push_constant_offset: 0,
            shared_memory: BTreeMap::new(),
            entry_point: "main".to_string(),
            timing: false,
        }
    }
}

impl ProgramConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_size(mut self, x: u32, y: u32, z: u32) -> Self {
        self.local_size = [x, y, z];
        self
    }

    pub fn push_constants(mut self, capacity: u32, offset: u32) -> Self {
        self.push_constant_capacity = capacity;
        self.push_constant_offset = offset;
        self
    }

    pub fn shared_memory(mut self, index: u32, length: u32) -> Self {
        self.shared_memory.insert(index, length);
        self
    }

    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = name.into();
        self
    }

    pub fn timing(mut self, enabled: bool) -> Self {
        self.timing = enabled;
        self
    }

    /// `(constant_id, value)` pairs handed to the pipeline.
    pub(crate) fn specialization(&self) -> Vec<(u32, u32)> {
        let [x, y, z] = self.local_size;
        let mut constants = vec![(0, x), (1, y), (2, z)];
        constants.extend(self.shared_memory.iter().map(|(&index, &length)| (3 + index, length)));
        constants
    }

    /// Check everything that can be checked without a device call.
    fn validate(&self, ctx: &DeviceContext) -> Result<CString> {
        let limits = ctx.limits();

        for (axis, (&size, &max)) in ["x", "y", "z"]
            .iter()
            .zip(self.local_size.iter().zip(limits.max_compute_work_group_size.iter()))
        {
            if size == 0 {
                return Err(VulkanError::invalid(format!("local size {} must be at least 1", axis)));
            }
            if size > max {
                return Err(VulkanError::LimitExceeded {
                    what: "local workgroup size",
                    value: u64::from(size),
                    limit: u64::from(max),
                });
            }
        }
        let invocations: u64 = self.local_size.iter().map(|&s| u64::from(s)).product();
        if invocations > u64::from(limits.max_compute_work_group_invocations) {
            return Err(VulkanError::LimitExceeded {
                what: "workgroup invocations",
                value: invocations,
                limit: u64::from(limits.max_compute_work_group_invocations),
            });
        }

        if self.push_constant_capacity % 4 != 0 {
            return Err(VulkanError::Misaligned {
                what: "push constant capacity",
                value: u64::from(self.push_constant_capacity),
                alignment: 4,
            });
        }
        if self.push_constant_offset % 4 != 0 {
            return Err(VulkanError::Misaligned {
                what: "push constant offset",
                value: u64::from(self.push_constant_offset),
                alignment: 4,
            });
        }
        let push_end =
            u64::from(self.push_constant_offset) + u64::from(self.push_constant_capacity);
        if push_end > u64::from(limits.max_push_constants_size) {
            return Err(VulkanError::LimitExceeded {
                what: "push constant range",
                value: push_end,
                limit: u64::from(limits.max_push_constants_size),
            });
        }

        if let Some((index, _)) = self.shared_memory.iter().find(|(_, len)| **len == 0) {
            return Err(VulkanError::invalid(format!(
                "workgroup memory length {} must be at least 1",
                index
            )));
        }
        if self.timing && !limits.timestamps_supported {
            return Err(VulkanError::TimingUnavailable);
        }

        CString::new(self.entry_point.as_str())
            .map_err(|_| VulkanError::invalid("entry point name contains a NUL byte"))
    }
}

/// Construction steps, in creation order. A program records the last one
/// it completed; teardown unwinds from there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    None,
    ShaderModule,
    SetLayouts,
    PipelineLayout,
    Descriptors,
    Pipeline,
    CommandPool,
    CommandBuffer,
    Fence,
    QueryPool,
}

/// A compiled compute kernel bound to a fixed set of buffers.
///
/// Workgroup counts and push-constant bytes are the only state that changes
/// after construction; both are validated in their setters so dispatches do
/// not re-check limits.
pub struct ComputeProgram<'a> {
    pub(crate) ctx: &'a DeviceContext,
    bindings: BindingSet<'a>,
    reached: Stage,
    shader_module: vk::ShaderModule,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    descriptor_pool: vk::DescriptorPool,
    pub(crate) descriptor_sets: Vec<vk::DescriptorSet>,
    pub(crate) pipeline: vk::Pipeline,
    command_pool: vk::CommandPool,
    pub(crate) command_buffer: vk::CommandBuffer,
    pub(crate) fence: vk::Fence,
    pub(crate) query_pool: Option<vk::QueryPool>,
    local_size: [u32; 3],
    pub(crate) workgroups: [u32; 3],
    pub(crate) push_offset: u32,
    pub(crate) push_constants: Vec<u8>,
    pub(crate) state: Cell<DispatchState>,
    torn_down: bool,
}

impl<'a> ComputeProgram<'a> {
    /// Build a program. On failure every object created so far is destroyed
    /// and no program is returned.
    pub fn new(
        ctx: &'a DeviceContext,
        code: &ShaderCode,
        bindings: &BindingSet<'a>,
        config: ProgramConfig,
    ) -> Result<Self> {
        ctx.ensure_valid()?;
        if let Some(bound) = bindings.context() {
            if !std::ptr::eq(bound, ctx) {
                return Err(VulkanError::invalid("bindings belong to a different device context"));
            }
        }
        if bindings.entries().iter().any(|b| !b.buffer.is_valid()) {
            return Err(VulkanError::invalid("binding set references a torn-down buffer"));
        }
        let entry_point = config.validate(ctx)?;

        let mut program = Self {
            ctx,
            bindings: bindings.clone(),
            reached: Stage::None,
            shader_module: vk::ShaderModule::null(),
            set_layouts: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            pipeline: vk::Pipeline::null(),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            query_pool: None,
            local_size: config.local_size,
            workgroups: [1, 1, 1],
            push_offset: config.push_constant_offset,
            push_constants: vec![0; config.push_constant_capacity as usize],
            state: Cell::new(DispatchState::Idle),
            torn_down: false,
        };
        if let Err(e) = program.build(code, &config, entry_point) {
            tracing::debug!(reached = ?program.reached, error = %e, "program construction failed");
            program.teardown();
            return Err(e);
        }

        tracing::debug!(
            local_size = ?config.local_size,
            bindings = program.bindings.len(),
            sets = program.set_layouts.len(),
            push_constants = config.push_constant_capacity,
            timing = config.timing,
            "created compute program"
        );
        Ok(program)
    }

    fn build(&mut self, code: &ShaderCode, config: &ProgramConfig, entry_point: CString) -> Result<()> {
        let ctx = self.ctx;
        let d = ctx.driver();

        self.shader_module = unsafe { d.create_shader_module(code.words()) }
            .map_err(VulkanError::vk("vkCreateShaderModule"))?;
        self.reached = Stage::ShaderModule;

        // Unused set indices below the highest one get empty layouts.
        for set in 0..self.bindings.set_count() {
            match unsafe { d.create_descriptor_set_layout(&self.bindings.layout_for(set)) } {
                Ok(layout) => self.set_layouts.push(layout),
                Err(e) => {
                    for layout in self.set_layouts.drain(..) {
                        unsafe { d.destroy_descriptor_set_layout(layout) };
                    }
                    return Err(VulkanError::vk("vkCreateDescriptorSetLayout")(e));
                }
            }
        }
        self.reached = Stage::SetLayouts;

        self.pipeline_layout = unsafe {
            d.create_pipeline_layout(
                &self.set_layouts,
                (config.push_constant_offset, config.push_constant_capacity),
            )
        }
        .map_err(VulkanError::vk("vkCreatePipelineLayout"))?;
        self.reached = Stage::PipelineLayout;

        if !self.set_layouts.is_empty() {
            let pool = unsafe {
                d.create_descriptor_pool(self.set_layouts.len() as u32, &self.bindings.pool_sizes())
            }
            .map_err(VulkanError::vk("vkCreateDescriptorPool"))?;
            let sets = match unsafe { d.allocate_descriptor_sets(pool, &self.set_layouts) } {
                Ok(sets) => sets,
                Err(e) => {
                    unsafe { d.destroy_descriptor_pool(pool) };
                    return Err(VulkanError::vk("vkAllocateDescriptorSets")(e));
                }
            };
            let writes: Vec<DescriptorWrite> = self
                .bindings
                .entries()
                .iter()
                .map(|b| descriptor_write(&sets, b))
                .collect();
            unsafe { d.write_descriptor_sets(&writes) };
            self.descriptor_pool = pool;
            self.descriptor_sets = sets;
        }
        self.reached = Stage::Descriptors;

        let desc = PipelineDesc {
            module: self.shader_module,
            layout: self.pipeline_layout,
            entry_point,
            specialization: config.specialization(),
        };
        self.pipeline = unsafe { d.create_compute_pipeline(&desc) }
            .map_err(VulkanError::vk("vkCreateComputePipelines"))?;
        self.reached = Stage::Pipeline;

        self.command_pool = unsafe { d.create_command_pool() }
            .map_err(VulkanError::vk("vkCreateCommandPool"))?;
        self.reached = Stage::CommandPool;

        self.command_buffer = unsafe { d.allocate_command_buffer(self.command_pool) }
            .map_err(VulkanError::vk("vkAllocateCommandBuffers"))?;
        self.reached = Stage::CommandBuffer;

        self.fence = unsafe { d.create_fence() }.map_err(VulkanError::vk("vkCreateFence"))?;
        self.reached = Stage::Fence;

        if config.timing {
            let pool = unsafe { d.create_query_pool(2) }.map_err(VulkanError::vk("vkCreateQueryPool"))?;
            self.query_pool = Some(pool);
            self.reached = Stage::QueryPool;
        }
        Ok(())
    }

    /// Destroy everything created up to and including `reached`, newest first.
    fn teardown_from(&mut self, reached: Stage) {
        let ctx = self.ctx;
        let d = ctx.driver();
        unsafe {
            if reached >= Stage::QueryPool {
                if let Some(pool) = self.query_pool.take() {
                    d.destroy_query_pool(pool);
                }
            }
            if reached >= Stage::Fence {
                d.destroy_fence(std::mem::take(&mut self.fence));
            }
            if reached >= Stage::CommandBuffer {
                d.free_command_buffer(self.command_pool, std::mem::take(&mut self.command_buffer));
            }
            if reached >= Stage::CommandPool {
                d.destroy_command_pool(std::mem::take(&mut self.command_pool));
            }
            if reached >= Stage::Pipeline {
                d.destroy_pipeline(std::mem::take(&mut self.pipeline));
            }
            if reached >= Stage::Descriptors && self.descriptor_pool != vk::DescriptorPool::null() {
                // frees the sets with it
                d.destroy_descriptor_pool(std::mem::take(&mut self.descriptor_pool));
                self.descriptor_sets.clear();
            }
            if reached >= Stage::PipelineLayout {
                d.destroy_pipeline_layout(std::mem::take(&mut self.pipeline_layout));
            }
            if reached >= Stage::SetLayouts {
                for layout in self.set_layouts.drain(..) {
                    d.destroy_descriptor_set_layout(layout);
                }
            }
            if reached >= Stage::ShaderModule {
                d.destroy_shader_module(std::mem::take(&mut self.shader_module));
            }
        }
        self.reached = Stage::None;
    }

    /// Last construction step completed; [`Stage::None`] after teardown.
    pub fn stage(&self) -> Stage {
        self.reached
    }

    pub fn is_valid(&self) -> bool {
        !self.torn_down && self.ctx.is_valid()
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.torn_down {
            return Err(VulkanError::invalid("compute program has been torn down"));
        }
        self.ctx.ensure_valid()
    }

    pub fn local_size(&self) -> [u32; 3] {
        self.local_size
    }

    pub fn workgroups(&self) -> [u32; 3] {
        self.workgroups
    }

    pub fn bindings(&self) -> &[Binding<'a>] {
        self.bindings.entries()
    }

    pub fn timing_enabled(&self) -> bool {
        self.query_pool.is_some()
    }

    pub fn push_constant_capacity(&self) -> u32 {
        self.push_constants.len() as u32
    }

    /// Current push-constant bytes, zero where never written.
    pub fn push_constants(&self) -> &[u8] {
        &self.push_constants
    }

    /// Set the dispatch group counts.
    pub fn set_workgroups(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.ensure_valid()?;
        let max = self.ctx.limits().max_compute_work_group_count;
        for (&count, &limit) in [x, y, z].iter().zip(max.iter()) {
            if count == 0 {
                return Err(VulkanError::invalid("workgroup count must be at least 1"));
            }
            if count > limit {
                return Err(VulkanError::LimitExceeded {
                    what: "workgroup count",
                    value: u64::from(count),
                    limit: u64::from(limit),
                });
            }
        }
        self.workgroups = [x, y, z];
        Ok(())
    }

    /// Write `bytes` at `offset` within the push-constant range.
    ///
    /// The length need not be a whole number of words; the full zero-padded
    /// range is pushed at dispatch.
    pub fn set_push_constants(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        self.ensure_valid()?;
        if bytes.is_empty() {
            return Err(VulkanError::invalid("push constant write is empty"));
        }
        if offset % 4 != 0 {
            return Err(VulkanError::Misaligned {
                what: "push constant write offset",
                value: u64::from(offset),
                alignment: 4,
            });
        }
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.push_constants.len() {
            return Err(VulkanError::OutOfRange {
                offset: u64::from(offset),
                length: bytes.len() as u64,
                size: self.push_constants.len() as u64,
            });
        }
        self.push_constants[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Typed form of [`set_push_constants`](Self::set_push_constants).
    pub fn set_push_constant_values<T: bytemuck::Pod>(&mut self, offset: u32, values: &[T]) -> Result<()> {
        self.set_push_constants(offset, bytemuck::cast_slice(values))
    }

    /// Destroy every object the program created. Waits for an in-flight
    /// dispatch first. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if !self.ctx.is_valid() {
            tracing::error!("compute program outlived its device context");
            return;
        }
        if self.state.get() == DispatchState::Submitted {
            match unsafe { self.ctx.driver().wait_fence(self.fence, u64::MAX) } {
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "waiting for in-flight dispatch failed during teardown"),
            }
            self.state.set(DispatchState::Idle);
        }
        let reached = self.reached;
        self.teardown_from(reached);
        tracing::debug!(?reached, "compute program torn down");
    }
}

impl Drop for ComputeProgram<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn descriptor_write(sets: &[vk::DescriptorSet], binding: &Binding<'_>) -> DescriptorWrite {
    DescriptorWrite {
        set: sets[binding.set as usize],
        binding: binding.slot,
        descriptor_type: binding.kind.descriptor_type(),
        buffer: binding.buffer.raw(),
        offset: binding.offset,
        range: binding.length,
    }
}
