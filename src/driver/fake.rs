//! Host-memory driver for tests.
//!
//! Keeps a host copy and a device copy of every non-coherent allocation so
//! a missing flush or invalidate shows up as stale data, counts live handles,
//! checks flush/invalidate ranges against the atom size, and can fail the
//! n-th call of any entry point. Recorded commands run at submit time; a
//! dispatch calls an optional host "kernel" over the bound buffer ranges.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;

use super::{
    Command, DescriptorWrite, DeviceProperties, Driver, LayoutBinding, MemoryType, PipelineDesc,
    VkResult,
};
use crate::device::DeviceLimits;

#[derive(Clone, Debug)]
pub(crate) struct FakeConfig {
    pub limits: DeviceLimits,
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    /// Polls a fence answers "not signaled" before it signals.
    pub fence_delay: u32,
}

impl FakeConfig {
    /// Device-local plus coherent and cached host-visible types.
    pub fn coherent() -> Self {
        Self {
            limits: fake_limits(),
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
            ],
            fence_delay: 0,
        }
    }

    /// No coherent host-visible type at all.
    pub fn non_coherent() -> Self {
        Self {
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ],
            ..Self::coherent()
        }
    }

    pub fn with_memory_types(mut self, types: Vec<vk::MemoryPropertyFlags>) -> Self {
        self.memory_types = types;
        self
    }

    pub fn with_fence_delay(mut self, polls: u32) -> Self {
        self.fence_delay = polls;
        self
    }

    pub fn with_limits(mut self, edit: impl FnOnce(&mut DeviceLimits)) -> Self {
        edit(&mut self.limits);
        self
    }
}

fn fake_limits() -> DeviceLimits {
    DeviceLimits {
        non_coherent_atom_size: 64,
        min_storage_buffer_offset_alignment: 16,
        min_uniform_buffer_offset_alignment: 64,
        max_storage_buffer_range: 1 << 24,
        max_uniform_buffer_range: 65536,
        max_push_constants_size: 128,
        max_compute_work_group_size: [1024, 1024, 64],
        max_compute_work_group_invocations: 256,
        max_compute_work_group_count: [65535, 65535, 65535],
        max_compute_shared_memory_size: 32768,
        max_bound_descriptor_sets: 4,
        timestamp_period: 2.0,
        timestamp_valid_bits: 64,
        timestamps_supported: true,
    }
}

/// Bytes of one bound buffer range, handed to a test kernel.
pub(crate) struct KernelBuffer {
    pub set: u32,
    pub binding: u32,
    pub bytes: Vec<u8>,
}

pub(crate) struct KernelArgs<'k> {
    pub groups: [u32; 3],
    pub push_constants: &'k [u8],
    pub specialization: &'k [(u32, u32)],
    pub buffers: Vec<KernelBuffer>,
}

pub(crate) type Kernel = Rc<dyn Fn(&mut KernelArgs<'_>)>;

struct Allocation {
    size: u64,
    coherent: bool,
    device: Box<[u8]>,
    host: Box<[u8]>,
    /// Host bytes as of the last map or flush; a flush writes back only
    /// bytes that differ, like a cache writing back dirty lines.
    clean: Box<[u8]>,
    mapped: Option<(u64, u64)>,
}

struct FakeBuffer {
    size: u64,
    memory: Option<u64>,
}

struct Fence {
    signaled: bool,
    remaining: u32,
    /// Buffers copied or filled by the submission this fence guards.
    buffers: Vec<u64>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    live: HashMap<u64, &'static str>,
    buffers: HashMap<u64, FakeBuffer>,
    memory: HashMap<u64, Allocation>,
    set_layouts: HashMap<u64, Vec<LayoutBinding>>,
    created_set_layouts: Vec<Vec<LayoutBinding>>,
    push_ranges: Vec<(u32, u32)>,
    pool_sets: HashMap<u64, (u32, Vec<u64>)>,
    sets: HashMap<u64, Vec<DescriptorWrite>>,
    pipelines: HashMap<u64, PipelineDesc>,
    last_pipeline: Option<PipelineDesc>,
    command_buffers: HashMap<u64, (u64, Vec<Command>)>,
    fences: HashMap<u64, Fence>,
    queries: HashMap<u64, (Vec<Option<u64>>, Option<u64>)>,
    failures: Vec<(&'static str, u32)>,
    call_counts: HashMap<&'static str, u32>,
    calls: Vec<&'static str>,
    submissions: Vec<Vec<Command>>,
    flushes: Vec<(u64, u64)>,
    invalidates: Vec<(u64, u64)>,
    violations: Vec<String>,
    clock: u64,
    destroyed: bool,
    kernel: Option<Kernel>,
}

impl State {
    fn handle(&mut self, kind: &'static str) -> u64 {
        self.next_handle += 1;
        let raw = 0x1000 + self.next_handle;
        self.live.insert(raw, kind);
        raw
    }

    fn release(&mut self, raw: u64, kind: &'static str) {
        match self.live.remove(&raw) {
            Some(k) if k == kind => {}
            Some(k) => self.violations.push(format!("released {} {:#x} as {}", k, raw, kind)),
            None => self.violations.push(format!("double free of {} {:#x}", kind, raw)),
        }
    }

    fn buffer_memory(&mut self, buffer: u64) -> Option<(u64, &mut Allocation)> {
        let size = self.buffers.get(&buffer)?.size;
        let memory = self.buffers.get(&buffer)?.memory?;
        self.memory.get_mut(&memory).map(|alloc| (size, alloc))
    }

    fn execute(&mut self, commands: &[Command], fence: u64) {
        let mut pipeline: Option<u64> = None;
        let mut sets: Vec<vk::DescriptorSet> = Vec::new();
        let mut push = Vec::new();

        for command in commands {
            match command {
                Command::BindPipeline(p) => pipeline = Some(p.as_raw()),
                Command::BindDescriptorSets { sets: s, .. } => sets = s.clone(),
                Command::PushConstants { bytes, .. } => push = bytes.clone(),
                Command::Barrier(_) => {}
                Command::ResetQueries { pool, first, count } => {
                    if let Some((values, _)) = self.queries.get_mut(&pool.as_raw()) {
                        for v in values.iter_mut().skip(*first as usize).take(*count as usize) {
                            *v = None;
                        }
                    }
                }
                Command::WriteTimestamp { pool, query, .. } => {
                    self.clock += 1000;
                    let clock = self.clock;
                    let slot = self
                        .queries
                        .get_mut(&pool.as_raw())
                        .filter(|(values, _)| (*query as usize) < values.len());
                    if let Some((values, owner)) = slot {
                        values[*query as usize] = Some(clock);
                        *owner = Some(fence);
                    } else {
                        self.violations.push("timestamp written to unknown query".into());
                    }
                }
                Command::Dispatch { x, y, z } => {
                    let Some(p) = pipeline else {
                        self.violations.push("dispatch without a bound pipeline".into());
                        continue;
                    };
                    self.clock += 5000;
                    self.run_kernel(p, &sets, &push, [*x, *y, *z]);
                }
                Command::CopyBuffer { src, dst, src_offset, dst_offset, size } => {
                    let (src_start, end) = (*src_offset as usize, (src_offset + size) as usize);
                    let bytes = self
                        .buffer_memory(src.as_raw())
                        .filter(|(len, _)| src_offset + size <= *len)
                        .map(|(_, alloc)| alloc.device[src_start..end].to_vec());
                    let Some(bytes) = bytes else {
                        self.violations.push("copy source out of range".into());
                        continue;
                    };
                    let dst_start = *dst_offset as usize;
                    let written = self
                        .buffer_memory(dst.as_raw())
                        .filter(|(len, _)| dst_offset + size <= *len)
                        .map(|(_, alloc)| {
                            alloc.device[dst_start..dst_start + bytes.len()].copy_from_slice(&bytes)
                        });
                    if written.is_none() {
                        self.violations.push("copy destination out of range".into());
                    }
                }
                Command::FillBuffer { buffer, offset, size, word } => {
                    let Some(len) = self.buffers.get(&buffer.as_raw()).map(|b| b.size) else {
                        self.violations.push("fill of unknown buffer".into());
                        continue;
                    };
                    let end = if *size == vk::WHOLE_SIZE {
                        offset + (len - offset) / 4 * 4
                    } else {
                        offset + size
                    };
                    if end > len || offset % 4 != 0 || (end - offset) % 4 != 0 {
                        self.violations.push(format!("bad fill range {}..{}", offset, end));
                        continue;
                    }
                    if let Some((_, alloc)) = self.buffer_memory(buffer.as_raw()) {
                        for chunk in alloc.device[*offset as usize..end as usize].chunks_exact_mut(4) {
                            chunk.copy_from_slice(&word.to_le_bytes());
                        }
                    }
                }
            }
        }
    }

    fn run_kernel(&mut self, pipeline: u64, sets: &[vk::DescriptorSet], push: &[u8], groups: [u32; 3]) {
        let Some(kernel) = self.kernel.clone() else {
            return;
        };
        let specialization = self
            .pipelines
            .get(&pipeline)
            .map(|p| p.specialization.clone())
            .unwrap_or_default();

        let mut bound = Vec::new();
        for (set_index, set) in sets.iter().enumerate() {
            for write in self.sets.get(&set.as_raw()).cloned().unwrap_or_default() {
                bound.push((set_index as u32, write));
            }
        }
        let mut buffers = Vec::new();
        for (set, write) in &bound {
            let Some((len, alloc)) = self.buffer_memory(write.buffer.as_raw()) else {
                continue;
            };
            let end = (write.offset + write.range).min(len);
            buffers.push(KernelBuffer {
                set: *set,
                binding: write.binding,
                bytes: alloc.device[write.offset as usize..end as usize].to_vec(),
            });
        }

        let mut args = KernelArgs {
            groups,
            push_constants: push,
            specialization: &specialization,
            buffers,
        };
        kernel(&mut args);

        for ((_, write), out) in bound.iter().zip(args.buffers) {
            if let Some((_, alloc)) = self.buffer_memory(write.buffer.as_raw()) {
                let start = write.offset as usize;
                alloc.device[start..start + out.bytes.len()].copy_from_slice(&out.bytes);
            }
        }
    }

    fn check_range(&mut self, memory: u64, offset: u64, size: u64, atom: u64, what: &str) -> Option<(u64, u64)> {
        let Some(alloc) = self.memory.get(&memory) else {
            self.violations.push(format!("{} on unknown memory", what));
            return None;
        };
        let Some((map_offset, map_size)) = alloc.mapped else {
            self.violations.push(format!("{} on unmapped memory", what));
            return None;
        };
        let map_end = map_offset + map_size;
        let size = if size == vk::WHOLE_SIZE {
            if map_end % atom != 0 && map_end != alloc.size {
                self.violations.push(format!("{} to WHOLE_SIZE ends mid-atom at {}", what, map_end));
            }
            map_end.saturating_sub(offset)
        } else {
            if size % atom != 0 && offset + size != alloc.size {
                self.violations.push(format!("{} size {} is not a multiple of {}", what, size, atom));
            }
            size
        };
        if offset % atom != 0 {
            self.violations.push(format!("{} offset {} is not a multiple of {}", what, offset, atom));
        }
        if offset < map_offset || offset + size > map_end {
            self.violations.push(format!(
                "{} range {}..{} outside mapping {}..{}",
                what,
                offset,
                offset + size,
                map_offset,
                map_end
            ));
            return None;
        }
        Some((offset, size))
    }
}

pub(crate) struct FakeDriver {
    config: FakeConfig,
    state: Rc<RefCell<State>>,
}

/// Test-side view into a [`FakeDriver`] after it has been boxed into a context.
#[derive(Clone)]
pub(crate) struct Probe {
    state: Rc<RefCell<State>>,
}

impl FakeDriver {
    pub fn new(config: FakeConfig) -> Self {
        Self {
            config,
            state: Rc::new(RefCell::new(State::default())),
        }
    }

    pub fn probe(&self) -> Probe {
        Probe {
            state: Rc::clone(&self.state),
        }
    }

    fn enter(&self, op: &'static str) -> VkResult<()> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.calls.push(op);
        if s.destroyed {
            s.violations.push(format!("{} after device destroy", op));
        }
        let count = {
            let c = s.call_counts.entry(op).or_insert(0);
            *c += 1;
            *c
        };
        if s.failures.iter().any(|&(name, nth)| name == op && nth == count) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    fn atom(&self) -> u64 {
        self.config.limits.non_coherent_atom_size
    }
}

impl Probe {
    pub fn live_handles(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn live_of(&self, kind: &str) -> usize {
        self.state.borrow().live.values().filter(|k| **k == kind).count()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    pub fn device_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    /// Fail the `nth` (1-based) call of `op` with `ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn fail_nth(&self, op: &'static str, nth: u32) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let already = s.call_counts.get(op).copied().unwrap_or(0);
        s.failures.push((op, already + nth));
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn submissions(&self) -> Vec<Vec<Command>> {
        self.state.borrow().submissions.clone()
    }

    pub fn flushes(&self) -> Vec<(u64, u64)> {
        self.state.borrow().flushes.clone()
    }

    pub fn invalidates(&self) -> Vec<(u64, u64)> {
        self.state.borrow().invalidates.clone()
    }

    pub fn set_layouts(&self) -> Vec<Vec<LayoutBinding>> {
        self.state.borrow().created_set_layouts.clone()
    }

    pub fn push_ranges(&self) -> Vec<(u32, u32)> {
        self.state.borrow().push_ranges.clone()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.borrow().sets.values().flatten().copied().collect()
    }

    pub fn last_pipeline(&self) -> Option<PipelineDesc> {
        self.state.borrow().last_pipeline.clone()
    }

    pub fn signal_all_fences(&self) {
        for fence in self.state.borrow_mut().fences.values_mut() {
            fence.signaled = true;
        }
    }

    pub fn set_kernel(&self, kernel: impl Fn(&mut KernelArgs<'_>) + 'static) {
        self.state.borrow_mut().kernel = Some(Rc::new(kernel));
    }

    /// What the device sees for `buffer`, ignoring any unflushed host writes.
    pub fn device_bytes(&self, buffer: vk::Buffer) -> Vec<u8> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.buffer_memory(buffer.as_raw()) {
            Some((len, alloc)) => alloc.device[..len as usize].to_vec(),
            None => Vec::new(),
        }
    }

    /// Write `bytes` as if a shader had stored them.
    pub fn device_write(&self, buffer: vk::Buffer, offset: u64, bytes: &[u8]) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if let Some((_, alloc)) = s.buffer_memory(buffer.as_raw()) {
            alloc.device[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Whether the allocation bound to `buffer` is currently mapped.
    pub fn is_mapped(&self, buffer: vk::Buffer) -> bool {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.buffer_memory(buffer.as_raw())
            .map(|(_, alloc)| alloc.mapped.is_some())
            .unwrap_or(false)
    }
}

impl Driver for FakeDriver {
    fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            name: "Fake Compute Device".to_string(),
            vendor_id: 0x10DE,
            device_id: 0x1234,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_1,
            subgroup_size: 32,
            queue_family_index: 0,
            limits: self.config.limits.clone(),
            memory_types: self
                .config
                .memory_types
                .iter()
                .map(|&flags| MemoryType { flags, heap_index: 0 })
                .collect(),
        }
    }

    unsafe fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        self.enter("create_buffer")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("buffer");
        s.buffers.insert(raw, FakeBuffer { size, memory: None });
        Ok(vk::Buffer::from_raw(raw))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let _ = self.enter("destroy_buffer");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = buffer.as_raw();
        if s.fences.values().any(|f| !f.signaled && f.buffers.contains(&raw)) {
            s.violations.push(format!("buffer {:#x} destroyed while a transfer uses it", raw));
        }
        s.buffers.remove(&raw);
        s.release(buffer.as_raw(), "buffer");
    }

    unsafe fn memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let s = self.state.borrow();
        let size = s.buffers.get(&buffer.as_raw()).map(|b| b.size).unwrap_or(0);
        vk::MemoryRequirements {
            size: size.div_ceil(256) * 256,
            alignment: 256,
            memory_type_bits: (1u32 << self.config.memory_types.len()) - 1,
        }
    }

    unsafe fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        self.enter("allocate_memory")?;
        let flags = self
            .config
            .memory_types
            .get(memory_type_index as usize)
            .copied()
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let coherent = flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("memory");
        s.memory.insert(
            raw,
            Allocation {
                size,
                coherent,
                device: vec![0u8; size as usize].into_boxed_slice(),
                host: vec![0u8; if coherent { 0 } else { size as usize }].into_boxed_slice(),
                clean: vec![0u8; if coherent { 0 } else { size as usize }].into_boxed_slice(),
                mapped: None,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let _ = self.enter("free_memory");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if s.memory.get(&memory.as_raw()).is_some_and(|a| a.mapped.is_some()) {
            s.violations.push("freed memory while mapped".into());
        }
        s.memory.remove(&memory.as_raw());
        s.release(memory.as_raw(), "memory");
    }

    unsafe fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        self.enter("bind_buffer_memory")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.buffers.get_mut(&buffer.as_raw()) {
            Some(b) => b.memory = Some(memory.as_raw()),
            None => s.violations.push("bind of unknown buffer".into()),
        }
        Ok(())
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<*mut u8> {
        self.enter("map_memory")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let mut violation = None;
        let result = match s.memory.get_mut(&memory.as_raw()) {
            Some(alloc) => {
                let size = if size == vk::WHOLE_SIZE { alloc.size.saturating_sub(offset) } else { size };
                if alloc.mapped.is_some() {
                    violation = Some("memory mapped twice".to_string());
                    Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
                } else if offset + size > alloc.size || size == 0 {
                    violation = Some(format!("map {}+{} beyond allocation {}", offset, size, alloc.size));
                    Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
                } else {
                    alloc.mapped = Some((offset, size));
                    alloc.clean.copy_from_slice(&alloc.host);
                    let base = if alloc.coherent { alloc.device.as_mut_ptr() } else { alloc.host.as_mut_ptr() };
                    Ok(base.add(offset as usize))
                }
            }
            None => {
                violation = Some("map of unknown memory".to_string());
                Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
            }
        };
        if let Some(v) = violation {
            s.violations.push(v);
        }
        result
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let _ = self.enter("unmap_memory");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.memory.get_mut(&memory.as_raw()) {
            Some(alloc) if alloc.mapped.is_some() => alloc.mapped = None,
            _ => s.violations.push("unmap of memory that is not mapped".into()),
        }
    }

    unsafe fn flush_range(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<()> {
        self.enter("flush_range")?;
        let atom = self.atom();
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let Some((offset, size)) = s.check_range(memory.as_raw(), offset, size, atom, "flush") else {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        s.flushes.push((offset, size));
        if let Some(alloc) = s.memory.get_mut(&memory.as_raw()) {
            if !alloc.coherent {
                for i in offset as usize..(offset + size) as usize {
                    if alloc.host[i] != alloc.clean[i] {
                        alloc.device[i] = alloc.host[i];
                        alloc.clean[i] = alloc.host[i];
                    }
                }
            }
        }
        Ok(())
    }

    unsafe fn invalidate_range(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<()> {
        self.enter("invalidate_range")?;
        let atom = self.atom();
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let Some((offset, size)) = s.check_range(memory.as_raw(), offset, size, atom, "invalidate") else {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        s.invalidates.push((offset, size));
        if let Some(alloc) = s.memory.get_mut(&memory.as_raw()) {
            if !alloc.coherent {
                let range = offset as usize..(offset + size) as usize;
                alloc.host[range.clone()].copy_from_slice(&alloc.device[range.clone()]);
                alloc.clean[range.clone()].copy_from_slice(&alloc.device[range]);
            }
        }
        Ok(())
    }

    unsafe fn create_shader_module(&self, _code: &[u32]) -> VkResult<vk::ShaderModule> {
        self.enter("create_shader_module")?;
        Ok(vk::ShaderModule::from_raw(self.state.borrow_mut().handle("shader_module")))
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        let _ = self.enter("destroy_shader_module");
        self.state.borrow_mut().release(module.as_raw(), "shader_module");
    }

    unsafe fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        self.enter("create_descriptor_set_layout")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("set_layout");
        s.set_layouts.insert(raw, bindings.to_vec());
        s.created_set_layouts.push(bindings.to_vec());
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let _ = self.enter("destroy_descriptor_set_layout");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.set_layouts.remove(&layout.as_raw());
        s.release(layout.as_raw(), "set_layout");
    }

    unsafe fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: (u32, u32),
    ) -> VkResult<vk::PipelineLayout> {
        self.enter("create_pipeline_layout")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if set_layouts.iter().any(|l| !s.set_layouts.contains_key(&l.as_raw())) {
            s.violations.push("pipeline layout references a dead set layout".into());
        }
        s.push_ranges.push(push_constants);
        Ok(vk::PipelineLayout::from_raw(s.handle("pipeline_layout")))
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let _ = self.enter("destroy_pipeline_layout");
        self.state.borrow_mut().release(layout.as_raw(), "pipeline_layout");
    }

    unsafe fn create_descriptor_pool(&self, max_sets: u32, _sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool> {
        self.enter("create_descriptor_pool")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("descriptor_pool");
        s.pool_sets.insert(raw, (max_sets, Vec::new()));
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let _ = self.enter("destroy_descriptor_pool");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if let Some((_, sets)) = s.pool_sets.remove(&pool.as_raw()) {
            for set in sets {
                s.sets.remove(&set);
            }
        }
        s.release(pool.as_raw(), "descriptor_pool");
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        self.enter("allocate_descriptor_sets")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let (max_sets, used) = match s.pool_sets.get(&pool.as_raw()) {
            Some((max, sets)) => (*max, sets.len()),
            None => return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
        };
        if used + layouts.len() > max_sets as usize {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let mut out = Vec::with_capacity(layouts.len());
        for _ in layouts {
            s.next_handle += 1;
            let raw = 0x1000 + s.next_handle;
            s.sets.insert(raw, Vec::new());
            if let Some((_, sets)) = s.pool_sets.get_mut(&pool.as_raw()) {
                sets.push(raw);
            }
            out.push(vk::DescriptorSet::from_raw(raw));
        }
        Ok(out)
    }

    unsafe fn write_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let _ = self.enter("write_descriptor_sets");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        for write in writes {
            match s.sets.get_mut(&write.set.as_raw()) {
                Some(list) => {
                    list.retain(|w| w.binding != write.binding);
                    list.push(*write);
                }
                None => s.violations.push("write to unknown descriptor set".into()),
            }
        }
    }

    unsafe fn create_compute_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline> {
        self.enter("create_compute_pipeline")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("pipeline");
        s.pipelines.insert(raw, desc.clone());
        s.last_pipeline = Some(desc.clone());
        Ok(vk::Pipeline::from_raw(raw))
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let _ = self.enter("destroy_pipeline");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.pipelines.remove(&pipeline.as_raw());
        s.release(pipeline.as_raw(), "pipeline");
    }

    unsafe fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        self.enter("create_command_pool")?;
        Ok(vk::CommandPool::from_raw(self.state.borrow_mut().handle("command_pool")))
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let _ = self.enter("destroy_command_pool");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let owned: Vec<u64> = s
            .command_buffers
            .iter()
            .filter(|(_, (p, _))| *p == pool.as_raw())
            .map(|(cb, _)| *cb)
            .collect();
        for cb in owned {
            s.command_buffers.remove(&cb);
            s.release(cb, "command_buffer");
        }
        s.release(pool.as_raw(), "command_pool");
    }

    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        self.enter("allocate_command_buffer")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("command_buffer");
        s.command_buffers.insert(raw, (pool.as_raw(), Vec::new()));
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    unsafe fn free_command_buffer(&self, _pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        let _ = self.enter("free_command_buffer");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.command_buffers.remove(&buffer.as_raw());
        s.release(buffer.as_raw(), "command_buffer");
    }

    unsafe fn record(&self, buffer: vk::CommandBuffer, _one_time: bool, commands: &[Command]) -> VkResult<()> {
        self.enter("record")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.command_buffers.get_mut(&buffer.as_raw()) {
            Some((_, recorded)) => *recorded = commands.to_vec(),
            None => s.violations.push("record into unknown command buffer".into()),
        }
        Ok(())
    }

    unsafe fn submit(&self, buffer: vk::CommandBuffer, fence: vk::Fence) -> VkResult<()> {
        self.enter("submit")?;
        let delay = self.config.fence_delay;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let commands = match s.command_buffers.get(&buffer.as_raw()) {
            Some((_, recorded)) => recorded.clone(),
            None => {
                s.violations.push("submit of unknown command buffer".into());
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
        };
        let touched = commands
            .iter()
            .flat_map(|c| match c {
                Command::CopyBuffer { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
                Command::FillBuffer { buffer, .. } => vec![buffer.as_raw()],
                _ => Vec::new(),
            })
            .collect();
        match s.fences.get_mut(&fence.as_raw()) {
            Some(f) if f.signaled => s.violations.push("submit with a signaled fence".into()),
            Some(f) => {
                f.remaining = delay;
                f.buffers = touched;
            }
            None => s.violations.push("submit with unknown fence".into()),
        }
        s.submissions.push(commands.clone());
        s.execute(&commands, fence.as_raw());
        if delay == 0 {
            if let Some(f) = s.fences.get_mut(&fence.as_raw()) {
                f.signaled = true;
            }
        }
        Ok(())
    }

    unsafe fn create_fence(&self) -> VkResult<vk::Fence> {
        self.enter("create_fence")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("fence");
        s.fences.insert(
            raw,
            Fence {
                signaled: false,
                remaining: 0,
                buffers: Vec::new(),
            },
        );
        Ok(vk::Fence::from_raw(raw))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let _ = self.enter("destroy_fence");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.fences.remove(&fence.as_raw());
        s.release(fence.as_raw(), "fence");
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.enter("reset_fence")?;
        if let Some(f) = self.state.borrow_mut().fences.get_mut(&fence.as_raw()) {
            f.signaled = false;
        }
        Ok(())
    }

    unsafe fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        self.enter("wait_fence")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let Some(f) = s.fences.get_mut(&fence.as_raw()) else {
            s.violations.push("wait on unknown fence".into());
            return Err(vk::Result::ERROR_DEVICE_LOST);
        };
        if timeout_ns == u64::MAX || f.remaining == 0 {
            f.signaled = true;
        } else {
            f.remaining -= 1;
        }
        Ok(f.signaled)
    }

    unsafe fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        self.enter("fence_signaled")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let Some(f) = s.fences.get_mut(&fence.as_raw()) else {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        };
        if !f.signaled {
            if f.remaining == 0 {
                f.signaled = true;
            } else {
                f.remaining -= 1;
            }
        }
        Ok(f.signaled)
    }

    unsafe fn create_query_pool(&self, count: u32) -> VkResult<vk::QueryPool> {
        self.enter("create_query_pool")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let raw = s.handle("query_pool");
        s.queries.insert(raw, (vec![None; count as usize], None));
        Ok(vk::QueryPool::from_raw(raw))
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        let _ = self.enter("destroy_query_pool");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.queries.remove(&pool.as_raw());
        s.release(pool.as_raw(), "query_pool");
    }

    unsafe fn query_timestamps(&self, pool: vk::QueryPool, count: u32, wait: bool) -> VkResult<Option<Vec<u64>>> {
        self.enter("query_timestamps")?;
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let Some((values, owner)) = s.queries.get(&pool.as_raw()).cloned() else {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        };
        let done = match owner.and_then(|f| s.fences.get_mut(&f)) {
            Some(f) if wait => {
                f.signaled = true;
                true
            }
            Some(f) => f.signaled,
            None => false,
        };
        if !done {
            return Ok(None);
        }
        let values: Option<Vec<u64>> = values.into_iter().take(count as usize).collect();
        Ok(values)
    }

    unsafe fn wait_idle(&self) -> VkResult<()> {
        self.enter("wait_idle")?;
        for fence in self.state.borrow_mut().fences.values_mut() {
            fence.signaled = true;
        }
        Ok(())
    }

    unsafe fn destroy(&self) {
        let _ = self.enter("destroy");
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if s.destroyed {
            s.violations.push("device destroyed twice".into());
        }
        if !s.live.is_empty() {
            let leaked = s.live.len();
            s.violations.push(format!("device destroyed with {} live handles", leaked));
        }
        s.destroyed = true;
    }
}
