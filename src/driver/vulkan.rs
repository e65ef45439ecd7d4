//! `ash`-backed driver: instance creation, physical device selection, and
//! logical device setup, plus the per-call forwarding for [`Driver`].

use std::cell::Cell;
use std::ffi::{c_char, c_void, CStr};

use ash::vk;

use super::{
    Command, DescriptorWrite, DeviceProperties, Driver, LayoutBinding, MemoryType, PipelineDesc,
    VkResult,
};
use crate::config::ContextConfig;
use crate::device::DeviceLimits;
use crate::error::{Result, VulkanError};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const PORTABILITY_SUBSET: &CStr = c"VK_KHR_portability_subset";

/// Owns the Vulkan instance, the selected physical device, the logical device
/// and its single compute queue.
pub struct VulkanDriver {
    // Keeps the loader library mapped for the lifetime of the device.
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    device: ash::Device,
    queue: vk::Queue,
    properties: DeviceProperties,
    destroyed: Cell<bool>,
}

impl VulkanDriver {
    /// Load the Vulkan loader, create an instance, pick a GPU and create a
    /// logical device with one compute queue.
    pub fn new(config: &ContextConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| VulkanError::Loader(e.to_string()))?;

        let instance_version = unsafe { entry.try_enumerate_instance_version() }
            .map_err(VulkanError::vk("vkEnumerateInstanceVersion"))?
            .unwrap_or(vk::API_VERSION_1_0);
        let api_version = if instance_version >= vk::API_VERSION_1_1 {
            vk::API_VERSION_1_1
        } else {
            vk::API_VERSION_1_0
        };

        let mut layers: Vec<*const c_char> = Vec::new();
        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut use_debug_utils = false;
        if config.enable_validation {
            if instance_layer_available(&entry, VALIDATION_LAYER) {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                tracing::warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }
            if instance_extension_available(&entry, ash::ext::debug_utils::NAME) {
                extensions.push(ash::ext::debug_utils::NAME.as_ptr());
                use_debug_utils = true;
            } else {
                tracing::warn!("VK_EXT_debug_utils unavailable, validation messages will not be forwarded");
            }
        }

        #[allow(unused_mut)]
        let mut flags = vk::InstanceCreateFlags::empty();
        #[cfg(target_os = "macos")]
        {
            extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let app_name = std::ffi::CString::new(config.application_name.as_str())
            .map_err(|_| VulkanError::invalid("application name contains a NUL byte"))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(c"vk-compute")
            .engine_version(0)
            .api_version(api_version);
        let create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(VulkanError::vk("vkCreateInstance"))?;

        let debug = if use_debug_utils {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_messenger));
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    tracing::warn!(error = ?e, "failed to create debug messenger");
                    None
                }
            }
        } else {
            None
        };

        let destroy_instance = |debug: &Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>| unsafe {
            if let Some((loader, messenger)) = debug {
                loader.destroy_debug_utils_messenger(*messenger, None);
            }
            instance.destroy_instance(None);
        };

        let selected = match select_physical_device(&instance, config.device_index) {
            Ok(selected) => selected,
            Err(e) => {
                destroy_instance(&debug);
                return Err(e);
            }
        };
        let (physical_device, queue_family_index) = selected;

        let device = match create_logical_device(&instance, physical_device, queue_family_index) {
            Ok(device) => device,
            Err(e) => {
                destroy_instance(&debug);
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let properties = query_properties(
            &instance,
            physical_device,
            queue_family_index,
            api_version,
        );
        tracing::debug!(
            device = %properties.name,
            vendor_id = properties.vendor_id,
            queue_family = queue_family_index,
            "created Vulkan compute device"
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            device,
            queue,
            properties,
            destroyed: Cell::new(false),
        })
    }
}

fn instance_layer_available(entry: &ash::Entry, name: &CStr) -> bool {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    layers
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == name)
}

fn instance_extension_available(entry: &ash::Entry, name: &CStr) -> bool {
    let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }.unwrap_or_default();
    extensions
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
}

fn compute_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
}

/// Honour an explicit index, otherwise prefer a discrete GPU, falling back to
/// the first device with a compute queue.
fn select_physical_device(
    instance: &ash::Instance,
    device_index: Option<usize>,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(VulkanError::vk("vkEnumeratePhysicalDevices"))?;
    if devices.is_empty() {
        return Err(VulkanError::NoGpu);
    }

    if let Some(index) = device_index {
        let pd = *devices.get(index).ok_or_else(|| {
            VulkanError::invalid(format!(
                "device index {} out of range ({} devices)",
                index,
                devices.len()
            ))
        })?;
        let family = compute_queue_family(instance, pd).ok_or(VulkanError::NoComputeQueue)?;
        return Ok((pd, family));
    }

    let mut fallback = None;
    for &pd in &devices {
        let Some(family) = compute_queue_family(instance, pd) else {
            continue;
        };
        let props = unsafe { instance.get_physical_device_properties(pd) };
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            return Ok((pd, family));
        }
        fallback.get_or_insert((pd, family));
    }
    fallback.ok_or(VulkanError::NoComputeQueue)
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<ash::Device> {
    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities);

    let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .unwrap_or_default();
    let mut extensions: Vec<*const c_char> = Vec::new();
    if available
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == PORTABILITY_SUBSET)
    {
        extensions.push(PORTABILITY_SUBSET.as_ptr());
    }

    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extensions);
    unsafe { instance.create_device(physical_device, &device_info, None) }
        .map_err(VulkanError::vk("vkCreateDevice"))
}

fn query_properties(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    api_version: u32,
) -> DeviceProperties {
    let props = unsafe { instance.get_physical_device_properties(physical_device) };
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let timestamp_bits = families
        .get(queue_family_index as usize)
        .map(|f| f.timestamp_valid_bits)
        .unwrap_or(0);

    let mut subgroup_size = 0;
    if api_version >= vk::API_VERSION_1_1 && props.api_version >= vk::API_VERSION_1_1 {
        let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut subgroup);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
        subgroup_size = subgroup.subgroup_size;
    }

    let mem = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let memory_types = mem.memory_types[..mem.memory_type_count as usize]
        .iter()
        .map(|t| MemoryType {
            flags: t.property_flags,
            heap_index: t.heap_index,
        })
        .collect();

    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    DeviceProperties {
        name,
        vendor_id: props.vendor_id,
        device_id: props.device_id,
        device_type: props.device_type,
        api_version: props.api_version,
        subgroup_size,
        queue_family_index,
        limits: DeviceLimits::from_vk(&props.limits, timestamp_bits),
        memory_types,
    }
}

unsafe extern "system" fn debug_messenger(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vk_compute::validation", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vk_compute::validation", "{}", message);
    } else {
        tracing::debug!(target: "vk_compute::validation", "{}", message);
    }
    vk::FALSE
}

impl Driver for VulkanDriver {
    fn properties(&self) -> DeviceProperties {
        self.properties.clone()
    }

    unsafe fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        self.device.create_buffer(&info, None)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.device.destroy_buffer(buffer, None);
    }

    unsafe fn memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        self.device.get_buffer_memory_requirements(buffer)
    }

    unsafe fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        self.device.allocate_memory(&info, None)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.device.free_memory(memory, None);
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
    ) -> VkResult<()> {
        self.device.bind_buffer_memory(buffer, memory, 0)
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<*mut u8> {
        self.device
            .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
            .map(|ptr| ptr as *mut u8)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.device.unmap_memory(memory);
    }

    unsafe fn flush_range(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<()> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(offset)
            .size(size);
        self.device.flush_mapped_memory_ranges(std::slice::from_ref(&range))
    }

    unsafe fn invalidate_range(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<()> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(offset)
            .size(size);
        self.device.invalidate_mapped_memory_ranges(std::slice::from_ref(&range))
    }

    unsafe fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        self.device.create_shader_module(&info, None)
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.device.destroy_shader_module(module, None);
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        self.device.create_descriptor_set_layout(&info, None)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.device.destroy_descriptor_set_layout(layout, None);
    }

    unsafe fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: (u32, u32),
    ) -> VkResult<vk::PipelineLayout> {
        let (offset, size) = push_constants;
        let ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(offset)
            .size(size)];
        let ranges: &[vk::PushConstantRange] = if size > 0 { &ranges } else { &[] };
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(ranges);
        self.device.create_pipeline_layout(&info, None)
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.device.destroy_pipeline_layout(layout, None);
    }

    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        self.device.create_descriptor_pool(&info, None)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.device.destroy_descriptor_pool(pool, None);
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        self.device.allocate_descriptor_sets(&info)
    }

    unsafe fn write_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        // Buffer infos must outlive the write structs that point at them.
        let infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|w| {
                vk::DescriptorBufferInfo::default()
                    .buffer(w.buffer)
                    .offset(w.offset)
                    .range(w.range)
            })
            .collect();
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(infos.iter())
            .map(|(w, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(w.set)
                    .dst_binding(w.binding)
                    .dst_array_element(0)
                    .descriptor_type(w.descriptor_type)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        self.device.update_descriptor_sets(&vk_writes, &[]);
    }

    unsafe fn create_compute_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline> {
        let entries: Vec<vk::SpecializationMapEntry> = desc
            .specialization
            .iter()
            .enumerate()
            .map(|(i, &(id, _))| {
                vk::SpecializationMapEntry::default()
                    .constant_id(id)
                    .offset(i as u32 * 4)
                    .size(4)
            })
            .collect();
        let values: Vec<u32> = desc.specialization.iter().map(|&(_, value)| value).collect();
        let data: &[u8] = bytemuck::cast_slice(&values);
        let spec = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(data);
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(desc.module)
            .name(&desc.entry_point)
            .specialization_info(&spec);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(desc.layout);
        self.device
            .create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
            .map(|pipelines| pipelines[0])
            .map_err(|(_, e)| e)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.device.destroy_pipeline(pipeline, None);
    }

    unsafe fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.properties.queue_family_index);
        self.device.create_command_pool(&info, None)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.device.destroy_command_pool(pool, None);
    }

    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.device
            .allocate_command_buffers(&info)
            .map(|buffers| buffers[0])
    }

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        self.device.free_command_buffers(pool, &[buffer]);
    }

    unsafe fn record(
        &self,
        cb: vk::CommandBuffer,
        one_time: bool,
        commands: &[Command],
    ) -> VkResult<()> {
        let d = &self.device;
        d.reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())?;
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        d.begin_command_buffer(cb, &vk::CommandBufferBeginInfo::default().flags(flags))?;

        for command in commands {
            match command {
                Command::BindPipeline(pipeline) => {
                    d.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, *pipeline);
                }
                Command::BindDescriptorSets { layout, sets } => {
                    d.cmd_bind_descriptor_sets(
                        cb,
                        vk::PipelineBindPoint::COMPUTE,
                        *layout,
                        0,
                        sets,
                        &[],
                    );
                }
                Command::PushConstants { layout, offset, bytes } => {
                    d.cmd_push_constants(cb, *layout, vk::ShaderStageFlags::COMPUTE, *offset, bytes);
                }
                Command::Barrier(barrier) => {
                    let (src_stage, src_access, dst_stage, dst_access) = barrier.masks();
                    let memory_barrier = vk::MemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access);
                    d.cmd_pipeline_barrier(
                        cb,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        std::slice::from_ref(&memory_barrier),
                        &[],
                        &[],
                    );
                }
                Command::ResetQueries { pool, first, count } => {
                    d.cmd_reset_query_pool(cb, *pool, *first, *count);
                }
                Command::WriteTimestamp { pool, query, stage } => {
                    d.cmd_write_timestamp(cb, *stage, *pool, *query);
                }
                Command::Dispatch { x, y, z } => {
                    d.cmd_dispatch(cb, *x, *y, *z);
                }
                Command::CopyBuffer { src, dst, src_offset, dst_offset, size } => {
                    let region = vk::BufferCopy {
                        src_offset: *src_offset,
                        dst_offset: *dst_offset,
                        size: *size,
                    };
                    d.cmd_copy_buffer(cb, *src, *dst, std::slice::from_ref(&region));
                }
                Command::FillBuffer { buffer, offset, size, word } => {
                    d.cmd_fill_buffer(cb, *buffer, *offset, *size, *word);
                }
            }
        }

        d.end_command_buffer(cb)
    }

    unsafe fn submit(&self, cb: vk::CommandBuffer, fence: vk::Fence) -> VkResult<()> {
        let buffers = [cb];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        self.device
            .queue_submit(self.queue, std::slice::from_ref(&submit), fence)
    }

    unsafe fn create_fence(&self) -> VkResult<vk::Fence> {
        self.device.create_fence(&vk::FenceCreateInfo::default(), None)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None);
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.device.reset_fences(&[fence])
    }

    unsafe fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        match self.device.wait_for_fences(&[fence], true, timeout_ns) {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    unsafe fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        self.device.get_fence_status(fence)
    }

    unsafe fn create_query_pool(&self, count: u32) -> VkResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        self.device.create_query_pool(&info, None)
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.device.destroy_query_pool(pool, None);
    }

    unsafe fn query_timestamps(
        &self,
        pool: vk::QueryPool,
        count: u32,
        wait: bool,
    ) -> VkResult<Option<Vec<u64>>> {
        let mut values = vec![0u64; count as usize];
        let mut flags = vk::QueryResultFlags::TYPE_64;
        if wait {
            flags |= vk::QueryResultFlags::WAIT;
        }
        match self.device.get_query_pool_results(pool, 0, &mut values, flags) {
            Ok(()) => Ok(Some(values)),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e),
        }
    }

    unsafe fn wait_idle(&self) -> VkResult<()> {
        self.device.device_wait_idle()
    }

    unsafe fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.device.destroy_device(None);
        if let Some((loader, messenger)) = &self.debug {
            loader.destroy_debug_utils_messenger(*messenger, None);
        }
        self.instance.destroy_instance(None);
        tracing::debug!("destroyed Vulkan device and instance");
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        unsafe { self.destroy() };
    }
}
