//! Buffer bindings: which buffer ranges a compute program reads and writes.

use ash::vk;

use crate::buffer::Buffer;
use crate::device::DeviceContext;
use crate::driver::LayoutBinding;
use crate::error::{Result, VulkanError};

/// Length sentinel: bind from the offset to the end of the buffer.
pub const WHOLE_SIZE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Storage,
    Uniform,
}

impl BindingKind {
    pub(crate) fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::Storage => vk::DescriptorType::STORAGE_BUFFER,
            BindingKind::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// One `(set, slot) -> buffer range` entry.
#[derive(Clone, Copy)]
pub struct Binding<'a> {
    pub set: u32,
    pub slot: u32,
    pub kind: BindingKind,
    pub buffer: &'a Buffer<'a>,
    pub offset: u64,
    /// Resolved byte length once pushed into a [`BindingSet`]; may be
    /// [`WHOLE_SIZE`] before that.
    pub length: u64,
}

impl<'a> Binding<'a> {
    pub fn storage(slot: u32, buffer: &'a Buffer<'a>) -> Self {
        Self::new(BindingKind::Storage, slot, buffer)
    }

    pub fn uniform(slot: u32, buffer: &'a Buffer<'a>) -> Self {
        Self::new(BindingKind::Uniform, slot, buffer)
    }

    fn new(kind: BindingKind, slot: u32, buffer: &'a Buffer<'a>) -> Self {
        Self {
            set: 0,
            slot,
            kind,
            buffer,
            offset: 0,
            length: WHOLE_SIZE,
        }
    }

    /// Place the binding in descriptor set `set` (default 0).
    pub fn in_set(mut self, set: u32) -> Self {
        self.set = set;
        self
    }

    /// Bind `[offset, offset + length)` instead of the whole buffer.
    pub fn range(mut self, offset: u64, length: u64) -> Self {
        self.offset = offset;
        self.length = length;
        self
    }
}

impl std::fmt::Debug for Binding<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("set", &self.set)
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .field("buffer_size", &self.buffer.size())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// Insertion-ordered list of validated bindings.
///
/// A [`ComputeProgram`](crate::ComputeProgram) copies the list when it is
/// built, so later changes do not affect existing programs.
#[derive(Clone, Debug, Default)]
pub struct BindingSet<'a> {
    entries: Vec<Binding<'a>>,
}

impl<'a> BindingSet<'a> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Storage bindings for `buffers` at slots `0..n` of set 0.
    pub fn storage_buffers(buffers: &[&'a Buffer<'a>]) -> Result<Self> {
        let mut set = Self::new();
        for (slot, buffer) in buffers.iter().enumerate() {
            set.push(Binding::storage(slot as u32, buffer))?;
        }
        Ok(set)
    }

    /// Validate and append a binding, resolving a [`WHOLE_SIZE`] length.
    pub fn push(&mut self, mut binding: Binding<'a>) -> Result<&mut Self> {
        let buffer = binding.buffer;
        if !buffer.is_valid() {
            return Err(VulkanError::invalid("cannot bind a torn-down buffer"));
        }
        let ctx = buffer.context();
        if let Some(first) = self.entries.first() {
            if !std::ptr::eq(first.buffer.context(), ctx) {
                return Err(VulkanError::invalid("bindings span different device contexts"));
            }
        }
        let limits = ctx.limits();

        if binding.set >= limits.max_bound_descriptor_sets {
            return Err(VulkanError::LimitExceeded {
                what: "descriptor set index",
                value: u64::from(binding.set),
                limit: u64::from(limits.max_bound_descriptor_sets).saturating_sub(1),
            });
        }
        if self
            .entries
            .iter()
            .any(|e| e.set == binding.set && e.slot == binding.slot)
        {
            return Err(VulkanError::invalid(format!(
                "binding (set {}, slot {}) declared twice",
                binding.set, binding.slot
            )));
        }

        let (alignment, max_range, what) = match binding.kind {
            BindingKind::Storage => (
                limits.min_storage_buffer_offset_alignment,
                limits.max_storage_buffer_range,
                "storage binding range",
            ),
            BindingKind::Uniform => (
                limits.min_uniform_buffer_offset_alignment,
                limits.max_uniform_buffer_range,
                "uniform binding range",
            ),
        };
        if binding.offset % alignment != 0 {
            return Err(VulkanError::Misaligned {
                what: "binding offset",
                value: binding.offset,
                alignment,
            });
        }
        if binding.length == WHOLE_SIZE {
            if binding.offset >= buffer.size() {
                return Err(VulkanError::OutOfRange {
                    offset: binding.offset,
                    length: 0,
                    size: buffer.size(),
                });
            }
            binding.length = buffer.size() - binding.offset;
        }
        buffer.check_range(binding.offset, binding.length)?;
        if binding.length > max_range {
            return Err(VulkanError::LimitExceeded {
                what,
                value: binding.length,
                limit: max_range,
            });
        }

        self.entries.push(binding);
        Ok(self)
    }

    pub fn entries(&self) -> &[Binding<'a>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of descriptor sets the pipeline layout needs: highest set
    /// index plus one. Unused indices below it get empty layouts.
    pub fn set_count(&self) -> u32 {
        self.entries.iter().map(|e| e.set + 1).max().unwrap_or(0)
    }

    /// Layout bindings of descriptor set `set`, ordered by slot.
    pub(crate) fn layout_for(&self, set: u32) -> Vec<LayoutBinding> {
        let mut bindings: Vec<LayoutBinding> = self
            .entries
            .iter()
            .filter(|e| e.set == set)
            .map(|e| LayoutBinding {
                binding: e.slot,
                descriptor_type: e.kind.descriptor_type(),
            })
            .collect();
        bindings.sort_by_key(|b| b.binding);
        bindings
    }

    /// Descriptor counts per type, for sizing a pool.
    pub(crate) fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        [BindingKind::Storage, BindingKind::Uniform]
            .iter()
            .filter_map(|&kind| {
                let count = self.entries.iter().filter(|e| e.kind == kind).count() as u32;
                (count > 0).then(|| {
                    vk::DescriptorPoolSize::default()
                        .ty(kind.descriptor_type())
                        .descriptor_count(count)
                })
            })
            .collect()
    }

    pub(crate) fn context(&self) -> Option<&'a DeviceContext> {
        self.entries.first().map(|e| e.buffer.context())
    }
}
