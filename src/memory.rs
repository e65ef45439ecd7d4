//! Host-access modes, non-coherent atom alignment, and memory-type fallback.

use ash::vk;

use crate::device::DeviceContext;
use crate::error::{Result, VulkanError};

/// Which host-side directions a buffer supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostAccess {
    /// Device-local, never mapped.
    #[default]
    None,
    Write,
    Read,
    ReadWrite,
}

impl HostAccess {
    pub fn can_write(self) -> bool {
        matches!(self, HostAccess::Write | HostAccess::ReadWrite)
    }

    pub fn can_read(self) -> bool {
        matches!(self, HostAccess::Read | HostAccess::ReadWrite)
    }

    pub fn is_host_visible(self) -> bool {
        self != HostAccess::None
    }

    pub fn name(self) -> &'static str {
        match self {
            HostAccess::None => "None",
            HostAccess::Write => "Write",
            HostAccess::Read => "Read",
            HostAccess::ReadWrite => "ReadWrite",
        }
    }
}

/// A byte range widened to non-coherent atom boundaries.
///
/// `offset` is rounded down and the end rounded up to a multiple of the atom
/// size, then the length is clamped so the range never passes the end of the
/// buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlignedRange {
    pub offset: u64,
    pub length: u64,
}

impl AlignedRange {
    /// Caller guarantees `atom > 0` and `offset + length <= buffer_size`.
    pub fn new(offset: u64, length: u64, atom: u64, buffer_size: u64) -> Self {
        let aligned_offset = offset / atom * atom;
        let widened = (length + (offset - aligned_offset)).div_ceil(atom) * atom;
        Self {
            offset: aligned_offset,
            length: widened.min(buffer_size - aligned_offset),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Whether `[offset, offset + length)` lies inside this range.
    pub fn contains(&self, offset: u64, length: u64) -> bool {
        self.offset <= offset && offset + length <= self.end()
    }

    /// The length was cut short by the end of the buffer.
    pub fn is_clamped(&self, atom: u64) -> bool {
        self.length % atom != 0
    }

    /// Size to pass to map/flush/invalidate calls.
    ///
    /// A clamped tail is not atom-sized, and the allocation may extend past
    /// the buffer, so the tail is addressed as "to the end of the mapping".
    pub(crate) fn vk_size(&self, atom: u64) -> u64 {
        if self.is_clamped(atom) {
            vk::WHOLE_SIZE
        } else {
            self.length
        }
    }
}

/// Memory property tiers tried in order for a buffer with `access`.
pub(crate) fn memory_tiers(access: HostAccess, prefer_coherent: bool) -> Vec<vk::MemoryPropertyFlags> {
    use vk::MemoryPropertyFlags as F;
    match access {
        HostAccess::None => vec![F::DEVICE_LOCAL, F::empty()],
        _ if prefer_coherent => vec![
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_CACHED,
            F::HOST_VISIBLE,
        ],
        _ => vec![
            F::HOST_VISIBLE | F::HOST_CACHED,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE,
        ],
    }
}

/// Allocate backing memory, walking `tiers` until a memory type exists and
/// its allocation succeeds.
///
/// Returns the memory and the property flags of the type actually used.
pub(crate) fn allocate_with_fallback(
    ctx: &DeviceContext,
    requirements: &vk::MemoryRequirements,
    tiers: &[vk::MemoryPropertyFlags],
) -> Result<(vk::DeviceMemory, vk::MemoryPropertyFlags)> {
    let mut last_error = VulkanError::NoMemoryType;
    for (attempt, &required) in tiers.iter().enumerate() {
        let Some(index) = ctx.find_memory_type(requirements.memory_type_bits, required) else {
            tracing::debug!(?required, "no memory type for tier");
            continue;
        };
        match unsafe { ctx.driver().allocate_memory(requirements.size, index) } {
            Ok(memory) => {
                let flags = ctx.memory_types()[index as usize].flags;
                if attempt > 0 {
                    tracing::warn!(
                        requested = ?tiers[0],
                        using = ?flags,
                        "memory type fallback"
                    );
                }
                return Ok((memory, flags));
            }
            Err(e) => {
                tracing::warn!(?required, error = ?e, "allocation failed, trying next memory tier");
                last_error = VulkanError::vk("vkAllocateMemory")(e);
            }
        }
    }
    Err(last_error)
}
