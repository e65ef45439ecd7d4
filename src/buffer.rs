//! Device buffers: one buffer object plus its dedicated memory allocation,
//! aligned host mapping, and GPU-side copy/fill.

use std::cell::Cell;

use ash::vk;
use bytemuck::Pod;

use crate::device::{DeviceContext, PendingTransfer};
use crate::driver::{Barrier, Command};
use crate::error::{Result, VulkanError};
use crate::memory::{allocate_with_fallback, memory_tiers, AlignedRange, HostAccess};

/// Creation options for [`Buffer::with_options`].
#[derive(Clone, Copy, Debug)]
pub struct BufferOptions {
    pub access: HostAccess,
    /// Try coherent memory before cached memory. Readback-heavy buffers can
    /// turn this off to prefer cached memory.
    pub prefer_coherent: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            access: HostAccess::ReadWrite,
            prefer_coherent: true,
        }
    }
}

impl BufferOptions {
    pub fn new(access: HostAccess) -> Self {
        Self {
            access,
            ..Self::default()
        }
    }

    pub fn prefer_coherent(mut self, prefer: bool) -> Self {
        self.prefer_coherent = prefer;
        self
    }
}

/// A storage/uniform buffer with its own memory allocation.
pub struct Buffer<'a> {
    ctx: &'a DeviceContext,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    access: HostAccess,
    memory_flags: vk::MemoryPropertyFlags,
    mapped: Cell<bool>,
    torn_down: bool,
}

impl<'a> Buffer<'a> {
    pub fn new(ctx: &'a DeviceContext, size: u64, access: HostAccess) -> Result<Self> {
        Self::with_options(ctx, size, BufferOptions::new(access))
    }

    pub fn with_options(ctx: &'a DeviceContext, size: u64, options: BufferOptions) -> Result<Self> {
        ctx.ensure_valid()?;
        if size == 0 {
            return Err(VulkanError::invalid("buffer size must be greater than zero"));
        }
        let d = ctx.driver();
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;

        let buffer = unsafe { d.create_buffer(size, usage) }
            .map_err(VulkanError::vk("vkCreateBuffer"))?;
        let requirements = unsafe { d.memory_requirements(buffer) };
        let tiers = memory_tiers(options.access, options.prefer_coherent);
        let (memory, memory_flags) = match allocate_with_fallback(ctx, &requirements, &tiers) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { d.destroy_buffer(buffer) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { d.bind_buffer_memory(buffer, memory) } {
            unsafe {
                d.free_memory(memory);
                d.destroy_buffer(buffer);
            }
            return Err(VulkanError::vk("vkBindBufferMemory")(e));
        }

        tracing::debug!(
            size,
            access = options.access.name(),
            flags = ?memory_flags,
            "created buffer"
        );
        Ok(Self {
            ctx,
            buffer,
            memory,
            size,
            access: options.access,
            memory_flags,
            mapped: Cell::new(false),
            torn_down: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn access(&self) -> HostAccess {
        self.access
    }

    /// Property flags of the memory type actually bound, after fallback.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Host writes and device writes are visible without flush/invalidate.
    pub fn is_coherent(&self) -> bool {
        self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    pub fn is_valid(&self) -> bool {
        !self.torn_down
    }

    pub(crate) fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub(crate) fn context(&self) -> &'a DeviceContext {
        self.ctx
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.torn_down {
            return Err(VulkanError::invalid("buffer has been torn down"));
        }
        self.ctx.ensure_valid()
    }

    /// Reject empty or out-of-bounds ranges before touching the device.
    pub(crate) fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Err(VulkanError::invalid("range length must be greater than zero"));
        }
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VulkanError::OutOfRange {
                offset,
                length,
                size: self.size,
            }),
        }
    }

    /// Map `[offset, offset + length)` for writing. The written bytes are
    /// flushed to the device when the mapping is dropped or finished.
    pub fn map_write(&self, offset: u64, length: u64) -> Result<BufferMapping<'_>> {
        if !self.access.can_write() {
            return Err(VulkanError::AccessMode {
                requested: "Write",
                available: self.access.name(),
            });
        }
        self.map(offset, length, true)
    }

    /// Map `[offset, offset + length)` for reading. Device writes are made
    /// visible before the mapping is returned.
    pub fn map_read(&self, offset: u64, length: u64) -> Result<BufferMapping<'_>> {
        if !self.access.can_read() {
            return Err(VulkanError::AccessMode {
                requested: "Read",
                available: self.access.name(),
            });
        }
        self.map(offset, length, false)
    }

    fn map(&self, offset: u64, length: u64, write: bool) -> Result<BufferMapping<'_>> {
        self.ensure_valid()?;
        self.check_range(offset, length)?;
        if self.mapped.get() {
            return Err(VulkanError::invalid("buffer is already mapped"));
        }

        let atom = self.ctx.limits().non_coherent_atom_size;
        let aligned = AlignedRange::new(offset, length, atom, self.size);
        let d = self.ctx.driver();
        let base = unsafe { d.map_memory(self.memory, aligned.offset, aligned.vk_size(atom)) }
            .map_err(VulkanError::vk("vkMapMemory"))?;

        if !write && !self.is_coherent() {
            if let Err(e) =
                unsafe { d.invalidate_range(self.memory, aligned.offset, aligned.vk_size(atom)) }
            {
                unsafe { d.unmap_memory(self.memory) };
                return Err(VulkanError::vk("vkInvalidateMappedMemoryRanges")(e));
            }
        }

        self.mapped.set(true);
        Ok(BufferMapping {
            buffer: self,
            ptr: unsafe { base.add((offset - aligned.offset) as usize) },
            length: length as usize,
            aligned,
            write,
            finished: false,
        })
    }

    /// Copy `bytes` into the buffer at `offset`.
    ///
    /// Host-visible buffers go through a write mapping; device-local buffers
    /// through a temporary staging buffer and a GPU copy.
    pub fn upload(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_valid()?;
        let length = bytes.len() as u64;
        self.check_range(offset, length)?;
        if self.access.is_host_visible() {
            let mut mapping = self.map_write(offset, length)?;
            mapping.data_mut().copy_from_slice(bytes);
            return mapping.finish();
        }

        let staging = Buffer::new(self.ctx, length, HostAccess::Write)?;
        staging.upload(0, bytes)?;
        staging.copy_to(self, 0, offset, length)
    }

    /// Read `out.len()` bytes starting at `offset`.
    pub fn download(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.ensure_valid()?;
        let length = out.len() as u64;
        self.check_range(offset, length)?;
        if self.access.is_host_visible() {
            let mapping = self.map_read(offset, length)?;
            out.copy_from_slice(mapping.data());
            return mapping.finish();
        }

        let staging = Buffer::with_options(
            self.ctx,
            length,
            BufferOptions::new(HostAccess::Read).prefer_coherent(false),
        )?;
        self.copy_to(&staging, offset, 0, length)?;
        staging.download(0, out)
    }

    /// Write a slice of plain-old-data values at byte `offset`.
    pub fn write_slice<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.upload(offset, bytemuck::cast_slice(data))
    }

    /// Read `count` plain-old-data values starting at byte `offset`.
    pub fn read_vec<T: Pod>(&self, offset: u64, count: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.download(offset, bytemuck::cast_slice_mut(out.as_mut_slice()))?;
        Ok(out)
    }

    fn copy_commands(&self, dst: &Buffer<'_>, src_offset: u64, dst_offset: u64, length: u64) -> Result<[Command; 2]> {
        self.ensure_valid()?;
        dst.ensure_valid()?;
        if !std::ptr::eq(self.ctx, dst.ctx) {
            return Err(VulkanError::invalid("copy between buffers of different device contexts"));
        }
        self.check_range(src_offset, length)?;
        dst.check_range(dst_offset, length)?;
        if self.buffer == dst.buffer
            && src_offset < dst_offset + length
            && dst_offset < src_offset + length
        {
            return Err(VulkanError::invalid("copy source and destination overlap"));
        }
        Ok([
            Command::CopyBuffer {
                src: self.buffer,
                dst: dst.buffer,
                src_offset,
                dst_offset,
                size: length,
            },
            Command::Barrier(Barrier::TransferToHost),
        ])
    }

    /// GPU copy of `length` bytes into `dst`, blocking up to the context's
    /// transfer timeout.
    pub fn copy_to(&self, dst: &Buffer<'_>, src_offset: u64, dst_offset: u64, length: u64) -> Result<()> {
        self.copy_to_with_timeout(dst, src_offset, dst_offset, length, self.ctx.transfer_timeout_ns())
    }

    pub fn copy_to_with_timeout(
        &self,
        dst: &Buffer<'_>,
        src_offset: u64,
        dst_offset: u64,
        length: u64,
        timeout_ns: u64,
    ) -> Result<()> {
        let commands = self.copy_commands(dst, src_offset, dst_offset, length)?;
        self.ctx.run_transient(&commands, timeout_ns)
    }

    /// Submit a GPU copy and return without waiting.
    pub fn copy_to_async<'s>(
        &'s self,
        dst: &'s Buffer<'_>,
        src_offset: u64,
        dst_offset: u64,
        length: u64,
    ) -> Result<PendingTransfer<'s>> {
        let commands = self.copy_commands(dst, src_offset, dst_offset, length)?;
        self.ctx.submit_transient(&commands)
    }

    /// Fill `[offset, offset + length)` with a repeated 32-bit word on the GPU.
    ///
    /// `offset` must be 4-byte aligned. `length` must be a multiple of 4
    /// unless the range ends at the end of the buffer, in which case the
    /// trailing `size % 4` bytes are left untouched.
    pub fn fill(&self, word: u32, offset: u64, length: u64) -> Result<()> {
        self.ensure_valid()?;
        self.check_range(offset, length)?;
        if offset % 4 != 0 {
            return Err(VulkanError::Misaligned {
                what: "fill offset",
                value: offset,
                alignment: 4,
            });
        }
        let reaches_end = offset + length == self.size;
        if length % 4 != 0 && !reaches_end {
            return Err(VulkanError::Misaligned {
                what: "fill length",
                value: length,
                alignment: 4,
            });
        }
        if reaches_end && length < 4 {
            return Err(VulkanError::invalid("fill range holds no whole 32-bit word"));
        }
        let size = if reaches_end { vk::WHOLE_SIZE } else { length };
        let commands = [
            Command::FillBuffer {
                buffer: self.buffer,
                offset,
                size,
                word,
            },
            Command::Barrier(Barrier::TransferToHost),
        ];
        self.ctx.run_transient(&commands, self.ctx.transfer_timeout_ns())
    }

    /// Zero the whole buffer.
    pub fn clear(&self) -> Result<()> {
        self.fill(0, 0, self.size)
    }

    /// Destroy the buffer and free its memory. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if !self.ctx.is_valid() {
            tracing::error!("buffer outlived its device context");
            return;
        }
        self.ctx.release_buffer(self.buffer);
        let d = self.ctx.driver();
        unsafe {
            d.destroy_buffer(self.buffer);
            d.free_memory(self.memory);
        }
        tracing::debug!(size = self.size, "buffer torn down");
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One active host view into a [`Buffer`].
///
/// The underlying mapping covers an atom-aligned superset of the requested
/// range. Dropping a write mapping flushes that superset when the memory is
/// not coherent; [`finish`](Self::finish) does the same and reports errors.
pub struct BufferMapping<'b> {
    buffer: &'b Buffer<'b>,
    ptr: *mut u8,
    length: usize,
    aligned: AlignedRange,
    write: bool,
    finished: bool,
}

impl<'b> BufferMapping<'b> {
    /// The requested bytes.
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.length) }
    }

    /// The requested bytes, writable. Writes through a read mapping are not
    /// flushed.
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.length) }
    }

    /// The atom-aligned range actually mapped.
    pub fn aligned_range(&self) -> AlignedRange {
        self.aligned
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Flush (for write mappings on non-coherent memory) and unmap.
    pub fn finish(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let buffer = self.buffer;
        let d = buffer.ctx.driver();
        let atom = buffer.ctx.limits().non_coherent_atom_size;

        let flushed = if self.write && !buffer.is_coherent() {
            unsafe { d.flush_range(buffer.memory, self.aligned.offset, self.aligned.vk_size(atom)) }
                .map_err(VulkanError::vk("vkFlushMappedMemoryRanges"))
        } else {
            Ok(())
        };
        unsafe { d.unmap_memory(buffer.memory) };
        buffer.mapped.set(false);
        flushed
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!(error = %e, "flush on unmap failed");
        }
    }
}
