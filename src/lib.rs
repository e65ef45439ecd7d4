//! Vulkan compute runtime.
//!
//! [`DeviceContext`] owns the logical device and compute queue. [`Buffer`]
//! owns one allocation and hands out atom-aligned [`BufferMapping`]s that
//! flush or invalidate as the memory type requires. A [`ComputeProgram`]
//! assembles the shader, descriptor, pipeline and command objects for a
//! kernel over a [`BindingSet`], and its dispatches insert the host/device
//! barriers needed for safe readback.
//!
//! ```no_run
//! use vk_compute::{
//!     BindingSet, Buffer, ComputeProgram, ContextConfig, DeviceContext, HostAccess,
//!     ProgramConfig, ShaderCode,
//! };
//!
//! # fn main() -> vk_compute::Result<()> {
//! let ctx = DeviceContext::new(&ContextConfig::from_env()?)?;
//! let data = Buffer::new(&ctx, 1024 * 4, HostAccess::ReadWrite)?;
//! data.write_slice(0, &vec![1u32; 1024])?;
//!
//! let shader = ShaderCode::from_path("double.spv")?;
//! let bindings = BindingSet::storage_buffers(&[&data])?;
//! let mut program =
//!     ComputeProgram::new(&ctx, &shader, &bindings, ProgramConfig::new().local_size(64, 1, 1))?;
//! program.set_workgroups(1024 / 64, 1, 1)?;
//! program.run()?;
//!
//! let out: Vec<u32> = data.read_vec(0, 1024)?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod memory;
pub mod program;
pub mod spirv;

pub use binding::{Binding, BindingKind, BindingSet, WHOLE_SIZE};
pub use buffer::{Buffer, BufferMapping, BufferOptions};
pub use config::ContextConfig;
pub use device::{vendor_name, DeviceContext, DeviceInfo, DeviceLimits, PendingTransfer};
pub use dispatch::{timestamp_delta_ns, DispatchOptions, DispatchState, PendingDispatch};
pub use error::{vk_result_name, ErrorKind, Result, VulkanError};
pub use memory::{AlignedRange, HostAccess};
pub use program::{ComputeProgram, ProgramConfig, Stage};
pub use spirv::{ShaderCode, SPIRV_MAGIC};
