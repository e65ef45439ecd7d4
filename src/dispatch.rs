//! Dispatch protocol: record, submit, wait, and read back timing.
//!
//! Every dispatch re-records the program's command buffer:
//!
//! ```text
//! [reset queries]  bind pipeline, bind sets, push constants
//! host -> shader barrier
//! [timestamp 0]  dispatch  [timestamp 1]
//! [shader -> host barrier]
//! ```
//!
//! The bracketed steps depend on [`DispatchOptions`]. The fence is reset and
//! reused each time, so one program has at most one dispatch in flight.

use ash::vk;

use crate::driver::{Barrier, Command};
use crate::error::{Result, VulkanError};
use crate::program::ComputeProgram;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchState {
    #[default]
    Idle,
    Recording,
    Submitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Make shader writes visible to host reads once the dispatch finishes.
    /// Turn off when the next consumer is another dispatch that inserts its
    /// own barrier.
    pub host_barrier: bool,
    /// Bracket the dispatch with timestamps. The program must have been
    /// built with timing enabled.
    pub timing: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            host_barrier: true,
            timing: false,
        }
    }
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_barrier(mut self, enabled: bool) -> Self {
        self.host_barrier = enabled;
        self
    }

    pub fn timing(mut self, enabled: bool) -> Self {
        self.timing = enabled;
        self
    }
}

/// Inputs to one recording.
#[derive(Clone, Debug)]
pub(crate) struct DispatchPlan<'r> {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub sets: &'r [vk::DescriptorSet],
    pub push_offset: u32,
    pub push_constants: &'r [u8],
    pub groups: [u32; 3],
    /// Set only for timed dispatches.
    pub query_pool: Option<vk::QueryPool>,
    pub host_barrier: bool,
}

pub(crate) fn record_commands(plan: &DispatchPlan<'_>) -> Vec<Command> {
    let mut commands = Vec::with_capacity(9);
    if let Some(pool) = plan.query_pool {
        commands.push(Command::ResetQueries { pool, first: 0, count: 2 });
    }
    commands.push(Command::BindPipeline(plan.pipeline));
    if !plan.sets.is_empty() {
        commands.push(Command::BindDescriptorSets {
            layout: plan.layout,
            sets: plan.sets.to_vec(),
        });
    }
    if !plan.push_constants.is_empty() {
        commands.push(Command::PushConstants {
            layout: plan.layout,
            offset: plan.push_offset,
            bytes: plan.push_constants.to_vec(),
        });
    }
    // Unconditional: the caller may have just released a write mapping.
    commands.push(Command::Barrier(Barrier::HostToDevice));
    if let Some(pool) = plan.query_pool {
        commands.push(Command::WriteTimestamp {
            pool,
            query: 0,
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        });
    }
    let [x, y, z] = plan.groups;
    commands.push(Command::Dispatch { x, y, z });
    if let Some(pool) = plan.query_pool {
        commands.push(Command::WriteTimestamp {
            pool,
            query: 1,
            stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        });
    }
    if plan.host_barrier {
        commands.push(Command::Barrier(Barrier::DeviceToHost));
    }
    commands
}

/// Nanoseconds between two raw timestamps.
///
/// Only the low `valid_bits` of each value count, and the counter may wrap
/// between the two reads. A `valid_bits` of 0 or 64 uses the whole value.
pub fn timestamp_delta_ns(start: u64, end: u64, valid_bits: u32, period: f32) -> f64 {
    let mask = match valid_bits {
        1..=63 => (1u64 << valid_bits) - 1,
        _ => u64::MAX,
    };
    let ticks = (end & mask).wrapping_sub(start & mask) & mask;
    ticks as f64 * f64::from(period)
}

impl<'a> ComputeProgram<'a> {
    pub fn state(&self) -> DispatchState {
        self.state.get()
    }

    /// Dispatch with the host barrier and wait for completion.
    pub fn run(&self) -> Result<()> {
        self.run_with(DispatchOptions::default()).map(|_| ())
    }

    /// Dispatch with timestamps and return the elapsed device time in
    /// nanoseconds.
    pub fn run_timed(&self) -> Result<f64> {
        self.run_with(DispatchOptions::default().timing(true))?
            .ok_or(VulkanError::TimingUnavailable)
    }

    /// Dispatch, wait, and return the elapsed nanoseconds when `options`
    /// asks for timing.
    pub fn run_with(&self, options: DispatchOptions) -> Result<Option<f64>> {
        self.begin(options)?;
        if !self.wait_fence(u64::MAX)? {
            return Err(VulkanError::Timeout);
        }
        if !options.timing {
            return Ok(None);
        }
        match self.read_timing(true)? {
            Some(ns) => Ok(Some(ns)),
            None => Err(VulkanError::Vk {
                result: vk::Result::NOT_READY,
                context: "vkGetQueryPoolResults",
            }),
        }
    }

    /// Dispatch without waiting.
    pub fn submit(&self, options: DispatchOptions) -> Result<PendingDispatch<'_>> {
        self.begin(options)?;
        Ok(PendingDispatch {
            program: self,
            timed: options.timing,
            finished: false,
        })
    }

    fn begin(&self, options: DispatchOptions) -> Result<()> {
        self.ensure_valid()?;
        if options.timing && self.query_pool.is_none() {
            return Err(VulkanError::TimingUnavailable);
        }
        if self.state.get() != DispatchState::Idle {
            return Err(VulkanError::invalid("a dispatch of this program is already in flight"));
        }

        self.state.set(DispatchState::Recording);
        let plan = DispatchPlan {
            pipeline: self.pipeline,
            layout: self.pipeline_layout,
            sets: &self.descriptor_sets,
            push_offset: self.push_offset,
            push_constants: &self.push_constants,
            groups: self.workgroups,
            query_pool: self.query_pool.filter(|_| options.timing),
            host_barrier: options.host_barrier,
        };
        let commands = record_commands(&plan);
        let submitted = self.record_and_submit(&commands);
        self.state.set(if submitted.is_ok() {
            DispatchState::Submitted
        } else {
            DispatchState::Idle
        });
        if submitted.is_ok() {
            tracing::trace!(groups = ?self.workgroups, timed = options.timing, "dispatch submitted");
        }
        submitted
    }

    fn record_and_submit(&self, commands: &[Command]) -> Result<()> {
        let d = self.ctx.driver();
        unsafe {
            d.reset_fence(self.fence).map_err(VulkanError::vk("vkResetFences"))?;
            d.record(self.command_buffer, false, commands)
                .map_err(VulkanError::vk("vkEndCommandBuffer"))?;
            d.submit(self.command_buffer, self.fence)
                .map_err(VulkanError::vk("vkQueueSubmit"))
        }
    }

    /// `Ok(false)` while the dispatch is still running.
    fn wait_fence(&self, timeout_ns: u64) -> Result<bool> {
        if self.state.get() != DispatchState::Submitted {
            return Ok(true);
        }
        match unsafe { self.ctx.driver().wait_fence(self.fence, timeout_ns) } {
            Ok(true) => {
                self.state.set(DispatchState::Idle);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.state.set(DispatchState::Idle);
                Err(VulkanError::vk("vkWaitForFences")(e))
            }
        }
    }

    fn poll_fence(&self) -> Result<bool> {
        if self.state.get() != DispatchState::Submitted {
            return Ok(true);
        }
        let signaled = unsafe { self.ctx.driver().fence_signaled(self.fence) }
            .map_err(VulkanError::vk("vkGetFenceStatus"))?;
        if signaled {
            self.state.set(DispatchState::Idle);
        }
        Ok(signaled)
    }

    fn read_timing(&self, wait: bool) -> Result<Option<f64>> {
        let Some(pool) = self.query_pool else {
            return Err(VulkanError::TimingUnavailable);
        };
        let values = unsafe { self.ctx.driver().query_timestamps(pool, 2, wait) }
            .map_err(VulkanError::vk("vkGetQueryPoolResults"))?;
        let limits = self.ctx.limits();
        let (bits, period) = (limits.timestamp_valid_bits, limits.timestamp_period);
        Ok(values.and_then(|v| match v.as_slice() {
            [start, end] => Some(timestamp_delta_ns(*start, *end, bits, period)),
            _ => None,
        }))
    }
}

/// A submitted dispatch.
///
/// Dropping it without waiting blocks until the dispatch completes, since
/// the program's fence and command buffer are reused by the next dispatch.
#[must_use = "a pending dispatch must be waited on"]
pub struct PendingDispatch<'p> {
    program: &'p ComputeProgram<'p>,
    timed: bool,
    finished: bool,
}

impl PendingDispatch<'_> {
    /// Non-blocking completion check.
    pub fn is_complete(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        self.finished = self.program.poll_fence()?;
        Ok(self.finished)
    }

    /// Wait up to `timeout_ns`. `Ok(false)` means still running; the
    /// dispatch stays pending.
    pub fn wait_timeout(&mut self, timeout_ns: u64) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        let result = self.program.wait_fence(timeout_ns);
        // a failed wait leaves nothing to wait for on drop
        self.finished = !matches!(result, Ok(false));
        result
    }

    /// Block until the dispatch completes.
    pub fn wait(mut self) -> Result<()> {
        if self.wait_timeout(u64::MAX)? {
            Ok(())
        } else {
            Err(VulkanError::Timeout)
        }
    }

    /// Elapsed device time, or `None` until both timestamps are available.
    /// Never blocks.
    pub fn timing_ns(&self) -> Result<Option<f64>> {
        if !self.timed {
            return Err(VulkanError::TimingUnavailable);
        }
        self.program.read_timing(false)
    }
}

impl Drop for PendingDispatch<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.program.wait_fence(u64::MAX) {
            tracing::error!(error = %e, "unwaited dispatch failed");
        }
    }
}
