//! Per-frame context.
//!
//! A [`FrameContext`] is created once per rendered frame on the render
//! thread and threaded by reference through everything that records GPU
//! work. It carries:
//!
//! - the device,
//! - the frame number,
//! - the command list for the frame's single submission,
//! - the fence that submission will signal (reserved up front, so resources
//!   released during the frame can be fence-gated before submit),
//! - buffers to destroy once that fence signals.
//!
//! ```text
//! begin_frame ──► record (writes, dispatches, barriers) ──► submit ──► FenceId
//!      │                                                         ▲
//!      └─────────── frame_fence() == returned FenceId ───────────┘
//! ```

use bytemuck::Pod;

use crate::device::{
    BufferHandle, FenceId, ResourceAccess, SkinCommandList, SkinDevice, SkinKernel,
};
use crate::errors::Result;

pub struct FrameContext<'a> {
    device: &'a dyn SkinDevice,
    frame_number: u64,
    fence: FenceId,
    commands: SkinCommandList,
    destroy_after_frame: Vec<BufferHandle>,
    submitted: bool,
}

/// What a submitted frame leaves behind.
#[derive(Debug)]
pub struct SubmittedFrame {
    pub fence: FenceId,
    pub destroy_after_fence: Vec<BufferHandle>,
}

impl<'a> FrameContext<'a> {
    /// Starts recording a frame. Only one context may be open per device.
    pub fn new(device: &'a dyn SkinDevice, frame_number: u64) -> Self {
        Self {
            device,
            frame_number,
            fence: device.next_fence(),
            commands: SkinCommandList::new(),
            destroy_after_frame: Vec::new(),
            submitted: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &'a dyn SkinDevice {
        self.device
    }

    #[inline]
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// The fence this frame's submission will signal.
    #[inline]
    #[must_use]
    pub fn frame_fence(&self) -> FenceId {
        self.fence
    }

    #[must_use]
    pub fn commands(&self) -> &SkinCommandList {
        &self.commands
    }

    pub fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.commands.write_buffer(buffer, offset, data);
    }

    pub fn write_pod<T: Pod>(&mut self, buffer: BufferHandle, data: &[T]) {
        self.commands.write_buffer(buffer, 0, bytemuck::cast_slice(data));
    }

    pub fn clear_buffer(&mut self, buffer: BufferHandle) {
        self.commands.clear_buffer(buffer);
    }

    pub fn dispatch<P: Pod>(
        &mut self,
        kernel: SkinKernel,
        bindings: &[BufferHandle],
        params: &P,
        workgroups: [u32; 3],
    ) {
        self.commands.dispatch(kernel, bindings, params, workgroups);
    }

    pub fn transition(&mut self, buffers: &[BufferHandle], access: ResourceAccess) {
        self.commands.transition(buffers, access);
    }

    /// Destroys `buffer` once this frame's fence signals.
    pub fn destroy_after_frame(&mut self, buffer: BufferHandle) {
        self.destroy_after_frame.push(buffer);
    }

    /// Submits the frame's commands.
    ///
    /// # Panics
    ///
    /// Panics if another submission happened on the device while this frame
    /// was open, since every fence handed out by the frame would be wrong.
    pub fn submit(mut self) -> Result<SubmittedFrame> {
        self.submitted = true;
        let commands = std::mem::take(&mut self.commands);
        let fence = self.device.submit(commands)?;
        assert_eq!(
            fence, self.fence,
            "frame {} submitted out of order (expected fence {}, got {})",
            self.frame_number,
            self.fence.value(),
            fence.value()
        );
        Ok(SubmittedFrame {
            fence,
            destroy_after_fence: std::mem::take(&mut self.destroy_after_frame),
        })
    }
}

impl Drop for FrameContext<'_> {
    fn drop(&mut self) {
        if !self.submitted && (!self.commands.is_empty() || !self.destroy_after_frame.is_empty()) {
            log::error!(
                "Frame {} dropped without submitting {} commands",
                self.frame_number,
                self.commands.len()
            );
        }
    }
}
