//! `wgpu` backend.
//!
//! Buffers live in a slot map keyed by [`BufferHandle`]. Compute pipelines are
//! supplied by the host through [`SkinPipelines`]; each dispatch binds its
//! storage buffers in order on group 0 followed by an optional uniform
//! parameter block.
//!
//! Fence completion is reported by `Queue::on_submitted_work_done`, which
//! runs during device polling. Waiting on a fence blocks on the submission
//! index recorded for it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use wgpu::util::DeviceExt;

use super::{
    BufferDesc, BufferHandle, ComputeDispatch, DeviceCapabilities, FenceId, SkinCommand,
    SkinCommandList, SkinDevice, SkinKernel,
};
use crate::errors::{Result, SkinError};

/// Compute pipelines for every [`SkinKernel`] the pipeline may dispatch.
#[derive(Default)]
pub struct SkinPipelines {
    pipelines: FxHashMap<SkinKernel, wgpu::ComputePipeline>,
}

impl SkinPipelines {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kernel: SkinKernel, pipeline: wgpu::ComputePipeline) {
        self.pipelines.insert(kernel, pipeline);
    }

    #[must_use]
    pub fn get(&self, kernel: SkinKernel) -> Option<&wgpu::ComputePipeline> {
        self.pipelines.get(&kernel)
    }

    #[must_use]
    pub fn contains(&self, kernel: SkinKernel) -> bool {
        self.pipelines.contains_key(&kernel)
    }
}

/// [`SkinDevice`] backed by a `wgpu` device and queue.
pub struct WgpuSkinDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: SkinPipelines,
    buffers: Mutex<SlotMap<BufferHandle, wgpu::Buffer>>,
    last_submitted: AtomicU64,
    signaled_through: Arc<AtomicU64>,
    /// Submission index of every fence not yet known to be signaled.
    submissions: Mutex<VecDeque<(FenceId, wgpu::SubmissionIndex)>>,
    capabilities: DeviceCapabilities,
}

impl WgpuSkinDevice {
    /// Wraps an existing device.
    ///
    /// `compute_shaders` should come from the adapter's downlevel flags
    /// (`wgpu::DownlevelFlags::COMPUTE_SHADERS`).
    #[must_use]
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        pipelines: SkinPipelines,
        compute_shaders: bool,
    ) -> Self {
        let capabilities = DeviceCapabilities {
            compute_shaders,
            max_storage_buffer_binding_size: device.limits().max_storage_buffer_binding_size as u64,
        };
        log::info!(
            "Skinning device ready (compute: {}, max storage binding: {} bytes)",
            capabilities.compute_shaders,
            capabilities.max_storage_buffer_binding_size
        );

        Self {
            device,
            queue,
            pipelines,
            buffers: Mutex::new(SlotMap::with_key()),
            last_submitted: AtomicU64::new(0),
            signaled_through: Arc::new(AtomicU64::new(0)),
            submissions: Mutex::new(VecDeque::new()),
            capabilities,
        }
    }

    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Runs `f` with the `wgpu` buffer behind `handle`, e.g. to bind it for drawing.
    pub fn with_buffer<R>(&self, handle: BufferHandle, f: impl FnOnce(&wgpu::Buffer) -> R) -> Option<R> {
        self.buffers.lock().get(handle).map(f)
    }

    fn encode_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SlotMap<BufferHandle, wgpu::Buffer>,
        dispatch: &ComputeDispatch,
    ) -> Result<()> {
        let pipeline = self
            .pipelines
            .get(dispatch.kernel)
            .ok_or_else(|| SkinError::MissingPipeline(dispatch.kernel.label().to_string()))?;

        let params = (!dispatch.params.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Skin Dispatch Params"),
                contents: &dispatch.params,
                usage: wgpu::BufferUsages::UNIFORM,
            })
        });

        let mut entries = Vec::with_capacity(dispatch.bindings.len() + 1);
        for (binding, handle) in dispatch.bindings.iter().enumerate() {
            let buffer = buffers
                .get(*handle)
                .ok_or_else(|| SkinError::InvalidHandle(format!("{handle:?}")))?;
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        if let Some(params) = &params {
            entries.push(wgpu::BindGroupEntry {
                binding: dispatch.bindings.len() as u32,
                resource: params.as_entire_binding(),
            });
        }

        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(dispatch.kernel.label()),
            layout: &layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(dispatch.kernel.label()),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let [x, y, z] = dispatch.workgroups;
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }
}

impl SkinDevice for WgpuSkinDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size > self.capabilities.max_storage_buffer_binding_size {
            return Err(SkinError::exhausted(
                desc.label,
                desc.size,
                "exceeds max storage buffer binding size",
            ));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage: desc.usage.to_wgpu(),
            mapped_at_creation: false,
        });
        Ok(self.buffers.lock().insert(buffer))
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        let removed = self.buffers.lock().remove(handle);
        assert!(removed.is_some(), "buffer {handle:?} destroyed twice");
        if let Some(buffer) = removed {
            buffer.destroy();
        }
    }

    fn next_fence(&self) -> FenceId {
        FenceId(self.last_submitted.load(Ordering::Acquire) + 1)
    }

    fn submit(&self, commands: SkinCommandList) -> Result<FenceId> {
        let buffers = self.buffers.lock();
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Skinning Encoder"),
        });

        for cmd in commands.into_commands() {
            match cmd {
                // Queue writes land before the command buffers of this submission.
                SkinCommand::WriteBuffer { buffer, offset, data } => {
                    let target = buffers
                        .get(buffer)
                        .ok_or_else(|| SkinError::InvalidHandle(format!("{buffer:?}")))?;
                    self.queue.write_buffer(target, offset, &data);
                }
                SkinCommand::ClearBuffer { buffer } => {
                    let target = buffers
                        .get(buffer)
                        .ok_or_else(|| SkinError::InvalidHandle(format!("{buffer:?}")))?;
                    encoder.clear_buffer(target, 0, None);
                }
                SkinCommand::Dispatch(dispatch) => {
                    self.encode_dispatch(&mut encoder, &buffers, &dispatch)?;
                }
                // wgpu tracks buffer usage transitions itself.
                SkinCommand::Transition { .. } => {}
            }
        }
        drop(buffers);

        let mut submissions = self.submissions.lock();
        let index = self.queue.submit(std::iter::once(encoder.finish()));
        let fence = FenceId(self.last_submitted.fetch_add(1, Ordering::AcqRel) + 1);
        let signaled_through = self.signaled_through.load(Ordering::Acquire);
        while submissions.front().is_some_and(|(f, _)| f.0 <= signaled_through) {
            submissions.pop_front();
        }
        submissions.push_back((fence, index));
        drop(submissions);

        let signaled = Arc::clone(&self.signaled_through);
        self.queue.on_submitted_work_done(move || {
            signaled.fetch_max(fence.0, Ordering::AcqRel);
        });
        Ok(fence)
    }

    fn is_fence_signaled(&self, fence: FenceId) -> bool {
        if fence.0 <= self.signaled_through.load(Ordering::Acquire) {
            return true;
        }
        let _ = self.device.poll(wgpu::PollType::Poll);
        fence.0 <= self.signaled_through.load(Ordering::Acquire)
    }

    fn wait_fence(&self, fence: FenceId) {
        if fence.0 > self.last_submitted.load(Ordering::Acquire) {
            log::error!("Waiting on fence {} that was never submitted", fence.0);
            return;
        }
        if fence.0 <= self.signaled_through.load(Ordering::Acquire) {
            return;
        }
        let submission_index = self
            .submissions
            .lock()
            .iter()
            .find(|(f, _)| *f == fence)
            .map(|(_, index)| index.clone());
        let Some(submission_index) = submission_index else {
            return;
        };

        if let Err(err) = self.device.poll(wgpu::PollType::Wait {
            submission_index: Some(submission_index),
            timeout: None,
        }) {
            log::error!("Failed to wait for fence {}: {err:?}", fence.0);
            return;
        }
        // Completion callbacks run inside the blocking poll.
        if fence.0 > self.signaled_through.load(Ordering::Acquire) {
            log::warn!("Fence {} not reported signaled after a blocking wait", fence.0);
        }
    }
}
