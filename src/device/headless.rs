//! Headless recording backend.
//!
//! Executes buffer writes and clears against CPU memory, records every
//! submission, and models fence completion either immediately or under
//! manual control. Destroying a buffer that an unsignaled submission still
//! references is treated as a use-after-free and panics.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::SlotMap;

use super::{
    BufferDesc, BufferHandle, DeviceCapabilities, FenceId, SkinCommand, SkinCommandList,
    SkinDevice,
};
use crate::errors::{Result, SkinError};

/// How submitted fences complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceMode {
    /// Every submission is signaled as soon as it is submitted.
    #[default]
    Immediate,
    /// Fences signal only through [`HeadlessDevice::signal_through`] or a wait.
    Manual,
}

struct HeadlessBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

struct InFlight {
    fence: FenceId,
    buffers: FxHashSet<BufferHandle>,
}

#[derive(Default)]
struct HeadlessState {
    buffers: SlotMap<BufferHandle, HeadlessBuffer>,
    last_submitted: u64,
    signaled_through: u64,
    in_flight: Vec<InFlight>,
    submissions: Vec<SkinCommandList>,
    created: u64,
    destroyed: u64,
    allocation_limit: Option<u64>,
    /// Labels whose creation fails, with the error to report (`None` for exhaustion).
    failing_labels: FxHashMap<&'static str, Option<SkinError>>,
}

impl HeadlessState {
    fn retire_signaled(&mut self) {
        let through = self.signaled_through;
        self.in_flight.retain(|f| f.fence.0 > through);
    }

    fn live_bytes(&self) -> u64 {
        self.buffers.values().map(|b| b.desc.size).sum()
    }
}

/// CPU-side [`SkinDevice`] implementation.
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
    capabilities: DeviceCapabilities,
    mode: FenceMode,
}

impl HeadlessDevice {
    #[must_use]
    pub fn new(capabilities: DeviceCapabilities, mode: FenceMode) -> Self {
        Self {
            state: Mutex::new(HeadlessState::default()),
            capabilities,
            mode,
        }
    }

    /// Default capabilities, fences signal immediately.
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(DeviceCapabilities::default(), FenceMode::Immediate)
    }

    /// Default capabilities, fences signal under test control.
    #[must_use]
    pub fn manual() -> Self {
        Self::new(DeviceCapabilities::default(), FenceMode::Manual)
    }

    #[must_use]
    pub fn fence_mode(&self) -> FenceMode {
        self.mode
    }

    // === Fence control ===

    /// Signals every submission up to and including `fence`.
    pub fn signal_through(&self, fence: FenceId) {
        let mut state = self.state.lock();
        let target = fence.0.min(state.last_submitted);
        if target > state.signaled_through {
            state.signaled_through = target;
            state.retire_signaled();
        }
    }

    /// Signals the oldest unsignaled submission. Returns false if none is pending.
    pub fn signal_next(&self) -> bool {
        let mut state = self.state.lock();
        if state.signaled_through >= state.last_submitted {
            return false;
        }
        state.signaled_through += 1;
        state.retire_signaled();
        true
    }

    /// Signals everything submitted so far.
    pub fn signal_all(&self) {
        let mut state = self.state.lock();
        state.signaled_through = state.last_submitted;
        state.retire_signaled();
    }

    #[must_use]
    pub fn pending_fence_count(&self) -> u64 {
        let state = self.state.lock();
        state.last_submitted - state.signaled_through
    }

    // === Failure injection ===

    /// Fails buffer creation once the live total would exceed `limit` bytes.
    pub fn set_allocation_limit(&self, limit: Option<u64>) {
        self.state.lock().allocation_limit = limit;
    }

    /// Fails every buffer creation carrying `label`.
    pub fn fail_allocations_labeled(&self, label: &'static str) {
        self.state.lock().failing_labels.insert(label, None);
    }

    /// Fails every buffer creation carrying `label` with `error`, e.g. a lost
    /// device, instead of a recoverable exhaustion.
    pub fn fail_allocations_labeled_with(&self, label: &'static str, error: SkinError) {
        self.state.lock().failing_labels.insert(label, Some(error));
    }

    pub fn clear_allocation_failures(&self) {
        let mut state = self.state.lock();
        state.allocation_limit = None;
        state.failing_labels.clear();
    }

    // === Inspection ===

    /// CPU copy of a buffer's current contents.
    #[must_use]
    pub fn buffer_contents(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(handle).map(|b| b.data.clone())
    }

    #[must_use]
    pub fn buffer_desc(&self, handle: BufferHandle) -> Option<BufferDesc> {
        self.state.lock().buffers.get(handle).map(|b| b.desc)
    }

    #[must_use]
    pub fn is_live(&self, handle: BufferHandle) -> bool {
        self.state.lock().buffers.contains_key(handle)
    }

    /// True if an unsignaled submission references `handle`.
    #[must_use]
    pub fn is_in_flight(&self, handle: BufferHandle) -> bool {
        self.state
            .lock()
            .in_flight
            .iter()
            .any(|f| f.buffers.contains(&handle))
    }

    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.state.lock().live_bytes()
    }

    #[must_use]
    pub fn created_buffer_count(&self) -> u64 {
        self.state.lock().created
    }

    #[must_use]
    pub fn destroyed_buffer_count(&self) -> u64 {
        self.state.lock().destroyed
    }

    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Runs `f` over the most recent submission, if any.
    pub fn with_last_submission<R>(&self, f: impl FnOnce(&SkinCommandList) -> R) -> Option<R> {
        self.state.lock().submissions.last().map(f)
    }

    /// Removes and returns every recorded submission.
    pub fn take_submissions(&self) -> Vec<SkinCommandList> {
        std::mem::take(&mut self.state.lock().submissions)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::immediate()
    }
}

impl SkinDevice for HeadlessDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let mut state = self.state.lock();

        if let Some(failure) = state.failing_labels.get(desc.label) {
            return Err(failure
                .clone()
                .unwrap_or_else(|| SkinError::exhausted(desc.label, desc.size, "allocation failure injected")));
        }
        if let Some(limit) = state.allocation_limit
            && state.live_bytes() + desc.size > limit
        {
            return Err(SkinError::exhausted(desc.label, desc.size, "device memory limit reached"));
        }

        state.created += 1;
        Ok(state.buffers.insert(HeadlessBuffer {
            desc: *desc,
            data: vec![0; desc.size as usize],
        }))
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        let mut state = self.state.lock();
        assert!(
            !state.in_flight.iter().any(|f| f.buffers.contains(&handle)),
            "buffer {handle:?} destroyed while an unsignaled submission still references it"
        );
        assert!(
            state.buffers.remove(handle).is_some(),
            "buffer {handle:?} destroyed twice"
        );
        state.destroyed += 1;
    }

    fn next_fence(&self) -> FenceId {
        FenceId(self.state.lock().last_submitted + 1)
    }

    fn submit(&self, commands: SkinCommandList) -> Result<FenceId> {
        let mut state = self.state.lock();

        let referenced = commands.referenced_buffers();
        for handle in &referenced {
            if !state.buffers.contains_key(*handle) {
                return Err(SkinError::InvalidHandle(format!("{handle:?}")));
            }
        }

        for cmd in &commands {
            match cmd {
                SkinCommand::WriteBuffer { buffer, offset, data } => {
                    let target = &mut state.buffers[*buffer];
                    let start = *offset as usize;
                    let end = start + data.len();
                    if end > target.data.len() {
                        return Err(SkinError::InvalidHandle(format!(
                            "write of {} bytes at {start} overflows '{}' ({} bytes)",
                            data.len(),
                            target.desc.label,
                            target.desc.size
                        )));
                    }
                    target.data[start..end].copy_from_slice(data);
                }
                SkinCommand::ClearBuffer { buffer } => {
                    state.buffers[*buffer].data.fill(0);
                }
                SkinCommand::Dispatch(_) | SkinCommand::Transition { .. } => {}
            }
        }

        state.last_submitted += 1;
        let fence = FenceId(state.last_submitted);
        state.in_flight.push(InFlight {
            fence,
            buffers: referenced.into_iter().collect(),
        });
        state.submissions.push(commands);

        if self.mode == FenceMode::Immediate {
            state.signaled_through = fence.0;
            state.retire_signaled();
        }
        Ok(fence)
    }

    fn is_fence_signaled(&self, fence: FenceId) -> bool {
        fence.0 <= self.state.lock().signaled_through
    }

    fn wait_fence(&self, fence: FenceId) {
        // A blocking wait on a headless device completes the work it waits for.
        self.signal_through(fence);
    }
}
