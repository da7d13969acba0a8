//! Fence-gated ownership.
//!
//! [`FenceGuarded`] holds a value the GPU may still read until a fence
//! signals. The value can only be taken back once the fence has signaled;
//! taking it earlier is an invariant violation and panics.

use crate::device::{FenceId, SkinDevice};

/// A value released to the GPU until `fence` signals.
#[derive(Debug)]
pub struct FenceGuarded<T> {
    value: T,
    fence: FenceId,
}

impl<T> FenceGuarded<T> {
    pub fn new(value: T, fence: FenceId) -> Self {
        Self { value, fence }
    }

    #[inline]
    #[must_use]
    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Read-only access. The GPU may be reading the same data concurrently.
    #[inline]
    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }

    #[must_use]
    pub fn is_ready(&self, device: &dyn SkinDevice) -> bool {
        device.is_fence_signaled(self.fence)
    }

    /// Returns the value if the fence signaled, or the guard unchanged.
    pub fn try_take(self, device: &dyn SkinDevice) -> Result<T, Self> {
        if self.is_ready(device) { Ok(self.value) } else { Err(self) }
    }

    /// Takes the value.
    ///
    /// # Panics
    ///
    /// Panics with `StaleFenceWait` if the fence has not signaled.
    pub fn take(self, device: &dyn SkinDevice) -> T {
        assert!(
            self.is_ready(device),
            "StaleFenceWait: resource taken back before fence {} signaled",
            self.fence.value()
        );
        self.value
    }

    /// Blocks until the fence signals, then takes the value.
    pub fn wait(self, device: &dyn SkinDevice) -> T {
        device.wait_fence(self.fence);
        self.take(device)
    }
}

/// Drains every ready entry out of `guarded`, in submission order.
pub fn drain_ready<T>(guarded: &mut Vec<FenceGuarded<T>>, device: &dyn SkinDevice) -> Vec<T> {
    let mut ready = Vec::new();
    let mut pending = Vec::with_capacity(guarded.len());
    for entry in guarded.drain(..) {
        match entry.try_take(device) {
            Ok(value) => ready.push(value),
            Err(entry) => pending.push(entry),
        }
    }
    *guarded = pending;
    ready
}
