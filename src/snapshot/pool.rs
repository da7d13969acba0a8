use parking_lot::Mutex;

use super::{DynamicSkinningSnapshot, SnapshotData};
use crate::settings::SnapshotPoolSettings;

struct PoolState {
    free: Vec<Box<SnapshotData>>,
    /// Lowest free count seen since the last cleanup.
    low_water: usize,
    allocations: u32,
    created: u64,
}

/// Recycles snapshot storage between the simulation and render threads.
///
/// Storage idle through an entire cleanup interval (the low-water mark of
/// the free list) is dropped at the end of that interval, so the pool shrinks
/// back after a spike.
pub struct SnapshotPool {
    settings: SnapshotPoolSettings,
    state: Mutex<PoolState>,
}

impl SnapshotPool {
    #[must_use]
    pub fn new(settings: SnapshotPoolSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                low_water: 0,
                allocations: 0,
                created: 0,
            }),
        }
    }

    pub(crate) fn allocate(&self) -> Box<SnapshotData> {
        if !self.settings.enabled {
            self.state.lock().created += 1;
            return Box::default();
        }

        let mut state = self.state.lock();
        state.allocations += 1;

        let data = match state.free.pop() {
            Some(data) => data,
            None => {
                state.created += 1;
                Box::default()
            }
        };
        state.low_water = state.low_water.min(state.free.len());

        if state.allocations >= self.settings.cleanup_interval {
            let idle = state.low_water.min(state.free.len());
            if idle > 0 {
                let keep = state.free.len() - idle;
                state.free.truncate(keep);
                log::debug!("Snapshot pool dropped {idle} idle storages");
            }
            state.allocations = 0;
            state.low_water = state.free.len();
        }
        data
    }

    /// Returns a snapshot's storage for reuse.
    pub fn free(&self, snapshot: DynamicSkinningSnapshot) {
        if !self.settings.enabled {
            return;
        }
        let mut data = snapshot.into_data();
        data.reset();
        self.state.lock().free.push(data);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Storages ever created (pool misses).
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.state.lock().created
    }
}

impl Default for SnapshotPool {
    fn default() -> Self {
        Self::new(SnapshotPoolSettings::default())
    }
}
