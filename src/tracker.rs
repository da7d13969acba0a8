//! Double-Buffered Resource Tracker
//!
//! Two payload slots, each tagged with the `(source, revision)` whose data it
//! currently holds. Skinning needs the current frame's output and the
//! previous frame's output side by side (for motion vectors), so a cache
//! entry asks for both tags every frame:
//!
//! ```text
//! frame N   : slot0 = (vf, 7)  slot1 = (vf, 6)     advance(vf,8, vf,7)
//!                       keep ──┘        └── untag, retag as (vf, 8)
//! frame N+1 : slot0 = (vf, 7)  slot1 = (vf, 8)
//! ```
//!
//! Only retagged slots need new GPU work. A slot matching either requested
//! tag is never evicted, and two slots never carry the same tag.

use smallvec::SmallVec;

/// Number of tracked slots.
pub const NUM_TRACKED_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceTag<S> {
    pub source: S,
    pub revision: u32,
}

impl<S> ResourceTag<S> {
    pub fn new(source: S, revision: u32) -> Self {
        Self { source, revision }
    }
}

#[derive(Debug)]
struct TrackedSlot<S, T> {
    tag: Option<ResourceTag<S>>,
    payload: T,
}

#[derive(Debug)]
pub struct DoubleBufferedResourceTracker<S, T> {
    slots: [TrackedSlot<S, T>; NUM_TRACKED_SLOTS],
}

impl<S: Copy + Eq, T> DoubleBufferedResourceTracker<S, T> {
    /// Both slots start untagged.
    pub fn new(payloads: [T; NUM_TRACKED_SLOTS]) -> Self {
        let [a, b] = payloads;
        Self {
            slots: [
                TrackedSlot { tag: None, payload: a },
                TrackedSlot { tag: None, payload: b },
            ],
        }
    }

    /// Slot holding `(source, revision)`, if any.
    #[must_use]
    pub fn find(&self, source: S, revision: u32) -> Option<usize> {
        let wanted = ResourceTag::new(source, revision);
        self.slots.iter().position(|s| s.tag == Some(wanted))
    }

    /// Ensures both requested tags own a slot.
    ///
    /// Slots matching neither tag are untagged first; missing tags are then
    /// assigned to free slots. Returns the slots whose tag changed (their
    /// payload is stale and needs a re-upload).
    pub fn advance(
        &mut self,
        source_a: S,
        revision_a: u32,
        source_b: S,
        revision_b: u32,
    ) -> SmallVec<[usize; NUM_TRACKED_SLOTS]> {
        let a = ResourceTag::new(source_a, revision_a);
        let b = ResourceTag::new(source_b, revision_b);

        for slot in &mut self.slots {
            if slot.tag.is_some_and(|t| t != a && t != b) {
                slot.tag = None;
            }
        }

        let mut retagged = SmallVec::new();
        let requested: SmallVec<[ResourceTag<S>; 2]> =
            if a == b { SmallVec::from_slice(&[a]) } else { SmallVec::from_slice(&[a, b]) };
        for tag in requested {
            if self.slots.iter().any(|s| s.tag == Some(tag)) {
                continue;
            }
            if let Some(free) = self.slots.iter().position(|s| s.tag.is_none()) {
                self.slots[free].tag = Some(tag);
                retagged.push(free);
            }
        }

        debug_assert!(
            self.slots[0].tag.is_none() || self.slots[0].tag != self.slots[1].tag,
            "two tracker slots carry the same tag"
        );
        retagged
    }

    #[must_use]
    pub fn tag(&self, slot: usize) -> Option<ResourceTag<S>> {
        self.slots[slot].tag
    }

    #[must_use]
    pub fn payload(&self, slot: usize) -> &T {
        &self.slots[slot].payload
    }

    pub fn payload_mut(&mut self, slot: usize) -> &mut T {
        &mut self.slots[slot].payload
    }

    /// Forgets every tag, forcing a full re-upload on the next advance.
    pub fn invalidate(&mut self) {
        for slot in &mut self.slots {
            slot.tag = None;
        }
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|s| &s.payload)
    }

    /// Consumes the tracker, returning both payloads.
    pub fn into_payloads(self) -> [T; NUM_TRACKED_SLOTS] {
        let [a, b] = self.slots;
        [a.payload, b.payload]
    }
}
