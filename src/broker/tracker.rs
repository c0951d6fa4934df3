//! Outstanding-frame reference counting
//!
//! A compact array of `{id, ref_count}` records, one per frame currently out
//! with clients. Lookup is linear by design: the record count is bounded by
//! the device buffer pool, which is small.

/// What the caller should do after a decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decrement {
    /// The last reference dropped; return the buffer to the device
    ReturnToDevice,
    /// Other clients still hold the frame
    StillHeld,
    /// No live record for this id; logged, caller ignores
    UnknownId,
}

#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    id: u32,
    ref_count: u32,
}

/// Table of frames currently referenced by clients
#[derive(Debug, Default)]
pub(crate) struct FrameTracker {
    frames: Vec<FrameRecord>,
}

impl FrameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly delivered frame with its acceptance count.
    ///
    /// Reuses the first free slot, appending only when none is free.
    pub fn register(&mut self, id: u32, ref_count: u32) {
        debug_assert!(ref_count > 0);
        match self.frames.iter_mut().find(|rec| rec.ref_count == 0) {
            Some(rec) => {
                rec.id = id;
                rec.ref_count = ref_count;
            }
            None => self.frames.push(FrameRecord { id, ref_count }),
        }
    }

    /// Drop one reference from the live record for `id`
    pub fn decrement(&mut self, id: u32) -> Decrement {
        match self
            .frames
            .iter_mut()
            .find(|rec| rec.id == id && rec.ref_count > 0)
        {
            Some(rec) => {
                rec.ref_count -= 1;
                if rec.ref_count == 0 {
                    Decrement::ReturnToDevice
                } else {
                    Decrement::StillHeld
                }
            }
            None => {
                tracing::error!(buffer_id = id, "Frame returned with an unrecognized id");
                Decrement::UnknownId
            }
        }
    }

    /// Shrink or grow the table to track the new pool size.
    ///
    /// Live records are compacted into the new table in order and are never
    /// dropped; exceeding the new capacity is logged and tolerated.
    pub fn resize(&mut self, new_capacity: usize) {
        let mut records = Vec::with_capacity(new_capacity);
        records.extend(self.frames.iter().copied().filter(|rec| rec.ref_count > 0));
        if records.len() > new_capacity {
            tracing::warn!(
                live = records.len(),
                new_capacity,
                "More frames in use than the resized pool allows"
            );
        }
        self.frames = records;
    }

    /// Number of records with a non-zero reference count
    pub fn live_count(&self) -> usize {
        self.frames.iter().filter(|rec| rec.ref_count > 0).count()
    }

    /// Current reference count for a live frame id
    pub fn ref_count(&self, id: u32) -> Option<u32> {
        self.frames
            .iter()
            .find(|rec| rec.id == id && rec.ref_count > 0)
            .map(|rec| rec.ref_count)
    }
}
