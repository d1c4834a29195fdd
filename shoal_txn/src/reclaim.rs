//! Epoch-tagged reclamation queue.
//!
//! A decref reaching zero doesn't free the object immediately — another
//! participant's already-running transaction may have read it just
//! before the last reference dropped, and still holds a handle to it in
//! its read log. Instead the object is stamped with the epoch it was
//! retired at and queued; a sweep (piggybacked on every commit) frees
//! only entries whose epoch predates every live participant's current
//! heartbeat, per [`ParticipantTable::min_live_epoch`].
//!
//! The queue itself is process-local: each process's own decrefs enqueue
//! into its own process's queue, but the `free_object` call a sweep
//! issues acts directly on the shared allocator, so the memory becomes
//! available to every participant the instant any one of them sweeps it.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::trace;

use shoal_shm::{Handle, ParticipantTable, Segment};

enum PendingKind {
    /// A refcounted object past its header lifetime.
    Object(Handle),
    /// A bare backing-storage block superseded by container growth —
    /// has no header, refcount, or version, just an offset and size.
    Raw { offset: u64, size: usize },
}

struct PendingFree {
    kind: PendingKind,
    retired_epoch: u64,
}

/// Queue of objects whose refcount has reached zero, awaiting an epoch
/// old enough that no live transaction can still observe them.
pub struct ReclamationQueue {
    pending: Mutex<VecDeque<PendingFree>>,
}

impl ReclamationQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue `handle` for reclamation, stamped with the segment's current
    /// allocation epoch.
    pub fn enqueue(&self, handle: Handle, retired_epoch: u64) {
        self.pending
            .lock()
            .expect("reclamation queue mutex poisoned")
            .push_back(PendingFree { kind: PendingKind::Object(handle), retired_epoch });
    }

    /// Queue a bare backing-storage block (a list/map backing array
    /// superseded by growth) for reclamation, stamped with the epoch it
    /// was retired at.
    pub fn enqueue_raw(&self, offset: u64, size: usize, retired_epoch: u64) {
        self.pending
            .lock()
            .expect("reclamation queue mutex poisoned")
            .push_back(PendingFree { kind: PendingKind::Raw { offset, size }, retired_epoch });
    }

    /// Free every queued object whose retirement epoch predates the
    /// minimum live participant epoch. Returns the number freed. A
    /// segment with no live participants (shouldn't happen while this
    /// process itself is one) frees nothing, erring toward safety.
    pub fn sweep(&self, segment: &Segment, table: &ParticipantTable) -> usize {
        let Some(min_epoch) = table.min_live_epoch() else {
            return 0;
        };
        let mut pending = self.pending.lock().expect("reclamation queue mutex poisoned");
        let mut freed = 0;
        let remaining: VecDeque<PendingFree> = pending
            .drain(..)
            .filter_map(|entry| {
                if entry.retired_epoch < min_epoch {
                    match entry.kind {
                        PendingKind::Object(handle) => {
                            segment.free_object(handle);
                            trace!(offset = handle.offset(), epoch = entry.retired_epoch, "reclaimed object");
                        }
                        PendingKind::Raw { offset, size } => {
                            segment.free_raw(offset, size);
                            trace!(offset, size, epoch = entry.retired_epoch, "reclaimed raw backing block");
                        }
                    }
                    freed += 1;
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        *pending = remaining;
        freed
    }

    /// Number of objects currently awaiting reclamation, for diagnostics
    /// and tests.
    pub fn len(&self) -> usize {
        self.pending.lock().expect("reclamation queue mutex poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReclamationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::consts::SEGMENT_MIN_SIZE;
    use shoal_shm::ObjectTag;

    #[test]
    fn sweep_frees_only_entries_older_than_min_live_epoch() {
        let name = format!("test_reclaim_{}", std::process::id());
        let segment = Segment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        let handle = segment.alloc_object(ObjectTag::Scalar, &[0u8; 8], true).unwrap();

        let queue = ReclamationQueue::new();
        queue.enqueue(handle, 0);
        assert_eq!(queue.len(), 1);

        let idx = segment.participant_idx().unwrap();
        segment.participant_table().entry(idx).unwrap().heartbeat();

        let freed = queue.sweep(&segment, segment.participant_table());
        assert_eq!(freed, 1);
        assert!(queue.is_empty());
    }
}
