//! The transaction engine: owns the segment handle and the reclamation
//! queue, and drives the retry loop the external interface's
//! `transaction!`-style helpers sit on top of.
//!
//! One [`Engine`] exists per process, shared (via `Arc`) across every
//! task's thread-local [`TransactionContext`].

use std::sync::Arc;

use tracing::{debug, warn};

use shoal_shm::{Handle, ObjectTag, Segment, ShmError};

use crate::commit;
use crate::context::TransactionContext;
use crate::error::TxnResult;
use crate::reclaim::ReclamationQueue;

/// Owns the process's segment attachment and reclamation queue; the
/// shared handle every task's transaction context and container wrapper
/// is built against.
pub struct Engine {
    segment: Arc<Segment>,
    reclaim: ReclamationQueue,
}

impl Engine {
    /// Wrap an already-attached segment.
    pub fn new(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            reclaim: ReclamationQueue::new(),
        }
    }

    /// The underlying segment, for container wrappers in `shoal_objects`.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// A fresh, idle transaction context bound to this engine's segment.
    pub fn new_context(&self) -> TransactionContext {
        TransactionContext::new(Arc::clone(&self.segment))
    }

    /// Allocate a new object. Not itself transactional — the handle is
    /// unreachable until a transaction's write attaches it to the shared
    /// graph — but callers inside an active transaction should route
    /// through [`TransactionContext::record_allocation`] so a rollback
    /// frees it again.
    ///
    /// On a first-attempt `OutOfMemory`, per §4.1's edge policy, runs a
    /// reclamation sweep and retries once before surfacing the error —
    /// retryable if that sweep freed anything or left entries still
    /// queued for a later epoch (reclamation may yet help), fatal only if
    /// the sweep found nothing to do at all.
    pub fn alloc(&self, tag: ObjectTag, payload: &[u8], frozen: bool) -> TxnResult<Handle> {
        match self.segment.alloc_object(tag, payload, frozen) {
            Ok(handle) => return Ok(handle),
            Err(ShmError::OutOfMemory { .. }) => {}
            Err(other) => return Err(other.into()),
        }

        let freed = self.sweep();
        match self.segment.alloc_object(tag, payload, frozen) {
            Ok(handle) => Ok(handle),
            Err(ShmError::OutOfMemory { .. }) => {
                let retryable = freed > 0 || self.pending_reclamation() > 0;
                warn!(freed, retryable, "allocator out of memory after reclamation sweep");
                Err(ShmError::OutOfMemory { retryable }.into())
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Drop a reference. When the refcount reaches zero the object is
    /// queued for reclamation rather than freed immediately, so a
    /// transaction that read it just before the last reference dropped
    /// still sees valid memory.
    pub fn decref(&self, handle: Handle) {
        if handle.is_null() {
            return;
        }
        let header = self.segment.header(handle);
        if header.decref() == 0 {
            self.reclaim.enqueue(handle, self.segment.current_epoch());
        }
    }

    /// Run the commit protocol for `ctx`'s outermost `commit_request`.
    /// A no-op (returns `Ok(())` immediately) while nesting depth is
    /// still above zero. On success, bumps the segment's global epoch,
    /// publishes it to this process's participant slot, and piggybacks
    /// a reclamation sweep.
    pub fn commit(&self, ctx: &mut TransactionContext) -> TxnResult<()> {
        if !ctx.enter_commit() {
            return Ok(());
        }
        let result = commit::run(ctx);
        match &result {
            Ok(()) => {
                let epoch = self.segment.bump_epoch();
                if let Some(idx) = self.segment.participant_idx() {
                    if let Some(entry) = self.segment.participant_table().entry(idx) {
                        entry.publish_epoch(epoch);
                    }
                }
                for (offset, size) in ctx.take_retiring_raw() {
                    self.reclaim.enqueue_raw(offset, size, epoch);
                }
                // Increfs before decrefs: a handle staged for both in the
                // same attempt (e.g. `list.set` overwriting a slot with
                // the same handle it held) must net to no change rather
                // than a spurious drop to zero.
                for handle in ctx.take_pending_increfs() {
                    self.segment.header(handle).incref();
                }
                for handle in ctx.take_pending_decrefs() {
                    self.decref(handle);
                }
                let freed = self.reclaim.sweep(&self.segment, self.segment.participant_table());
                if freed > 0 {
                    debug!(freed, "reclamation sweep");
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Run `body` inside a transaction, retrying indefinitely on a
    /// retryable abort. This is the engine-level primitive the facade's
    /// bounded-retry policy (a caller concern, per the external
    /// interface) wraps.
    pub fn transaction<T>(&self, mut body: impl FnMut(&mut TransactionContext) -> TxnResult<T>) -> TxnResult<T> {
        let mut ctx = self.new_context();
        loop {
            ctx.begin();
            let outcome = body(&mut ctx).and_then(|value| self.commit(&mut ctx).map(|()| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    warn!(txn = ctx.id(), retry = ctx.retry_count() + 1, "transaction aborted, retrying");
                    ctx.rollback_retaining();
                }
                Err(err) => {
                    ctx.rollback();
                    return Err(err);
                }
            }
        }
    }

    /// Acquire a transient (non-transactional) exclusive region on
    /// `handle`.
    pub fn transient_begin(&self, handle: Handle) -> crate::transient::TransientGuard<'_> {
        crate::transient::begin(&self.segment, handle)
    }

    /// Force a reclamation sweep outside the commit path — used by the
    /// coordinator's maintenance loop alongside the participant reaper.
    pub fn sweep(&self) -> usize {
        self.reclaim.sweep(&self.segment, self.segment.participant_table())
    }

    /// Number of objects currently queued for reclamation.
    pub fn pending_reclamation(&self) -> usize {
        self.reclaim.len()
    }
}
