//! The three-phase commit protocol: lock the write set in ascending
//! handle order, validate the read set, publish writes, unlock.
//!
//! Every step here operates on an already-populated [`TransactionContext`]
//! and never blocks — a failure at any phase releases whatever locks were
//! acquired and returns [`ShmError::ShmAbort`], leaving the caller's retry
//! loop to decide whether to restart.

use tracing::{debug, trace};

use shoal_shm::ShmError;

use crate::context::TransactionContext;
use crate::error::TxnResult;

/// Run the commit protocol for the outermost `commit_request`. On success,
/// clears the context's logs and returns to `Idle`. On conflict, releases
/// any locks already taken and returns `Err(TxnError::Shm(ShmAbort))`
/// without mutating the context's logs — the caller decides whether to
/// retry via [`TransactionContext::rollback_retaining`].
pub fn run(ctx: &mut TransactionContext) -> TxnResult<()> {
    if ctx.write_log.is_empty() && ctx.read_log.is_empty() {
        ctx.finish_commit();
        return Ok(());
    }

    let mut write_handles: Vec<_> = ctx.write_log.keys().copied().collect();
    write_handles.sort();

    let mut locked = Vec::with_capacity(write_handles.len());
    for handle in &write_handles {
        let header = ctx.segment.header(*handle);
        let expected = *ctx.observed.get(handle).unwrap_or(&header.version.load());
        match header.try_lock(ctx.id, expected) {
            Ok(()) => locked.push(*handle),
            Err(()) => {
                header.record_write_conflict();
                release(ctx, &locked);
                debug!(txn = ctx.id, offset = handle.offset(), "commit aborted: write-set lock failed");
                return Err(ShmError::ShmAbort.into());
            }
        }
    }

    for entry in &ctx.read_log {
        if ctx.write_log.contains_key(&entry.handle) {
            continue;
        }
        let header = ctx.segment.header(entry.handle);
        let owner = header.owner_tx_id();
        let version = header.version.load();
        if (owner != 0 && owner != ctx.id) || version != entry.observed_version {
            header.record_read_conflict();
            release(ctx, &locked);
            debug!(txn = ctx.id, offset = entry.handle.offset(), "commit aborted: read-set validation failed");
            return Err(ShmError::ShmAbort.into());
        }
    }

    for handle in &write_handles {
        let entry = &ctx.write_log[handle];
        let header = ctx.segment.header(*handle);
        debug_assert_eq!(
            entry.new_payload.len() as u64,
            header.payload_size,
            "write payload size must match the object's fixed allocation"
        );
        ctx.segment.payload_mut(*handle).copy_from_slice(&entry.new_payload);
        header.bump_version();
        trace!(txn = ctx.id, offset = handle.offset(), "published write");
    }

    for patch in &ctx.raw_writes {
        let dest = ctx.segment.write_raw(patch.offset, patch.data.len());
        dest.copy_from_slice(&patch.data);
    }

    release(ctx, &locked);
    ctx.finish_commit();
    Ok(())
}

fn release(ctx: &TransactionContext, locked: &[shoal_shm::Handle]) {
    for handle in locked {
        ctx.segment.header(*handle).unlock(ctx.id);
    }
}
