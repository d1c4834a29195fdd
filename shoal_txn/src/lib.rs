//! # Shoal Transaction Engine
//!
//! Optimistic concurrency control over [`shoal_shm`]'s segments: per-task
//! read/write logs, a three-phase commit protocol (lock ascending,
//! validate, publish), an unbounded internal retry loop, a transient
//! escape hatch for non-transactional single-object access, and an
//! epoch-tagged reclamation queue piggybacked on every commit.
//!
//! Bounded retry counts are deliberately not enforced here — the engine
//! itself retries forever on a retryable abort, per the external
//! interface's "retry policy is the caller's concern" design. `shoal_api`
//! is where a collaborator-facing retry budget would be layered on.

#![warn(clippy::all)]

pub mod commit;
pub mod context;
pub mod engine;
pub mod error;
pub mod reclaim;
pub mod transient;

pub use context::{ReadEntry, TransactionContext, TxnState, WriteEntry};
pub use engine::Engine;
pub use error::{TxnError, TxnResult};
pub use reclaim::ReclamationQueue;
pub use transient::TransientGuard;

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::consts::SEGMENT_MIN_SIZE;
    use shoal_shm::{ObjectTag, Segment};
    use std::sync::Arc;

    fn engine(tag: &str) -> Engine {
        let name = format!("test_txn_{tag}_{}", std::process::id());
        let segment = Segment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        Engine::new(Arc::new(segment))
    }

    #[test]
    fn single_writer_commit_publishes_new_value() {
        let engine = engine("single_writer");
        let handle = engine.alloc(ObjectTag::Scalar, &0i64.to_le_bytes(), false).unwrap();

        engine
            .transaction(|ctx| {
                ctx.write(handle, 7i64.to_le_bytes().to_vec());
                Ok(())
            })
            .unwrap();

        let value = i64::from_le_bytes(engine.segment().payload(handle).try_into().unwrap());
        assert_eq!(value, 7);
    }

    #[test]
    fn conflicting_write_forces_a_retry_that_converges() {
        let engine = engine("conflict");
        let handle = engine.alloc(ObjectTag::Scalar, &0i64.to_le_bytes(), false).unwrap();

        // Simulate another participant's write landing between this
        // transaction's read and its commit by mutating the header
        // version directly after the body has staged its write.
        let mut attempts = 0;
        engine
            .transaction(|ctx| {
                let current = i64::from_le_bytes(ctx.read(handle).try_into().unwrap());
                attempts += 1;
                if attempts == 1 {
                    engine.segment().header(handle).bump_version();
                }
                ctx.write(handle, (current + 1).to_le_bytes().to_vec());
                Ok(())
            })
            .unwrap();

        assert!(attempts >= 2, "the stale first attempt must have been retried");
    }

    #[test]
    fn rollback_frees_quarantined_allocations() {
        let engine = engine("rollback");
        let mut ctx = engine.new_context();
        ctx.begin();
        let handle = engine.alloc(ObjectTag::Scalar, &[1, 2, 3, 4], true).unwrap();
        ctx.record_allocation(handle);
        ctx.rollback();

        // The freed block's offset is back on the size-class free list,
        // so an identically sized allocation reuses it.
        let reused = engine.alloc(ObjectTag::Scalar, &[5, 6, 7, 8], true).unwrap();
        assert_eq!(reused.offset(), handle.offset());
    }

    #[test]
    fn decref_to_zero_queues_for_reclamation_and_sweep_frees_it() {
        let engine = engine("decref");
        let handle = engine.alloc(ObjectTag::Scalar, &[9, 9, 9, 9], true).unwrap();
        engine.decref(handle);
        assert_eq!(engine.pending_reclamation(), 1);

        if let Some(idx) = engine.segment().participant_idx() {
            engine.segment().participant_table().entry(idx).unwrap().publish_epoch(u64::MAX);
        }
        let freed = engine.sweep();
        assert_eq!(freed, 1);
        assert_eq!(engine.pending_reclamation(), 0);
    }

    #[test]
    fn nested_transaction_only_commits_on_outermost_request() {
        let engine = engine("nested");
        let handle = engine.alloc(ObjectTag::Scalar, &0i64.to_le_bytes(), false).unwrap();
        let mut ctx = engine.new_context();
        ctx.begin();
        ctx.begin();
        assert_eq!(ctx.depth(), 2);
        ctx.write(handle, 1i64.to_le_bytes().to_vec());
        engine.commit(&mut ctx).unwrap();
        assert_eq!(ctx.depth(), 1);
        assert_eq!(i64::from_le_bytes(engine.segment().payload(handle).try_into().unwrap()), 0);
        engine.commit(&mut ctx).unwrap();
        assert_eq!(i64::from_le_bytes(engine.segment().payload(handle).try_into().unwrap()), 1);
    }

    #[test]
    fn transient_region_mutates_without_a_transaction() {
        let engine = engine("transient");
        let handle = engine.alloc(ObjectTag::Scalar, &0i64.to_le_bytes(), false).unwrap();
        {
            let guard = engine.transient_begin(handle);
            engine.segment().payload_mut(guard.handle())[..8].copy_from_slice(&5i64.to_le_bytes());
        }
        assert_eq!(i64::from_le_bytes(engine.segment().payload(handle).try_into().unwrap()), 5);
    }
}
