//! Ordered list: a segment-allocated growable vector of element handles.
//!
//! The list's own handle carries a small, fixed-size metadata payload
//! (`len`, `capacity`, `backing_offset`) so it fits the engine's
//! full-payload-replacement write log like every other mutable object.
//! The actual element storage lives in a separate bare block the list
//! owns exclusively — growing it allocates a new block, copies, and
//! retires the old one, exactly the "current backing-array handle"
//! the iteration-conflict rule is written in terms of.

use shoal_shm::{Handle, ObjectTag};
use shoal_txn::TransactionContext;

use crate::error::{ObjectsError, ObjectsResult};

const ELEM_SIZE: usize = 8;
const META_SIZE: usize = 24;
const MIN_CAPACITY: u64 = 4;

fn encode_meta(len: u64, capacity: u64, backing_offset: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(META_SIZE);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&capacity.to_le_bytes());
    out.extend_from_slice(&backing_offset.to_le_bytes());
    out
}

fn decode_meta(bytes: &[u8]) -> (u64, u64, u64) {
    let len = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let capacity = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let backing_offset = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    (len, capacity, backing_offset)
}

/// A transactional ordered list. The wrapped handle is its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct List(pub Handle);

impl List {
    /// Allocate a new list seeded with `elements`. Must be called with
    /// an active transaction context; the new list and its initial
    /// backing block are quarantined, freed if this attempt rolls back.
    pub fn new(ctx: &mut TransactionContext, elements: &[Handle]) -> ObjectsResult<Self> {
        let capacity = (elements.len() as u64).max(MIN_CAPACITY);
        let backing_size = capacity as usize * ELEM_SIZE;
        let backing_offset = ctx.segment().alloc_raw(backing_size)?;
        {
            let dest = ctx.segment().write_raw(backing_offset, backing_size);
            for (i, h) in elements.iter().enumerate() {
                dest[i * ELEM_SIZE..i * ELEM_SIZE + ELEM_SIZE].copy_from_slice(&h.raw().to_le_bytes());
            }
        }
        ctx.record_raw_allocation(backing_offset, backing_size);
        for h in elements {
            ctx.stage_incref(*h);
        }

        let meta = encode_meta(elements.len() as u64, capacity, backing_offset);
        let handle = ctx.segment().alloc_object(ObjectTag::List, &meta, false)?;
        ctx.record_allocation(handle);
        Ok(List(handle))
    }

    /// Wrap an already-allocated list handle.
    pub fn from_handle(handle: Handle) -> Self {
        List(handle)
    }

    /// This list's handle.
    pub fn handle(&self) -> Handle {
        self.0
    }

    fn meta(&self, ctx: &mut TransactionContext) -> (u64, u64, u64) {
        decode_meta(&ctx.read(self.0))
    }

    /// Current element count.
    pub fn len(&self, ctx: &mut TransactionContext) -> u64 {
        self.meta(ctx).0
    }

    /// Whether the list is empty.
    pub fn is_empty(&self, ctx: &mut TransactionContext) -> bool {
        self.len(ctx) == 0
    }

    /// Element at `index`.
    pub fn get(&self, ctx: &mut TransactionContext, index: u64) -> ObjectsResult<Handle> {
        let (len, _capacity, backing_offset) = self.meta(ctx);
        if index >= len {
            return Err(ObjectsError::IndexOutOfBounds { index: index as usize, len: len as usize });
        }
        let bytes = ctx.read_raw(backing_offset + index * ELEM_SIZE as u64, ELEM_SIZE);
        Ok(Handle::from_raw(u64::from_le_bytes(bytes.try_into().unwrap())))
    }

    /// Replace the element at `index`. Bumps the list's version at
    /// commit even though `len`/`capacity`/`backing_offset` don't
    /// change, per the "element mutation via set bumps version" rule.
    /// Increfs `value` and decrefs the element it displaces — the list
    /// keeps exactly one reference per occupied slot.
    pub fn set(&self, ctx: &mut TransactionContext, index: u64, value: Handle) -> ObjectsResult<()> {
        let (len, capacity, backing_offset) = self.meta(ctx);
        if index >= len {
            return Err(ObjectsError::IndexOutOfBounds { index: index as usize, len: len as usize });
        }
        let old = self.get(ctx, index)?;
        ctx.stage_raw_write(backing_offset + index * ELEM_SIZE as u64, value.raw().to_le_bytes().to_vec());
        ctx.write(self.0, encode_meta(len, capacity, backing_offset));
        ctx.stage_incref(value);
        ctx.stage_decref(old);
        Ok(())
    }

    /// Append `value` at the end, growing the backing array if full.
    /// Increfs `value` — the list now owns a reference to it.
    pub fn append(&self, ctx: &mut TransactionContext, value: Handle) -> ObjectsResult<()> {
        let (len, capacity, backing_offset) = self.meta(ctx);
        if len < capacity {
            ctx.stage_raw_write(backing_offset + len * ELEM_SIZE as u64, value.raw().to_le_bytes().to_vec());
            ctx.write(self.0, encode_meta(len + 1, capacity, backing_offset));
            ctx.stage_incref(value);
            return Ok(());
        }

        let new_capacity = (capacity * 2).max(MIN_CAPACITY);
        let new_size = new_capacity as usize * ELEM_SIZE;
        let new_backing = ctx.segment().alloc_raw(new_size)?;
        let existing = ctx.read_raw(backing_offset, len as usize * ELEM_SIZE);
        {
            let dest = ctx.segment().write_raw(new_backing, new_size);
            dest[..existing.len()].copy_from_slice(&existing);
            dest[len as usize * ELEM_SIZE..len as usize * ELEM_SIZE + ELEM_SIZE]
                .copy_from_slice(&value.raw().to_le_bytes());
        }
        ctx.record_raw_allocation(new_backing, new_size);
        ctx.retire_raw(backing_offset, capacity as usize * ELEM_SIZE);
        ctx.write(self.0, encode_meta(len + 1, new_capacity, new_backing));
        ctx.stage_incref(value);
        Ok(())
    }

    /// Remove and return the first element, shifting the rest down by
    /// one slot. Transfers the list's own reference to the caller rather
    /// than increfing then decrefing it back to the same count.
    pub fn pop_front(&self, ctx: &mut TransactionContext) -> ObjectsResult<Handle> {
        let (len, capacity, backing_offset) = self.meta(ctx);
        if len == 0 {
            return Err(ObjectsError::PopFromEmptyList);
        }
        let first = ctx.read_raw(backing_offset, ELEM_SIZE);
        let first = Handle::from_raw(u64::from_le_bytes(first.try_into().unwrap()));

        if len > 1 {
            let rest = ctx.read_raw(backing_offset + ELEM_SIZE as u64, (len - 1) as usize * ELEM_SIZE);
            ctx.stage_raw_write(backing_offset, rest);
        }
        ctx.write(self.0, encode_meta(len - 1, capacity, backing_offset));
        Ok(first)
    }

    /// A stable snapshot of every element, captured under the version
    /// and backing-array handle observed at the start of this call —
    /// consistent inside a transaction because the metadata read above
    /// is itself logged and validated at commit.
    pub fn iter(&self, ctx: &mut TransactionContext) -> ObjectsResult<Vec<Handle>> {
        let (len, _capacity, backing_offset) = self.meta(ctx);
        let bytes = ctx.read_raw(backing_offset, len as usize * ELEM_SIZE);
        Ok(bytes
            .chunks_exact(ELEM_SIZE)
            .map(|chunk| Handle::from_raw(u64::from_le_bytes(chunk.try_into().unwrap())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{new_value, read_value, ScalarValue};
    use shoal_common::consts::SEGMENT_MIN_SIZE;
    use shoal_shm::Segment;
    use shoal_txn::Engine;
    use std::sync::Arc;

    fn engine(tag: &str) -> Engine {
        let name = format!("test_list_{tag}_{}", std::process::id());
        let segment = Segment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        Engine::new(Arc::new(segment))
    }

    #[test]
    fn append_then_pop_front_round_trips_when_empty_before() {
        let engine = engine("append_pop");
        engine
            .transaction(|ctx| {
                let list = List::new(ctx, &[])?;
                let v = new_value(&engine, &ScalarValue::Int(7))?;
                list.append(ctx, v)?;
                let popped = list.pop_front(ctx)?;
                assert_eq!(read_value(engine.segment(), popped).unwrap(), ScalarValue::Int(7));
                assert!(list.is_empty(ctx));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn append_grows_past_initial_capacity() {
        let engine = engine("grow");
        engine
            .transaction(|ctx| {
                let list = List::new(ctx, &[])?;
                for i in 0..20 {
                    let v = new_value(&engine, &ScalarValue::Int(i))?;
                    list.append(ctx, v)?;
                }
                assert_eq!(list.len(ctx), 20);
                let last = list.get(ctx, 19)?;
                assert_eq!(read_value(engine.segment(), last).unwrap(), ScalarValue::Int(19));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn set_bumps_version_even_with_unchanged_metadata() {
        let engine = engine("set_version");
        let v0 = new_value(&engine, &ScalarValue::Int(0)).unwrap();
        let list = engine.transaction(|ctx| List::new(ctx, &[v0])).unwrap();

        let version_before = engine.segment().header(list.handle()).version.load();
        engine
            .transaction(|ctx| {
                let v1 = new_value(&engine, &ScalarValue::Int(1))?;
                list.set(ctx, 0, v1)?;
                Ok(())
            })
            .unwrap();
        let version_after = engine.segment().header(list.handle()).version.load();
        assert!(version_after > version_before);
    }

    #[test]
    fn growth_retires_the_superseded_backing_block_for_reclamation() {
        let engine = engine("retire_backing");
        engine
            .transaction(|ctx| {
                let list = List::new(ctx, &[])?;
                for i in 0..(MIN_CAPACITY * 2 + 1) {
                    let v = new_value(&engine, &ScalarValue::Int(i as i64))?;
                    list.append(ctx, v)?;
                }
                Ok(())
            })
            .unwrap();
        // Two growths (4 -> 8 -> 16) retire two superseded backing
        // blocks; both should be queued for reclamation rather than
        // leaked.
        assert_eq!(engine.pending_reclamation(), 2);
    }

    #[test]
    fn reads_observe_writes_from_the_same_transaction() {
        let engine = engine("read_own_write");
        engine
            .transaction(|ctx| {
                let list = List::new(ctx, &[])?;
                let a = new_value(&engine, &ScalarValue::Int(1))?;
                let b = new_value(&engine, &ScalarValue::Int(2))?;
                list.append(ctx, a)?;
                list.append(ctx, b)?;
                assert_eq!(list.get(ctx, 0)?, a);
                assert_eq!(list.get(ctx, 1)?, b);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn append_increfs_the_stored_element_and_set_decrefs_the_displaced_one() {
        let engine = engine("refcount");
        let a = new_value(&engine, &ScalarValue::Int(1)).unwrap();
        let b = new_value(&engine, &ScalarValue::Int(2)).unwrap();
        assert_eq!(engine.segment().header(a).refcount(), 1);

        let list = engine.transaction(|ctx| List::new(ctx, &[a])).unwrap();
        assert_eq!(engine.segment().header(a).refcount(), 2, "list element gained a reference on store");

        engine
            .transaction(|ctx| list.set(ctx, 0, b))
            .unwrap();
        assert_eq!(engine.segment().header(a).refcount(), 1, "displaced element lost the list's reference");
        assert_eq!(engine.segment().header(b).refcount(), 2, "new element gained a reference on store");
    }

    #[test]
    fn rollback_does_not_leave_a_dangling_incref() {
        let engine = engine("refcount_rollback");
        let a = new_value(&engine, &ScalarValue::Int(1)).unwrap();
        let list = engine.transaction(|ctx| List::new(ctx, &[])).unwrap();

        let mut ctx = engine.new_context();
        ctx.begin();
        list.append(&mut ctx, a).unwrap();
        ctx.rollback();
        assert_eq!(engine.segment().header(a).refcount(), 1, "rolled-back append must not leave a dangling incref");
    }
}
