//! Keyed map: a segment-allocated open-addressed hash table from string
//! keys to element handles.
//!
//! Keys are themselves boxed [`crate::value::ScalarValue::Str`] handles
//! (so the slot table stays fixed-width) rather than inline bytes;
//! comparisons read the pointed-to scalar. Slots live in a bare backing
//! block the map owns exclusively, grown the same way `List` grows its
//! backing array: allocate new, rehash everything, retire the old block.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use shoal_shm::{Handle, ObjectTag};
use shoal_txn::TransactionContext;

use crate::error::{ObjectsError, ObjectsResult};
use crate::value::{new_value, read_value, ScalarValue};
use shoal_txn::Engine;

const SLOT_SIZE: usize = 24;
const META_SIZE: usize = 24;
const MIN_SLOTS: u64 = 8;
const MAX_LOAD_NUM: u64 = 3;
const MAX_LOAD_DEN: u64 = 4;

const SLOT_EMPTY: u64 = 0;
const SLOT_OCCUPIED: u64 = 1;
const SLOT_TOMBSTONE: u64 = 2;

fn encode_meta(len: u64, slots: u64, backing_offset: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(META_SIZE);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&slots.to_le_bytes());
    out.extend_from_slice(&backing_offset.to_le_bytes());
    out
}

fn decode_meta(bytes: &[u8]) -> (u64, u64, u64) {
    let len = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let slots = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let backing_offset = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    (len, slots, backing_offset)
}

fn encode_slot(state: u64, key: Handle, value: Handle) -> [u8; SLOT_SIZE] {
    let mut out = [0u8; SLOT_SIZE];
    out[0..8].copy_from_slice(&state.to_le_bytes());
    out[8..16].copy_from_slice(&key.raw().to_le_bytes());
    out[16..24].copy_from_slice(&value.raw().to_le_bytes());
    out
}

fn decode_slot(bytes: &[u8]) -> (u64, Handle, Handle) {
    let state = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let key = Handle::from_raw(u64::from_le_bytes(bytes[8..16].try_into().unwrap()));
    let value = Handle::from_raw(u64::from_le_bytes(bytes[16..24].try_into().unwrap()));
    (state, key, value)
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A transactional keyed map. The wrapped handle is its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Map(pub Handle);

impl Map {
    /// Allocate a new, empty map.
    pub fn new(ctx: &mut TransactionContext) -> ObjectsResult<Self> {
        let slots = MIN_SLOTS;
        let backing_size = slots as usize * SLOT_SIZE;
        let backing_offset = ctx.segment().alloc_raw(backing_size)?;
        {
            let dest = ctx.segment().write_raw(backing_offset, backing_size);
            dest.fill(0);
        }
        ctx.record_raw_allocation(backing_offset, backing_size);

        let meta = encode_meta(0, slots, backing_offset);
        let handle = ctx.segment().alloc_object(ObjectTag::Map, &meta, false)?;
        ctx.record_allocation(handle);
        Ok(Map(handle))
    }

    /// Wrap an already-allocated map handle.
    pub fn from_handle(handle: Handle) -> Self {
        Map(handle)
    }

    /// This map's handle.
    pub fn handle(&self) -> Handle {
        self.0
    }

    fn meta(&self, ctx: &mut TransactionContext) -> (u64, u64, u64) {
        decode_meta(&ctx.read(self.0))
    }

    /// Number of keys currently present.
    pub fn len(&self, ctx: &mut TransactionContext) -> u64 {
        self.meta(ctx).0
    }

    /// Whether the map has no keys.
    pub fn is_empty(&self, ctx: &mut TransactionContext) -> bool {
        self.len(ctx) == 0
    }

    fn slot_bytes(&self, ctx: &mut TransactionContext, backing_offset: u64, slots: u64, index: u64) -> Vec<u8> {
        debug_assert!(index < slots);
        ctx.read_raw(backing_offset + index * SLOT_SIZE as u64, SLOT_SIZE)
    }

    fn find_slot(
        &self,
        ctx: &mut TransactionContext,
        backing_offset: u64,
        slots: u64,
        key: &str,
    ) -> ObjectsResult<(u64, bool)> {
        let start = hash_key(key) % slots;
        let mut first_tombstone: Option<u64> = None;
        for probe in 0..slots {
            let index = (start + probe) % slots;
            let bytes = self.slot_bytes(ctx, backing_offset, slots, index);
            let (state, key_handle, _value_handle) = decode_slot(&bytes);
            match state {
                SLOT_EMPTY => {
                    return Ok((first_tombstone.unwrap_or(index), false));
                }
                SLOT_TOMBSTONE => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                SLOT_OCCUPIED => {
                    if let ScalarValue::Str(existing) = read_value(ctx.segment(), key_handle)? {
                        if existing == key {
                            return Ok((index, true));
                        }
                    }
                }
                _ => unreachable!("corrupt map slot state"),
            }
        }
        Err(ObjectsError::KeyNotFound)
    }

    /// Look up `key`, returning its element handle if present.
    pub fn get(&self, ctx: &mut TransactionContext, key: &str) -> ObjectsResult<Handle> {
        let (_len, slots, backing_offset) = self.meta(ctx);
        let (index, found) = self.find_slot(ctx, backing_offset, slots, key)?;
        if !found {
            return Err(ObjectsError::KeyNotFound);
        }
        let bytes = self.slot_bytes(ctx, backing_offset, slots, index);
        Ok(decode_slot(&bytes).2)
    }

    /// Whether `key` is present.
    pub fn contains(&self, ctx: &mut TransactionContext, key: &str) -> ObjectsResult<bool> {
        match self.get(ctx, key) {
            Ok(_) => Ok(true),
            Err(ObjectsError::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Insert or replace the value for `key`. Increfs `value` (the map
    /// now owns a reference to it) and, when replacing an existing key,
    /// decrefs the value it displaces. A freshly allocated key scalar
    /// needs no incref of its own — the map is its only owner from the
    /// moment [`new_value`] creates it.
    pub fn put(&self, engine: &Engine, ctx: &mut TransactionContext, key: &str, value: Handle) -> ObjectsResult<()> {
        let (len, slots, backing_offset) = self.meta(ctx);
        if (len + 1) * MAX_LOAD_DEN > slots * MAX_LOAD_NUM {
            self.grow(engine, ctx, slots, backing_offset, len)?;
        }
        let (len, slots, backing_offset) = self.meta(ctx);

        let (index, found) = self.find_slot(ctx, backing_offset, slots, key)?;

        let (key_handle, old_value) = if found {
            let (_, k, v) = decode_slot(&self.slot_bytes(ctx, backing_offset, slots, index));
            (k, Some(v))
        } else {
            (new_value(engine, &ScalarValue::Str(key.to_string()))?, None)
        };
        let slot = encode_slot(SLOT_OCCUPIED, key_handle, value);
        ctx.stage_raw_write(backing_offset + index * SLOT_SIZE as u64, slot.to_vec());
        let new_len = if found { len } else { len + 1 };
        ctx.write(self.0, encode_meta(new_len, slots, backing_offset));
        ctx.stage_incref(value);
        if let Some(old) = old_value {
            ctx.stage_decref(old);
        }
        Ok(())
    }

    /// Remove `key`, returning its element handle. Decrefs the key
    /// scalar — solely owned by the map since `put` created it — but
    /// transfers the map's reference on the value to the caller rather
    /// than decrefing it, the same ownership-transfer convention
    /// [`crate::list::List::pop_front`] uses.
    pub fn delete(&self, ctx: &mut TransactionContext, key: &str) -> ObjectsResult<Handle> {
        let (len, slots, backing_offset) = self.meta(ctx);
        let (index, found) = self.find_slot(ctx, backing_offset, slots, key)?;
        if !found {
            return Err(ObjectsError::KeyNotFound);
        }
        let (_, key_handle, value_handle) = decode_slot(&self.slot_bytes(ctx, backing_offset, slots, index));
        let tombstone = encode_slot(SLOT_TOMBSTONE, Handle::NULL, Handle::NULL);
        ctx.stage_raw_write(backing_offset + index * SLOT_SIZE as u64, tombstone.to_vec());
        ctx.write(self.0, encode_meta(len - 1, slots, backing_offset));
        ctx.stage_decref(key_handle);
        Ok(value_handle)
    }

    /// Snapshot of every key currently present, decoded to owned strings.
    pub fn iter_keys(&self, ctx: &mut TransactionContext) -> ObjectsResult<Vec<String>> {
        let (_len, slots, backing_offset) = self.meta(ctx);
        let mut keys = Vec::new();
        for index in 0..slots {
            let bytes = self.slot_bytes(ctx, backing_offset, slots, index);
            let (state, key_handle, _value_handle) = decode_slot(&bytes);
            if state == SLOT_OCCUPIED {
                if let ScalarValue::Str(k) = read_value(ctx.segment(), key_handle)? {
                    keys.push(k);
                }
            }
        }
        Ok(keys)
    }

    /// Snapshot of every element handle currently present.
    pub fn iter_values(&self, ctx: &mut TransactionContext) -> ObjectsResult<Vec<Handle>> {
        let (_len, slots, backing_offset) = self.meta(ctx);
        let mut values = Vec::new();
        for index in 0..slots {
            let bytes = self.slot_bytes(ctx, backing_offset, slots, index);
            let (state, _key_handle, value_handle) = decode_slot(&bytes);
            if state == SLOT_OCCUPIED {
                values.push(value_handle);
            }
        }
        Ok(values)
    }

    fn grow(
        &self,
        _engine: &Engine,
        ctx: &mut TransactionContext,
        old_slots: u64,
        old_backing: u64,
        old_len: u64,
    ) -> ObjectsResult<()> {
        let new_slots = (old_slots * 2).max(MIN_SLOTS);
        let new_size = new_slots as usize * SLOT_SIZE;
        let new_backing = ctx.segment().alloc_raw(new_size)?;
        {
            let dest = ctx.segment().write_raw(new_backing, new_size);
            dest.fill(0);
        }
        ctx.record_raw_allocation(new_backing, new_size);

        for index in 0..old_slots {
            let bytes = ctx.read_raw(old_backing + index * SLOT_SIZE as u64, SLOT_SIZE);
            let (state, key_handle, value_handle) = decode_slot(&bytes);
            if state != SLOT_OCCUPIED {
                continue;
            }
            let key = match read_value(ctx.segment(), key_handle)? {
                ScalarValue::Str(s) => s,
                _ => return Err(ObjectsError::CorruptScalar),
            };
            let start = hash_key(&key) % new_slots;
            let mut placed = false;
            for probe in 0..new_slots {
                let candidate = (start + probe) % new_slots;
                let existing = ctx.read_raw(new_backing + candidate * SLOT_SIZE as u64, SLOT_SIZE);
                if decode_slot(&existing).0 == SLOT_EMPTY {
                    let slot = encode_slot(SLOT_OCCUPIED, key_handle, value_handle);
                    let dest = ctx.segment().write_raw(new_backing + candidate * SLOT_SIZE as u64, SLOT_SIZE);
                    dest.copy_from_slice(&slot);
                    placed = true;
                    break;
                }
            }
            debug_assert!(placed, "rehash must always find a free slot in a freshly grown table");
        }

        ctx.retire_raw(old_backing, old_slots as usize * SLOT_SIZE);
        ctx.write(self.0, encode_meta(old_len, new_slots, new_backing));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;
    use shoal_common::consts::SEGMENT_MIN_SIZE;
    use shoal_shm::Segment;
    use std::sync::Arc;

    fn engine(tag: &str) -> Engine {
        let name = format!("test_map_{tag}_{}", std::process::id());
        let segment = Segment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        Engine::new(Arc::new(segment))
    }

    #[test]
    fn put_get_delete_round_trip() {
        let engine = engine("basic");
        engine
            .transaction(|ctx| {
                let map = Map::new(ctx)?;
                let v = new_value(&engine, &ScalarValue::Int(9))?;
                map.put(&engine, ctx, "alpha", v)?;
                assert_eq!(map.get(ctx, "alpha")?, v);
                assert!(map.contains(ctx, "alpha")?);
                map.delete(ctx, "alpha")?;
                assert!(!map.contains(ctx, "alpha")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn grows_past_load_factor_and_keeps_every_key() {
        let engine = engine("grow");
        engine
            .transaction(|ctx| {
                let map = Map::new(ctx)?;
                for i in 0..40 {
                    let v = new_value(&engine, &ScalarValue::Int(i))?;
                    map.put(&engine, ctx, &format!("key-{i}"), v)?;
                }
                assert_eq!(map.len(ctx), 40);
                for i in 0..40 {
                    let v = map.get(ctx, &format!("key-{i}"))?;
                    assert_eq!(read_value(engine.segment(), v).unwrap(), ScalarValue::Int(i));
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn rehash_growth_retires_the_old_table_for_reclamation() {
        let engine = engine("retire_table");
        engine
            .transaction(|ctx| {
                let map = Map::new(ctx)?;
                for i in 0..40 {
                    let v = new_value(&engine, &ScalarValue::Int(i))?;
                    map.put(&engine, ctx, &format!("key-{i}"), v)?;
                }
                Ok(())
            })
            .unwrap();
        assert!(engine.pending_reclamation() > 0, "rehashes must retire their superseded backing tables");
    }

    #[test]
    fn put_replaces_existing_key_without_growing_len() {
        let engine = engine("replace");
        engine
            .transaction(|ctx| {
                let map = Map::new(ctx)?;
                let a = new_value(&engine, &ScalarValue::Int(1))?;
                let b = new_value(&engine, &ScalarValue::Int(2))?;
                map.put(&engine, ctx, "k", a)?;
                map.put(&engine, ctx, "k", b)?;
                assert_eq!(map.len(ctx), 1);
                assert_eq!(map.get(ctx, "k")?, b);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn put_increfs_the_stored_value_and_decrefs_a_displaced_one() {
        let engine = engine("refcount");
        let a = new_value(&engine, &ScalarValue::Int(1)).unwrap();
        let b = new_value(&engine, &ScalarValue::Int(2)).unwrap();
        assert_eq!(engine.segment().header(a).refcount(), 1);

        let map = engine.transaction(|ctx| Map::new(ctx)).unwrap();
        engine.transaction(|ctx| map.put(&engine, ctx, "k", a)).unwrap();
        assert_eq!(engine.segment().header(a).refcount(), 2, "map value gained a reference on put");

        engine.transaction(|ctx| map.put(&engine, ctx, "k", b)).unwrap();
        assert_eq!(engine.segment().header(a).refcount(), 1, "replaced value lost the map's reference");
        assert_eq!(engine.segment().header(b).refcount(), 2, "new value gained a reference on put");
    }

    #[test]
    fn delete_transfers_the_map_value_reference_to_the_caller() {
        let engine = engine("delete_refcount");
        let v = new_value(&engine, &ScalarValue::Int(7)).unwrap();

        let map = engine.transaction(|ctx| Map::new(ctx)).unwrap();
        engine.transaction(|ctx| map.put(&engine, ctx, "k", v)).unwrap();
        assert_eq!(engine.segment().header(v).refcount(), 2);

        let returned = engine.transaction(|ctx| map.delete(ctx, "k")).unwrap();
        assert_eq!(returned, v);
        assert_eq!(
            engine.segment().header(v).refcount(),
            2,
            "delete transfers the map's value reference to the caller rather than decrefing it"
        );
    }
}
