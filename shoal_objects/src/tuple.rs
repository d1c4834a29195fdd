//! Tuple: a fixed-length, immutable sequence of element handles.
//!
//! Constructed atomically and frozen, exactly like
//! [`crate::value::ScalarValue`] — once built its payload never changes,
//! so reads bypass the transactional log entirely.

use shoal_shm::{Handle, ObjectTag, Segment};
use shoal_txn::{Engine, TxnResult};

/// A frozen, fixed-length sequence of element handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple(pub Handle);

/// Allocate a new tuple holding exactly `elements`, in order. Frozen
/// immediately — there is no `set`; a changed tuple is a new tuple.
/// Increfs every element: the tuple holds a permanent reference to each
/// for as long as it exists, with nothing to ever release it back.
pub fn new_tuple(engine: &Engine, elements: &[Handle]) -> TxnResult<Tuple> {
    let mut payload = Vec::with_capacity(elements.len() * 8);
    for h in elements {
        payload.extend_from_slice(&h.raw().to_le_bytes());
    }
    let handle = engine.alloc(ObjectTag::Tuple, &payload, true)?;
    for h in elements {
        if !h.is_null() {
            engine.segment().header(*h).incref();
        }
    }
    Ok(Tuple(handle))
}

impl Tuple {
    /// This tuple's handle.
    pub fn handle(&self) -> Handle {
        self.0
    }

    /// Number of elements.
    pub fn len(&self, segment: &Segment) -> usize {
        segment.payload(self.0).len() / 8
    }

    /// Whether the tuple has no elements.
    pub fn is_empty(&self, segment: &Segment) -> bool {
        self.len(segment) == 0
    }

    /// Element at `index`, or `None` if out of range.
    pub fn get(&self, segment: &Segment, index: usize) -> Option<Handle> {
        let bytes = segment.payload(self.0);
        let start = index * 8;
        let chunk = bytes.get(start..start + 8)?;
        Some(Handle::from_raw(u64::from_le_bytes(chunk.try_into().unwrap())))
    }

    /// Every element, in order.
    pub fn elements(&self, segment: &Segment) -> Vec<Handle> {
        segment
            .payload(self.0)
            .chunks_exact(8)
            .map(|chunk| Handle::from_raw(u64::from_le_bytes(chunk.try_into().unwrap())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{new_value, ScalarValue};
    use shoal_common::consts::SEGMENT_MIN_SIZE;
    use shoal_shm::{HeaderFlags, Segment as ShmSegment};
    use std::sync::Arc;

    fn engine(tag: &str) -> Engine {
        let name = format!("test_tuple_{tag}_{}", std::process::id());
        let segment = ShmSegment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        Engine::new(Arc::new(segment))
    }

    #[test]
    fn holds_elements_in_order_and_is_frozen() {
        let engine = engine("basic");
        let a = new_value(&engine, &ScalarValue::Int(1)).unwrap();
        let b = new_value(&engine, &ScalarValue::Str("two".to_string())).unwrap();
        let tuple = new_tuple(&engine, &[a, b]).unwrap();

        assert_eq!(tuple.len(engine.segment()), 2);
        assert_eq!(tuple.get(engine.segment(), 0), Some(a));
        assert_eq!(tuple.get(engine.segment(), 1), Some(b));
        assert_eq!(tuple.get(engine.segment(), 2), None);
        assert!(engine
            .segment()
            .header(tuple.handle())
            .flags()
            .contains(HeaderFlags::FROZEN));
    }
}
