//! Scalar box (`ShmValue`): an immutable, frozen payload holding one of
//! the host's primitive kinds.
//!
//! Construction and reads never go through a transaction's read/write
//! log — a frozen object's payload cannot change after `new_value`, so
//! there is nothing for the commit protocol to validate.

use shoal_shm::{Handle, ObjectTag, Segment};
use shoal_txn::{Engine, TxnResult};

use crate::error::{ObjectsError, ObjectsResult};

/// A host primitive, boxed for shared storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Str(String),
}

const KIND_NONE: u8 = 0;
const KIND_INT: u8 = 1;
const KIND_FLOAT: u8 = 2;
const KIND_BOOL: u8 = 3;
const KIND_BYTES: u8 = 4;
const KIND_STR: u8 = 5;

impl ScalarValue {
    fn encode(&self) -> Vec<u8> {
        match self {
            ScalarValue::None => vec![KIND_NONE],
            ScalarValue::Int(v) => {
                let mut out = vec![KIND_INT];
                out.extend_from_slice(&v.to_le_bytes());
                out
            }
            ScalarValue::Float(v) => {
                let mut out = vec![KIND_FLOAT];
                out.extend_from_slice(&v.to_le_bytes());
                out
            }
            ScalarValue::Bool(v) => vec![KIND_BOOL, *v as u8],
            ScalarValue::Bytes(v) => {
                let mut out = vec![KIND_BYTES];
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v);
                out
            }
            ScalarValue::Str(v) => {
                let mut out = vec![KIND_STR];
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
                out
            }
        }
    }

    fn decode(bytes: &[u8]) -> ObjectsResult<Self> {
        let (&kind, rest) = bytes.split_first().ok_or(ObjectsError::CorruptScalar)?;
        match kind {
            KIND_NONE => Ok(ScalarValue::None),
            KIND_INT => {
                let arr: [u8; 8] = rest.try_into().map_err(|_| ObjectsError::CorruptScalar)?;
                Ok(ScalarValue::Int(i64::from_le_bytes(arr)))
            }
            KIND_FLOAT => {
                let arr: [u8; 8] = rest.try_into().map_err(|_| ObjectsError::CorruptScalar)?;
                Ok(ScalarValue::Float(f64::from_le_bytes(arr)))
            }
            KIND_BOOL => Ok(ScalarValue::Bool(*rest.first().ok_or(ObjectsError::CorruptScalar)? != 0)),
            KIND_BYTES => {
                let len = u32_prefix(rest)?;
                Ok(ScalarValue::Bytes(rest[4..4 + len].to_vec()))
            }
            KIND_STR => {
                let len = u32_prefix(rest)?;
                let s = std::str::from_utf8(&rest[4..4 + len]).map_err(|_| ObjectsError::CorruptScalar)?;
                Ok(ScalarValue::Str(s.to_string()))
            }
            _ => Err(ObjectsError::CorruptScalar),
        }
    }
}

fn u32_prefix(rest: &[u8]) -> ObjectsResult<usize> {
    let arr: [u8; 4] = rest.get(0..4).ok_or(ObjectsError::CorruptScalar)?.try_into().unwrap();
    let len = u32::from_le_bytes(arr) as usize;
    if rest.len() < 4 + len {
        return Err(ObjectsError::CorruptScalar);
    }
    Ok(len)
}

/// Construct a new frozen scalar box, outside the transactional
/// read/write log (nothing can race with a handle not yet shared).
pub fn new_value(engine: &Engine, value: &ScalarValue) -> TxnResult<Handle> {
    engine.alloc(ObjectTag::Scalar, &value.encode(), true)
}

/// Read a scalar's value. Safe to call inside or outside a transaction:
/// frozen payloads never change, so there's no version to validate.
pub fn read_value(segment: &Segment, handle: Handle) -> ObjectsResult<ScalarValue> {
    ScalarValue::decode(segment.payload(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::consts::SEGMENT_MIN_SIZE;
    use shoal_shm::Segment as ShmSegment;
    use std::sync::Arc;

    fn engine(tag: &str) -> Engine {
        let name = format!("test_value_{tag}_{}", std::process::id());
        let segment = ShmSegment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        Engine::new(Arc::new(segment))
    }

    #[test]
    fn round_trips_every_scalar_kind() {
        let engine = engine("roundtrip");
        for value in [
            ScalarValue::None,
            ScalarValue::Int(-42),
            ScalarValue::Float(3.25),
            ScalarValue::Bool(true),
            ScalarValue::Bytes(vec![1, 2, 3]),
            ScalarValue::Str("hello shoal".to_string()),
        ] {
            let handle = new_value(&engine, &value).unwrap();
            assert_eq!(read_value(engine.segment(), handle).unwrap(), value);
        }
    }

    #[test]
    fn scalar_is_frozen() {
        let engine = engine("frozen");
        let handle = new_value(&engine, &ScalarValue::Int(1)).unwrap();
        assert!(engine.segment().header(handle).flags().contains(shoal_shm::HeaderFlags::FROZEN));
    }
}
