//! Wait/signal promise: a one-shot handoff between processes.
//!
//! A promise's payload embeds a [`shoal_sync::Event`] directly in shared
//! memory (the same "reinterpret the payload bytes in place" approach
//! `Segment::header`/`payload` already use for object headers) alongside
//! the handle of the value it will carry. `signal`/`wait` never go
//! through the transaction log — like [`crate::transient`] escape
//! regions, a promise is a synchronization primitive, not transactional
//! state, and must work even while called from outside any transaction.

use std::time::Duration;

use shoal_shm::{ObjectTag, Segment};
use shoal_sync::{Event, WaitResult};
use shoal_txn::{Engine, TransactionContext, TxnResult};

use crate::error::{ObjectsError, ObjectsResult};

const PAYLOAD_SIZE: usize = 16;

/// A promise: fulfilled once, by one call to [`Promise::signal`];
/// any number of waiters observe the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promise(pub shoal_shm::Handle);

impl Promise {
    /// Allocate a new, unfulfilled promise.
    pub fn new(engine: &Engine) -> TxnResult<Self> {
        let payload = [0u8; PAYLOAD_SIZE];
        let handle = engine.alloc(ObjectTag::Promise, &payload, false)?;
        Ok(Promise(handle))
    }

    /// Wrap an already-allocated promise handle.
    pub fn from_handle(handle: shoal_shm::Handle) -> Self {
        Promise(handle)
    }

    /// This promise's handle.
    pub fn handle(&self) -> shoal_shm::Handle {
        self.0
    }

    fn event<'a>(&self, segment: &'a Segment) -> &'a Event {
        let bytes = segment.payload(self.0);
        debug_assert!(bytes.len() >= PAYLOAD_SIZE);
        unsafe { &*(bytes.as_ptr() as *const Event) }
    }

    /// Whether the promise has already been fulfilled.
    pub fn is_signaled(&self, segment: &Segment) -> bool {
        self.event(segment).is_signaled()
    }

    /// Fulfill the promise with `value`. Idempotent: only the first
    /// call's value is observed by waiters, matching [`Event::signal`]'s
    /// own idempotency.
    pub fn signal(&self, segment: &Segment, value: shoal_shm::Handle) -> bool {
        let bytes = segment.payload_mut(self.0);
        bytes[8..16].copy_from_slice(&value.raw().to_le_bytes());
        self.event(segment).signal()
    }

    /// Block until fulfilled or `timeout` elapses, returning the
    /// fulfilled value. Errors with [`ObjectsError::WaitInsideTransaction`]
    /// if called while `ctx` has an open transaction — blocking inside a
    /// transaction would stall the engine's optimistic retry loop
    /// indefinitely.
    pub fn wait(
        &self,
        ctx: &TransactionContext,
        segment: &Segment,
        timeout: Option<Duration>,
    ) -> ObjectsResult<shoal_shm::Handle> {
        if ctx.active() {
            return Err(ObjectsError::WaitInsideTransaction);
        }
        match self.event(segment).wait(timeout) {
            WaitResult::Signaled => {
                let bytes = segment.payload(self.0);
                Ok(shoal_shm::Handle::from_raw(u64::from_le_bytes(bytes[8..16].try_into().unwrap())))
            }
            WaitResult::Timeout => Err(ObjectsError::WaitTimedOut),
            WaitResult::Interrupted => Err(ObjectsError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{new_value, read_value, ScalarValue};
    use shoal_common::consts::SEGMENT_MIN_SIZE;
    use shoal_shm::Segment as ShmSegment;
    use std::sync::Arc;
    use std::thread;

    fn engine(tag: &str) -> Engine {
        let name = format!("test_promise_{tag}_{}", std::process::id());
        let segment = ShmSegment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        Engine::new(Arc::new(segment))
    }

    #[test]
    fn signal_then_wait_returns_the_value_immediately() {
        let engine = engine("basic");
        let promise = Promise::new(&engine).unwrap();
        let value = new_value(&engine, &ScalarValue::Int(7)).unwrap();
        promise.signal(engine.segment(), value);

        let ctx = engine.new_context();
        let got = promise.wait(&ctx, engine.segment(), Some(Duration::from_millis(10))).unwrap();
        assert_eq!(read_value(engine.segment(), got).unwrap(), ScalarValue::Int(7));
    }

    #[test]
    fn second_signal_does_not_change_the_observed_value() {
        let engine = engine("idempotent");
        let promise = Promise::new(&engine).unwrap();
        let first = new_value(&engine, &ScalarValue::Int(1)).unwrap();
        let second = new_value(&engine, &ScalarValue::Int(2)).unwrap();
        promise.signal(engine.segment(), first);
        promise.signal(engine.segment(), second);

        let ctx = engine.new_context();
        let got = promise.wait(&ctx, engine.segment(), Some(Duration::from_millis(10))).unwrap();
        assert_eq!(got, first);
    }

    #[test]
    fn waiter_wakes_on_concurrent_signal() {
        let engine = engine("wakes");
        let promise = Promise::new(&engine).unwrap();
        let segment = Arc::clone(engine.segment());
        let waiter = {
            let promise = promise;
            let segment = Arc::clone(&segment);
            thread::spawn(move || {
                let ctx = TransactionContext::new(segment.clone());
                promise.wait(&ctx, &segment, Some(Duration::from_secs(5)))
            })
        };
        thread::sleep(Duration::from_millis(20));
        let value = new_value(&engine, &ScalarValue::Bool(true)).unwrap();
        promise.signal(engine.segment(), value);
        assert_eq!(waiter.join().unwrap().unwrap(), value);
    }

    #[test]
    fn wait_rejects_being_called_inside_a_transaction() {
        let engine = engine("reject");
        let promise = Promise::new(&engine).unwrap();
        let mut ctx = engine.new_context();
        ctx.begin();
        let result = promise.wait(&ctx, engine.segment(), Some(Duration::from_millis(1)));
        assert!(matches!(result, Err(ObjectsError::WaitInsideTransaction)));
    }
}
