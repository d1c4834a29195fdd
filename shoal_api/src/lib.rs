//! # Shoal API
//!
//! The collaborator-facing facade: the only surface a host-language
//! binding, source-rewriter, or module-globals hook needs to touch.
//! Everything below this crate (`shoal_txn`, `shoal_objects`,
//! `shoal_shm`) takes an explicit `&Engine`/`&mut TransactionContext`;
//! this crate holds both behind process-global and thread-local state
//! so application code never threads them through by hand, matching
//! §5's "per-task state is thread-local, the engine itself is
//! thread-safe" split.
//!
//! One `Engine` exists per process (`init`/`connect` populate a
//! `OnceLock`), and one `TransactionContext` exists per OS thread
//! (`thread_local!`), exactly mirroring the teacher's shared-memory
//! session/participant split one layer down.

pub mod error;

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use shoal_common::config::{ConfigLoader, RuntimeConfig};
use shoal_objects::{List, Map, ScalarValue, ShoalObject};
use shoal_shm::{Handle, Segment};
use shoal_txn::{Engine, TransactionContext, TransientGuard};

pub use error::{ApiError, ApiResult};

static ENGINE: OnceLock<Engine> = OnceLock::new();
static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
static FLINCH_PROBABILITY_BITS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CTX: RefCell<Option<TransactionContext>> = const { RefCell::new(None) };
}

fn engine() -> ApiResult<&'static Engine> {
    ENGINE.get().ok_or(ApiError::NotInitialized)
}

fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::default)
}

fn generate_segment_name() -> String {
    format!("shoal-{}-{}", std::process::id(), rand::thread_rng().gen::<u32>())
}

/// Create a new segment, become its coordinator, allocate and publish
/// the root map, and return the name peers should `connect` with.
pub fn init() -> ApiResult<String> {
    init_with_config(RuntimeConfig::load("shoal.toml")?.apply_env_overrides())
}

/// Like [`init`], but with an explicit config instead of loading
/// `shoal.toml` from the working directory.
pub fn init_with_config(cfg: RuntimeConfig) -> ApiResult<String> {
    cfg.validate()?;
    let name = generate_segment_name();
    let segment = Segment::create(&name, cfg.segment_size)?;
    let engine = Engine::new(std::sync::Arc::new(segment));

    let root = engine.transaction(|ctx| Map::new(ctx).map(|m| m.handle()).map_err(Into::into))?;
    engine.segment().set_root_handle(root);

    set_random_flinch_probability(cfg.random_flinch_probability);
    CONFIG.set(cfg).ok();
    ENGINE
        .set(engine)
        .map_err(|_| ApiError::AlreadyInitialized)?;
    info!(name = %name, "shoal facade initialized (coordinator)");
    Ok(name)
}

/// Attach this process to a segment created elsewhere by [`init`].
/// Blocks briefly (bounded) waiting for the creator to publish the root
/// handle if this process raced the creator's own `init` call.
pub fn connect(name: &str) -> ApiResult<()> {
    let cfg = RuntimeConfig::load("shoal.toml")?.apply_env_overrides();
    let segment = Segment::attach(name)?;
    let engine = Engine::new(std::sync::Arc::new(segment));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while engine.segment().root_handle().is_null() {
        if std::time::Instant::now() >= deadline {
            return Err(ApiError::RootNotPublished);
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    set_random_flinch_probability(cfg.random_flinch_probability);
    CONFIG.set(cfg).ok();
    ENGINE
        .set(engine)
        .map_err(|_| ApiError::AlreadyInitialized)?;
    info!(name = %name, "shoal facade initialized (joiner)");
    Ok(())
}

/// The top-level shared map every other piece of shared state hangs
/// off of.
pub fn root() -> ApiResult<Handle> {
    let handle = engine()?.segment().root_handle();
    if handle.is_null() {
        return Err(ApiError::RootNotPublished);
    }
    Ok(handle)
}

/// Number of participants currently registered in the segment.
pub fn participant_count() -> ApiResult<usize> {
    Ok(engine()?.segment().participant_count())
}

fn with_ctx<T>(mut f: impl FnMut(&mut TransactionContext) -> ApiResult<T>) -> ApiResult<T> {
    let joined = CTX.with(|cell| cell.borrow().as_ref().map(|c| c.active()).unwrap_or(false));
    if joined {
        CTX.with(|cell| {
            let mut slot = cell.borrow_mut();
            f(slot.as_mut().expect("checked active above"))
        })
    } else {
        let eng = engine()?;
        eng.transaction(|ctx| f(ctx).map_err(shoal_txn::TxnError::from))
            .map_err(ApiError::from)
    }
}

// --- Constructors ---------------------------------------------------

/// Box a host primitive. Not transactional: a frozen scalar's payload
/// never changes after construction.
pub fn new_value(value: &ScalarValue) -> ApiResult<Handle> {
    Ok(shoal_objects::new_value(engine()?, value)?)
}

/// Allocate a new ordered list seeded with `elements`.
pub fn new_list(elements: &[Handle]) -> ApiResult<Handle> {
    with_ctx(|ctx| Ok(List::new(ctx, elements)?.handle()))
}

/// Allocate a new keyed map seeded with `entries`.
pub fn new_map(entries: &[(String, Handle)]) -> ApiResult<Handle> {
    with_ctx(|ctx| {
        let map = Map::new(ctx)?;
        let eng = engine()?;
        for (key, value) in entries {
            map.put(eng, ctx, key, *value)?;
        }
        Ok(map.handle())
    })
}

/// Allocate a new frozen tuple holding `elements`, in order.
pub fn new_tuple(elements: &[Handle]) -> ApiResult<Handle> {
    Ok(shoal_objects::new_tuple(engine()?, elements)?.handle())
}

/// Allocate a new user-defined object of `type_name`, with no
/// attributes set.
pub fn new_object(type_name: &str) -> ApiResult<Handle> {
    with_ctx(|ctx| {
        let eng = engine()?;
        Ok(ShoalObject::new(eng, ctx, type_name)?.handle())
    })
}

/// Allocate a new, unfulfilled promise.
pub fn new_promise() -> ApiResult<Handle> {
    Ok(shoal_objects::Promise::new(engine()?)?.handle())
}

// --- Explicit transaction control ------------------------------------

/// Begin a transaction on this task, or join the already-active one if
/// called while nested.
pub fn txn_begin() -> ApiResult<()> {
    let eng = engine()?;
    CTX.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(eng.new_context());
        }
        slot.as_mut().unwrap().begin();
    });
    Ok(())
}

/// Request commit of the outermost transaction on this task. A no-op
/// while nesting depth remains above zero.
pub fn txn_commit() -> ApiResult<()> {
    maybe_flinch();
    let eng = engine()?;
    CTX.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot.as_mut().ok_or(ApiError::NoActiveTransaction)?;
        let result = eng.commit(ctx);
        match &result {
            Ok(()) => debug!(txn = ctx.id(), "commit succeeded"),
            Err(e) if e.is_retryable() => debug!(txn = ctx.id(), error = %e, "commit aborted"),
            Err(e) => warn!(txn = ctx.id(), error = %e, "commit failed (non-retryable)"),
        }
        result.map_err(ApiError::from)
    })
}

/// Discard the current transaction's logs and quarantined allocations.
pub fn txn_rollback() -> ApiResult<()> {
    CTX.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot.as_mut().ok_or(ApiError::NoActiveTransaction)?;
        ctx.rollback();
        Ok(())
    })
}

/// Roll back and immediately re-enter the active state at depth one, so
/// the caller's retry loop can re-run the user region without a fresh
/// `txn_begin`.
pub fn txn_rollback_retaining() -> ApiResult<()> {
    CTX.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot.as_mut().ok_or(ApiError::NoActiveTransaction)?;
        ctx.rollback_retaining();
        Ok(())
    })
}

/// Whether a transaction is currently open on this task.
pub fn txn_active() -> bool {
    CTX.with(|cell| cell.borrow().as_ref().map(|c| c.active()).unwrap_or(false))
}

// --- Escape hatch & diagnostics --------------------------------------

/// Acquire a transient (non-transactional) exclusive region on
/// `handle`. Released by [`transient_end`] or when the returned guard
/// drops.
pub fn transient_begin(handle: Handle) -> ApiResult<TransientGuard<'static>> {
    Ok(engine()?.transient_begin(handle))
}

/// Release a transient region early, instead of waiting for the guard
/// to drop.
pub fn transient_end(guard: TransientGuard<'_>) {
    guard.end();
}

/// Release a reference this process holds on `handle`. Every
/// constructor returns a handle that already carries one reference
/// (§3's "every reachable object's refcount ≥ 1"); a container store
/// (`list.append`, `map.put`, …) adds one more on top. A collaborator
/// that is done with a handle — a source-rewriter-generated local going
/// out of scope, a module-globals slot being overwritten — calls this to
/// give it back. Not itself transactional: refcounts are plain atomic
/// headers, validated by no read or write log, the same as
/// [`get_contention_count`]. Queues `handle` for reclamation once the
/// last reference is gone.
pub fn drop_handle(handle: Handle) -> ApiResult<()> {
    engine()?.decref(handle);
    Ok(())
}

/// `(read_conflicts, write_conflicts)` observed on `handle` so far.
pub fn get_contention_count(handle: Handle) -> ApiResult<(u32, u32)> {
    Ok(engine()?.segment().header(handle).contention_counts())
}

/// Set a per-object debug flag that a future conflict on `handle`
/// should stop the process (host bindings are expected to poll this and
/// break into a debugger; the core only maintains the flag).
pub fn object_debug_stop_on_contention(handle: Handle) -> ApiResult<()> {
    engine()?.segment().header(handle).set_debug_stop_on_contention();
    Ok(())
}

/// Enable or disable random-pause chaos testing. When enabled, roughly
/// one in twenty `txn_commit` calls sleeps a short random interval
/// immediately beforehand, widening the window in which a racing peer
/// can observe (or fail to observe) this transaction's writes.
pub fn set_random_flinch(enabled: bool) {
    let probability = if enabled {
        config().random_flinch_probability.max(0.05)
    } else {
        0.0
    };
    set_random_flinch_probability(probability);
}

fn set_random_flinch_probability(probability: f64) {
    FLINCH_PROBABILITY_BITS.store(probability.to_bits(), Ordering::Relaxed);
}

fn maybe_flinch() {
    let probability = f64::from_bits(FLINCH_PROBABILITY_BITS.load(Ordering::Relaxed));
    if probability <= 0.0 {
        return;
    }
    if rand::thread_rng().gen_bool(probability) {
        let millis = rand::thread_rng().gen_range(1..=20);
        std::thread::sleep(Duration::from_millis(millis));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `ENGINE` is a process-global `OnceLock`, so only one test in this
    // binary may call `init`/`connect` — exercise the whole surface in
    // one test rather than fighting `cargo test`'s default thread-per-test
    // parallelism with a second process-wide initializer.
    #[test]
    fn facade_lifecycle_end_to_end() {
        init().unwrap();

        let handle = root().unwrap();
        assert!(!handle.is_null());

        txn_begin().unwrap();
        assert!(txn_active());
        let value = new_value(&ScalarValue::Int(42)).unwrap();
        let list = new_list(&[value]).unwrap();
        txn_commit().unwrap();
        assert!(!txn_active());
        assert!(!list.is_null());

        let (reads, writes) = get_contention_count(list).unwrap();
        assert_eq!((reads, writes), (0, 0));

        object_debug_stop_on_contention(list).unwrap();
        set_random_flinch(true);
        set_random_flinch(false);

        // §8 seed scenario 5 (reclamation): allocate N objects through
        // the public facade, drop every handle, and check they're queued
        // for reclamation and actually freed once this process's own
        // heartbeat advances past their retirement epoch.
        const RECLAIM_COUNT: usize = 10_000;
        let mut handles = Vec::with_capacity(RECLAIM_COUNT);
        for i in 0..RECLAIM_COUNT {
            handles.push(new_value(&ScalarValue::Int(i as i64)).unwrap());
        }
        for h in handles {
            drop_handle(h).unwrap();
        }

        let eng = engine().unwrap();
        assert_eq!(eng.pending_reclamation(), RECLAIM_COUNT);
        if let Some(idx) = eng.segment().participant_idx() {
            eng.segment().participant_table().entry(idx).unwrap().publish_epoch(u64::MAX);
        }
        assert_eq!(eng.sweep(), RECLAIM_COUNT);
        assert_eq!(eng.pending_reclamation(), 0);
    }
}
