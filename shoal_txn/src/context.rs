//! Per-task transaction context: state machine, read/write logs, nesting
//! depth, and the quarantine of allocations made during the transaction.
//!
//! One [`TransactionContext`] exists per task (§5: "per-task state is
//! thread-local"). It is never shared between tasks; the facade crate
//! keeps one behind a thread-local so application code never threads it
//! through explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shoal_shm::{Handle, Segment};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`TransactionContext`], mirroring §4.5's state
/// machine exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// No transaction is open.
    Idle,
    /// A transaction is open and accepting reads/writes.
    Active,
    /// `commit_request` has been issued by the outermost scope and the
    /// commit protocol is running.
    Committing,
    /// The outermost commit succeeded.
    Committed,
    /// The transaction aborted, either on conflict or explicit rollback.
    Aborted,
}

/// One entry in the read log: the version observed the first time this
/// handle was read inside the transaction.
#[derive(Debug, Clone, Copy)]
pub struct ReadEntry {
    pub handle: Handle,
    pub observed_version: u64,
}

/// One entry in the write log: the payload this transaction intends to
/// publish for `handle` at commit. Payload length must equal the
/// object's allocated payload size — every mutable shared type in
/// `shoal_objects` keeps a fixed-size metadata payload for exactly this
/// reason, growing into separately allocated backing storage instead of
/// resizing its own header.
#[derive(Debug, Clone)]
pub struct WriteEntry {
    pub handle: Handle,
    pub new_payload: Vec<u8>,
}

/// A staged patch to a bare backing-storage block (a list/map element
/// slot), applied at commit alongside its owning container's metadata
/// write. Safe without its own lock because every caller is required to
/// also stage a write on the container's own handle — that write is
/// what the commit protocol locks and validates, and it rides along in
/// the same phase.
#[derive(Debug, Clone)]
pub struct RawWrite {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Per-task transaction state: read log, write log, nesting depth, and
/// the list of objects allocated during this transaction (quarantined
/// until commit or rollback resolves their fate).
pub struct TransactionContext {
    pub(crate) segment: Arc<Segment>,
    pub(crate) id: u64,
    pub(crate) state: TxnState,
    pub(crate) depth: u32,
    /// First-observed version per handle, shared by reads and writes so
    /// a blind write still has a version to validate against at commit.
    pub(crate) observed: HashMap<Handle, u64>,
    pub(crate) read_log: Vec<ReadEntry>,
    pub(crate) write_log: HashMap<Handle, WriteEntry>,
    pub(crate) raw_writes: Vec<RawWrite>,
    pub(crate) allocations: Vec<Handle>,
    /// Bare backing-storage blocks allocated speculatively during this
    /// attempt (container growth), quarantined the same way `allocations`
    /// is: freed on rollback, retained on commit.
    pub(crate) raw_allocations: Vec<(u64, usize)>,
    /// Bare backing-storage blocks superseded during this attempt (a
    /// list/map backing array retired by growth). The mirror image of
    /// `raw_allocations`: kept alive on rollback (the growth that would
    /// have superseded them never took effect), handed to the engine's
    /// epoch-tagged reclamation queue on commit so a transaction still
    /// mid-read of the old block isn't freed out from under it.
    pub(crate) retiring_raw: Vec<(u64, usize)>,
    /// Handles that gained a reachable owner this attempt (stored into a
    /// container's element/value/key slot). Applied after a successful
    /// commit via `ObjectHeader::incref`; dropped on rollback since the
    /// store that would have created the ownership never took effect.
    pub(crate) pending_increfs: Vec<Handle>,
    /// Handles that lost a reachable owner this attempt (overwritten or
    /// tombstoned out of a container). Applied after a successful commit
    /// via the engine's decref-and-maybe-reclaim path; dropped on
    /// rollback since the container still holds its old reference.
    pub(crate) pending_decrefs: Vec<Handle>,
    pub(crate) retry_count: u32,
}

impl TransactionContext {
    /// Construct a fresh, idle context bound to `segment`.
    pub fn new(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            id: 0,
            state: TxnState::Idle,
            depth: 0,
            observed: HashMap::new(),
            read_log: Vec::new(),
            write_log: HashMap::new(),
            raw_writes: Vec::new(),
            allocations: Vec::new(),
            raw_allocations: Vec::new(),
            retiring_raw: Vec::new(),
            pending_increfs: Vec::new(),
            pending_decrefs: Vec::new(),
            retry_count: 0,
        }
    }

    /// Whether a transaction is currently open (active or in the middle
    /// of committing) — `txn_active` in the external interface.
    pub fn active(&self) -> bool {
        matches!(self.state, TxnState::Active | TxnState::Committing)
    }

    /// Current nesting depth. Zero when idle.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// This attempt's transaction id, assigned on the first `begin` of
    /// each attempt (bumped again on `restart_retaining`).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The segment this context is bound to. Container wrappers in
    /// `shoal_objects` use this for bare backing-storage access
    /// (`alloc_raw`/`read_raw`/`write_raw`), which falls outside the
    /// handle-and-header read/write log this context otherwise mediates.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// How many times this logical transaction has been retried.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Begin a transaction, or join the already-active one if called
    /// while nested (depth > 0), per the "nested begin joins the outer"
    /// rule.
    pub fn begin(&mut self) {
        if self.depth == 0 {
            self.id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
            self.state = TxnState::Active;
        }
        self.depth += 1;
    }

    /// Record (or return the shadowed value of) a read. Returns the
    /// value this transaction should observe: its own pending write if
    /// one exists, otherwise the currently committed payload.
    pub fn read(&mut self, handle: Handle) -> Vec<u8> {
        if let Some(write) = self.write_log.get(&handle) {
            return write.new_payload.clone();
        }
        let version = *self
            .observed
            .entry(handle)
            .or_insert_with(|| self.segment.header(handle).version.load());
        if !self.read_log.iter().any(|e| e.handle == handle) {
            self.read_log.push(ReadEntry {
                handle,
                observed_version: version,
            });
        }
        self.segment.payload(handle).to_vec()
    }

    /// Stage a write. The object is not locked yet — other transactions
    /// continue to observe the old committed value until this
    /// transaction's outermost commit succeeds.
    pub fn write(&mut self, handle: Handle, new_payload: Vec<u8>) {
        self.observed
            .entry(handle)
            .or_insert_with(|| self.segment.header(handle).version.load());
        self.write_log.insert(handle, WriteEntry { handle, new_payload });
    }

    /// Record a freshly allocated object as quarantined: invisible to
    /// other transactions' reads (nothing references it yet) and freed
    /// on rollback unless it was attached to the shared graph by a write
    /// that itself commits.
    pub fn record_allocation(&mut self, handle: Handle) {
        self.allocations.push(handle);
    }

    /// Record a speculatively allocated bare backing-storage block (a
    /// grown list/map backing array) so rollback can free it. Commit
    /// retains it — by construction it's only reachable because a write
    /// in this same transaction's log points at it.
    pub fn record_raw_allocation(&mut self, offset: u64, size: usize) {
        self.raw_allocations.push((offset, size));
    }

    /// Record a bare backing-storage block superseded by this attempt's
    /// growth (the old array a list `append` or map rehash just copied
    /// out of and replaced). Freed via the reclamation queue on commit,
    /// left alone on rollback.
    pub fn retire_raw(&mut self, offset: u64, size: usize) {
        self.retiring_raw.push((offset, size));
    }

    /// Take this attempt's retired bare blocks for the engine to enqueue
    /// on the reclamation queue after a successful commit.
    pub(crate) fn take_retiring_raw(&mut self) -> Vec<(u64, usize)> {
        std::mem::take(&mut self.retiring_raw)
    }

    /// Record that `handle` gained a reachable owner this attempt — a
    /// container store (list element, map key/value, tuple element,
    /// object attribute). A no-op for [`Handle::NULL`]. Applied on commit,
    /// discarded on rollback.
    pub fn stage_incref(&mut self, handle: Handle) {
        if !handle.is_null() {
            self.pending_increfs.push(handle);
        }
    }

    /// Record that `handle` lost a reachable owner this attempt — a
    /// container overwrite or a tombstoned key. A no-op for
    /// [`Handle::NULL`]. Applied on commit, discarded on rollback.
    pub fn stage_decref(&mut self, handle: Handle) {
        if !handle.is_null() {
            self.pending_decrefs.push(handle);
        }
    }

    /// Take this attempt's staged increfs for the engine to apply after a
    /// successful commit.
    pub(crate) fn take_pending_increfs(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.pending_increfs)
    }

    /// Take this attempt's staged decrefs for the engine to apply (and
    /// possibly queue for reclamation) after a successful commit.
    pub(crate) fn take_pending_decrefs(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.pending_decrefs)
    }

    /// Stage a patch to a bare backing-storage block, applied at commit
    /// time right after this context's ordinary object writes. The
    /// caller must also stage a write on the owning container's own
    /// handle in the same transaction — that's what gates visibility and
    /// conflict detection for this patch.
    pub fn stage_raw_write(&mut self, offset: u64, data: Vec<u8>) {
        self.raw_writes.push(RawWrite { offset, data });
    }

    /// Read `size` bytes at a bare backing-storage offset, shadowed by
    /// any patch this same transaction has already staged there — the
    /// read-your-own-writes counterpart of [`TransactionContext::read`]
    /// for container backing arrays, which don't go through the
    /// handle-keyed write log.
    pub fn read_raw(&self, offset: u64, size: usize) -> Vec<u8> {
        let mut out = self.segment.read_raw(offset, size).to_vec();
        for patch in &self.raw_writes {
            let (lo, hi) = (patch.offset, patch.offset + patch.data.len() as u64);
            let (req_lo, req_hi) = (offset, offset + size as u64);
            if lo < req_hi && req_lo < hi {
                let overlap_lo = lo.max(req_lo);
                let overlap_hi = hi.min(req_hi);
                let src_start = (overlap_lo - lo) as usize;
                let dst_start = (overlap_lo - req_lo) as usize;
                let len = (overlap_hi - overlap_lo) as usize;
                out[dst_start..dst_start + len].copy_from_slice(&patch.data[src_start..src_start + len]);
            }
        }
        out
    }

    /// Discard all logged state, releasing this context back to idle.
    /// Quarantined allocations are freed — the spec's resolution of the
    /// multi-handle-aliasing open question: dropped on rollback.
    pub fn rollback(&mut self) {
        for handle in self.allocations.drain(..) {
            self.segment.free_object(handle);
        }
        for (offset, size) in self.raw_allocations.drain(..) {
            self.segment.free_raw(offset, size);
        }
        self.observed.clear();
        self.read_log.clear();
        self.write_log.clear();
        self.raw_writes.clear();
        // The growth that would have superseded these blocks never
        // committed, so they're still the live backing storage — drop
        // the retirement record rather than freeing them.
        self.retiring_raw.clear();
        // The store/overwrite that would have changed these handles'
        // ownership never took effect either.
        self.pending_increfs.clear();
        self.pending_decrefs.clear();
        self.depth = 0;
        self.state = TxnState::Aborted;
    }

    /// Like [`TransactionContext::rollback`], but immediately re-enters
    /// `Active` state with depth 1 so the retry loop can re-run the user
    /// region without a fresh `begin` call. Bumps the retry counter.
    pub fn rollback_retaining(&mut self) {
        self.rollback();
        self.retry_count += 1;
        self.id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
        self.state = TxnState::Active;
        self.depth = 1;
    }

    /// Decrement nesting depth on `commit_request`; only the outermost
    /// commit (depth reaching zero) triggers validation. Returns `true`
    /// when this call is the outermost and the caller should run the
    /// commit protocol.
    pub fn enter_commit(&mut self) -> bool {
        debug_assert!(self.depth > 0, "commit_request with no active transaction");
        self.depth -= 1;
        if self.depth == 0 {
            self.state = TxnState::Committing;
            true
        } else {
            false
        }
    }

    /// Finalize a successful outermost commit: clear logs (quarantined
    /// allocations are retained, not freed — they're either now
    /// reachable via a published write or leaked per the open-question
    /// resolution), return to idle.
    pub fn finish_commit(&mut self) {
        self.allocations.clear();
        self.raw_allocations.clear();
        self.observed.clear();
        self.read_log.clear();
        self.write_log.clear();
        self.raw_writes.clear();
        self.state = TxnState::Idle;
    }
}
