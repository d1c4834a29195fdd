//! Handles and the per-object header every allocation carries as its
//! prefix.
//!
//! A [`Handle`] is a segment-relative offset plus a type discriminator —
//! never a raw process-local pointer (see the fixed-base-address design
//! note). Handles compare and hash by their packed numeric value, which
//! gives the commit protocol's "lock write set in ascending handle order"
//! step a free, deterministic total order.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::version::VersionCounter;
use shoal_common::consts::CACHE_LINE_SIZE;

/// Discriminator recorded in both the handle and the object header's
/// `tag` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectTag {
    /// Immutable scalar box.
    Scalar = 0,
    /// Ordered list.
    List = 1,
    /// Keyed map.
    Map = 2,
    /// Fixed-length tuple.
    Tuple = 3,
    /// User-defined object (attribute map + type-identity string).
    Object = 4,
    /// Single-shot wait/signal promise.
    Promise = 5,
}

impl ObjectTag {
    /// Reconstruct from the raw byte stored in a header. Returns `None`
    /// for an unrecognized tag, which the caller should treat as
    /// corruption.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ObjectTag::Scalar),
            1 => Some(ObjectTag::List),
            2 => Some(ObjectTag::Map),
            3 => Some(ObjectTag::Tuple),
            4 => Some(ObjectTag::Object),
            5 => Some(ObjectTag::Promise),
            _ => None,
        }
    }
}

/// Segment-relative handle: the offset of an object's header from the
/// start of the segment, packed with its type tag in the high byte.
///
/// A zero offset is the sentinel/null handle — returned for zero-size
/// allocations and never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

const TAG_SHIFT: u32 = 56;
const OFFSET_MASK: u64 = (1u64 << TAG_SHIFT) - 1;

impl Handle {
    /// The null/sentinel handle.
    pub const NULL: Handle = Handle(0);

    /// Pack an offset and tag into a handle. Offsets above 2^56 are not
    /// representable; segments are capped well below that by
    /// `SEGMENT_MAX_SIZE`.
    pub fn new(offset: u64, tag: ObjectTag) -> Self {
        debug_assert!(offset & !OFFSET_MASK == 0, "offset overflows handle");
        Handle((offset & OFFSET_MASK) | ((tag as u64) << TAG_SHIFT))
    }

    /// Reconstruct a handle from its raw packed value (as read out of a
    /// container's element-handle slot).
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// The raw packed value, suitable for storing in shared memory.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The segment-relative byte offset of the object's header.
    pub fn offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// The object's type tag, or `None` if this is the null handle.
    pub fn tag(&self) -> Option<ObjectTag> {
        if self.is_null() {
            return None;
        }
        ObjectTag::from_u8((self.0 >> TAG_SHIFT) as u8)
    }

    /// Whether this is the sentinel handle (zero-size allocation, never
    /// dereferenced).
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

bitflags! {
    /// Flags packed into the object header's `flags` byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Set between a successful write-lock CAS and the matching
        /// commit/abort; cleared on release.
        const WRITE_LOCKED = 0b0000_0001;
        /// Debug breakpoint armed for the next conflict on this object.
        const DEBUG_ON_CONTENTION = 0b0000_0010;
        /// Frozen: scalar or tuple, immutable after construction.
        const FROZEN = 0b0000_0100;
    }
}

/// Object header: the fixed-size prefix of every allocation.
///
/// Field layout follows the external-interface diagram: tag, flags,
/// refcount, version, owner transaction id, read/write contention
/// counters, then the allocation epoch and payload size used by the
/// allocator and reclamation.
#[repr(C, align(64))]
pub struct ObjectHeader {
    tag: AtomicU8,
    flags: AtomicU8,
    _pad0: [u8; 2],
    refcount: AtomicU32,
    /// Per-object version counter; strictly increases across committed
    /// writes.
    pub version: VersionCounter,
    /// Non-zero only between a successful header lock and the matching
    /// commit/abort.
    owner_tx_id: AtomicU64,
    read_conflicts: AtomicU32,
    write_conflicts: AtomicU32,
    /// Payload size in bytes, immutable after allocation.
    pub payload_size: u64,
    /// Allocation epoch stamped at alloc time, read by the reclamation
    /// sweeper.
    pub alloc_epoch: AtomicU64,
}

const_assert_eq!(std::mem::align_of::<ObjectHeader>(), CACHE_LINE_SIZE);

impl ObjectHeader {
    /// Initialize a freshly allocated header in place.
    pub fn init(&mut self, tag: ObjectTag, payload_size: u64, epoch: u64, frozen: bool) {
        self.tag = AtomicU8::new(tag as u8);
        let flags = if frozen {
            HeaderFlags::FROZEN
        } else {
            HeaderFlags::empty()
        };
        self.flags = AtomicU8::new(flags.bits());
        self.refcount = AtomicU32::new(1);
        self.version = VersionCounter::new();
        self.owner_tx_id = AtomicU64::new(0);
        self.read_conflicts = AtomicU32::new(0);
        self.write_conflicts = AtomicU32::new(0);
        self.payload_size = payload_size;
        self.alloc_epoch = AtomicU64::new(epoch);
    }

    /// Object type tag.
    pub fn tag(&self) -> ObjectTag {
        ObjectTag::from_u8(self.tag.load(Ordering::Acquire)).expect("corrupt object tag")
    }

    /// Current flag bits.
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: HeaderFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Current refcount.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increment the refcount (ordinary atomic add, per the invariant
    /// that increments never need ordering beyond relaxed visibility of
    /// the new handle being shared).
    pub fn incref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the refcount. Returns the new value; the caller must
    /// invoke reclamation logic when this reaches zero.
    pub fn decref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// The transaction id currently holding the write lock, or 0.
    pub fn owner_tx_id(&self) -> u64 {
        self.owner_tx_id.load(Ordering::Acquire)
    }

    /// Attempt to acquire the write lock for `tx_id`, expecting the
    /// object's current version to equal `expected_version`. Used by
    /// commit phase 1.
    pub fn try_lock(&self, tx_id: u64, expected_version: u64) -> Result<(), ()> {
        if self.version.load() != expected_version {
            return Err(());
        }
        self.owner_tx_id
            .compare_exchange(0, tx_id, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| {
                let mut flags = self.flags();
                flags.insert(HeaderFlags::WRITE_LOCKED);
                self.set_flags(flags);
            })
            .map_err(|_| ())
    }

    /// Release the write lock held by `tx_id`. No-op (besides a debug
    /// assertion) if not currently held by `tx_id`.
    pub fn unlock(&self, tx_id: u64) {
        if self
            .owner_tx_id
            .compare_exchange(tx_id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut flags = self.flags();
            flags.remove(HeaderFlags::WRITE_LOCKED);
            self.set_flags(flags);
        }
    }

    /// Bump the version counter as commit phase 3 does when publishing a
    /// write.
    pub fn bump_version(&self) -> u64 {
        self.version.bump()
    }

    /// Record a read conflict (contention diagnostics).
    pub fn record_read_conflict(&self) -> u32 {
        self.read_conflicts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a write conflict (contention diagnostics).
    pub fn record_write_conflict(&self) -> u32 {
        self.write_conflicts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// `(reads, writes)` contention counters, as returned by
    /// `get_contention_count`.
    pub fn contention_counts(&self) -> (u32, u32) {
        (
            self.read_conflicts.load(Ordering::Acquire),
            self.write_conflicts.load(Ordering::Acquire),
        )
    }

    /// Arm the debug-on-contention breakpoint for this object.
    pub fn set_debug_stop_on_contention(&self) {
        let mut flags = self.flags();
        flags.insert(HeaderFlags::DEBUG_ON_CONTENTION);
        self.set_flags(flags);
    }

    /// Whether the debug-on-contention breakpoint is armed.
    pub fn debug_stop_on_contention(&self) -> bool {
        self.flags().contains(HeaderFlags::DEBUG_ON_CONTENTION)
    }
}

/// Size of the object header, for allocator bookkeeping.
pub const OBJECT_HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();
