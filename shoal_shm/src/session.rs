//! Top-level segment session: ties the metadata page, participant table,
//! allocator header, and payload area into one named shared segment, and
//! resolves [`Handle`]s to object headers and payload bytes.
//!
//! Layout, in order from offset 0: [`MetadataPage`], [`ParticipantTable`],
//! [`AllocatorHeader`], then the payload area the two sub-allocators in
//! [`crate::allocator`] carve blocks from. Every offset below the payload
//! area is fixed at segment-creation time and recorded in the metadata
//! page so an attaching process never has to guess.

use std::mem::size_of;

use tracing::{debug, info, instrument, warn};

use crate::allocator::{self, AllocatorHeader};
use crate::coordinator::ParticipantTable;
use crate::error::{ShmError, ShmResult};
use crate::handle::{Handle, ObjectHeader, ObjectTag, OBJECT_HEADER_SIZE};
use crate::platform;
use crate::segment::{MetadataPage, SharedMemorySegment};

const METADATA_SIZE: usize = size_of::<MetadataPage>();
const PARTICIPANT_TABLE_SIZE: usize = size_of::<ParticipantTable>();
const ALLOCATOR_HEADER_SIZE: usize = size_of::<AllocatorHeader>();

fn shm_path(name: &str) -> String {
    format!("/dev/shm/shoal_{name}")
}

fn participant_table_offset() -> u64 {
    METADATA_SIZE as u64
}

fn allocator_header_offset() -> u64 {
    participant_table_offset() + PARTICIPANT_TABLE_SIZE as u64
}

fn payload_start_offset() -> u64 {
    allocator_header_offset() + ALLOCATOR_HEADER_SIZE as u64
}

/// A live attachment to a named shared segment: one per participating
/// process. Owns the mmap and this process's participant-table slot.
pub struct Segment {
    inner: SharedMemorySegment,
    participant_idx: Option<usize>,
    is_creator: bool,
}

// SAFETY: every access to the mapped region past construction goes
// through atomics (`ObjectHeader`, `VersionCounter`, `ParticipantEntry`)
// or a `Spinlock`/CAS embedded in the region itself — the same
// synchronization a second *process* mapping these bytes would rely on.
// Sharing one `Segment` across threads within a process via `Arc` is
// exactly that case with an extra-cheap attach.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new named segment, mapping it and initializing the
    /// metadata page, participant table, and allocator header. Fails with
    /// [`ShmError::AlreadyExists`] if the name is taken.
    #[instrument(skip_all, fields(name = %name, size))]
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        let path = shm_path(name);
        if std::path::Path::new(&path).exists() {
            return Err(ShmError::AlreadyExists { name: name.to_string() });
        }
        if size < payload_start_offset() as usize {
            return Err(ShmError::InvalidSize { size });
        }

        let mmap = platform::create_segment_mmap(&path, size)?;
        let mut inner = SharedMemorySegment::new(name.to_string(), size, mmap)?;

        let base_address = inner.base_ptr() as u64;
        inner.metadata_mut().init(size, participant_table_offset(), base_address);

        let participant_table = unsafe {
            &mut *(inner
                .base_ptr_mut()
                .add(participant_table_offset() as usize) as *mut ParticipantTable)
        };
        participant_table.init();

        let alloc_header = unsafe {
            &mut *(inner.base_ptr_mut().add(allocator_header_offset() as usize) as *mut AllocatorHeader)
        };
        alloc_header.init(payload_start_offset(), size as u64);

        let mut segment = Self {
            inner,
            participant_idx: None,
            is_creator: true,
        };
        segment.register_self()?;
        info!(bytes = size, "created segment");
        Ok(segment)
    }

    /// Attach to an existing named segment. Fails with
    /// [`ShmError::NotFound`] if no such segment exists, or
    /// [`ShmError::VersionMismatch`]/[`ShmError::Corruption`] if the
    /// metadata page doesn't validate.
    #[instrument(skip_all, fields(name = %name))]
    pub fn attach(name: &str) -> ShmResult<Self> {
        let path = shm_path(name);
        if !std::path::Path::new(&path).exists() {
            return Err(ShmError::NotFound { name: name.to_string() });
        }

        let mmap = platform::attach_segment_mmap(&path)?;
        let size = mmap.len();
        let inner = SharedMemorySegment::new(name.to_string(), size, mmap)?;
        inner.metadata().validate()?;

        let mut segment = Self {
            inner,
            participant_idx: None,
            is_creator: false,
        };
        segment.register_self()?;
        info!("attached to segment");
        Ok(segment)
    }

    fn register_self(&mut self) -> ShmResult<()> {
        let pid = platform::get_current_pid();
        let idx = self.participant_table().register(pid)?;
        self.participant_idx = Some(idx);
        Ok(())
    }

    /// Metadata page (magic, layout version, root handle).
    pub fn metadata(&self) -> &MetadataPage {
        self.inner.metadata()
    }

    /// The participant table.
    pub fn participant_table(&self) -> &ParticipantTable {
        unsafe {
            &*(self.inner.base_ptr().add(participant_table_offset() as usize) as *const ParticipantTable)
        }
    }

    /// The allocator header.
    pub fn allocator_header(&self) -> &AllocatorHeader {
        unsafe {
            &*(self.inner.base_ptr().add(allocator_header_offset() as usize) as *const AllocatorHeader)
        }
    }

    /// This process's participant-table index, if currently registered.
    pub fn participant_idx(&self) -> Option<usize> {
        self.participant_idx
    }

    /// Bump this process's heartbeat epoch. Called on every transaction
    /// commit by the engine above this crate.
    pub fn heartbeat(&self) -> Option<u64> {
        let idx = self.participant_idx?;
        self.participant_table().entry(idx).map(|e| e.heartbeat())
    }

    /// The root shared map's handle, or the null handle before the
    /// creator has published one.
    pub fn root_handle(&self) -> Handle {
        Handle::from_raw(self.metadata().root_handle())
    }

    /// Publish the root handle. The creator calls this exactly once,
    /// after allocating the root map, before any other participant can
    /// observe a non-null root.
    pub fn set_root_handle(&self, handle: Handle) {
        self.metadata().set_root_handle(handle.raw());
    }

    /// Whether this process created the segment (as opposed to attaching
    /// to one created elsewhere).
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Number of currently live participants.
    pub fn participant_count(&self) -> usize {
        self.participant_table().participant_count()
    }

    /// Raw base pointer, plus total size, for unsafe accessors below. Not
    /// a borrow of `self` in the Rust-aliasing sense: every dereference
    /// from it is mediated by the atomics and spinlocks embedded in the
    /// segment itself, the same way a second process's dereference of
    /// the identical bytes at a different virtual address would be.
    fn raw_parts(&self) -> (*mut u8, usize) {
        (self.inner.base_ptr() as *mut u8, self.inner.total_size)
    }

    /// Resolve a handle to its object header. Panics on a null handle or
    /// an offset outside the segment — both indicate a programming error
    /// or corruption, not a recoverable condition, since every live
    /// handle in this process's possession must resolve.
    pub fn header(&self, handle: Handle) -> &ObjectHeader {
        assert!(!handle.is_null(), "cannot resolve the null handle");
        let (base, _) = self.raw_parts();
        unsafe { &*(base.add(handle.offset() as usize) as *const ObjectHeader) }
    }

    /// This object's payload bytes, immediately following its header.
    pub fn payload(&self, handle: Handle) -> &[u8] {
        let header = self.header(handle);
        let (base, _) = self.raw_parts();
        unsafe {
            std::slice::from_raw_parts(
                base.add(handle.offset() as usize + OBJECT_HEADER_SIZE),
                header.payload_size as usize,
            )
        }
    }

    /// Mutable view of this object's payload bytes. Callers must hold the
    /// object's write lock (transaction commit) or its spinlock
    /// (transient region) before calling this; the lock lives in the
    /// object header, not in Rust's borrow checker, so this takes `&self`
    /// like every other concurrent accessor in this module.
    pub fn payload_mut(&self, handle: Handle) -> &mut [u8] {
        let header = self.header(handle);
        let size = header.payload_size as usize;
        let (base, _) = self.raw_parts();
        unsafe { std::slice::from_raw_parts_mut(base.add(handle.offset() as usize + OBJECT_HEADER_SIZE), size) }
    }

    /// Allocate a new object: header plus `payload_size` bytes of
    /// payload, initialized from `payload`. Returns the handle with
    /// refcount 1, not yet reachable from any container. Safe to call
    /// concurrently: structural mutation is serialized by the
    /// allocator's own per-size-class and coalescing spinlocks.
    #[instrument(skip(self, payload), fields(tag = ?tag, size = payload.len()))]
    pub fn alloc_object(&self, tag: ObjectTag, payload: &[u8], frozen: bool) -> ShmResult<Handle> {
        let total = OBJECT_HEADER_SIZE + payload.len();
        let (base, total_size) = self.raw_parts();
        let alloc_header = unsafe { &*(base.add(allocator_header_offset() as usize) as *const AllocatorHeader) };
        let epoch = alloc_header.epoch();
        let bytes = unsafe { std::slice::from_raw_parts_mut(base, total_size) };

        let offset = allocator::alloc(alloc_header, bytes, total, 64)?;
        let handle = Handle::new(offset, tag);
        let obj_header = unsafe { &mut *(base.add(offset as usize) as *mut ObjectHeader) };
        obj_header.init(tag, payload.len() as u64, epoch, frozen);

        let payload_start = offset as usize + OBJECT_HEADER_SIZE;
        bytes[payload_start..payload_start + payload.len()].copy_from_slice(payload);

        debug!(offset, "allocated object");
        Ok(handle)
    }

    /// Return an object's storage to the allocator. Callers must have
    /// already confirmed refcount has reached zero and no in-flight
    /// transaction holds a read on it (see `shoal_txn`'s reclamation
    /// queue) — this function performs no such check itself.
    pub fn free_object(&self, handle: Handle) {
        if handle.is_null() {
            return;
        }
        let total = OBJECT_HEADER_SIZE + self.header(handle).payload_size as usize;
        let (base, total_size) = self.raw_parts();
        let alloc_header = unsafe { &*(base.add(allocator_header_offset() as usize) as *const AllocatorHeader) };
        let bytes = unsafe { std::slice::from_raw_parts_mut(base, total_size) };
        allocator::free_slab(alloc_header, bytes, handle.offset(), total);
    }

    /// Allocate a bare, header-less block — used for container backing
    /// storage (a list's element array, a map's bucket table), which is
    /// owned exclusively by its container and not independently
    /// refcounted or tagged.
    pub fn alloc_raw(&self, size: usize) -> ShmResult<u64> {
        let (base, total_size) = self.raw_parts();
        let alloc_header = unsafe { &*(base.add(allocator_header_offset() as usize) as *const AllocatorHeader) };
        let bytes = unsafe { std::slice::from_raw_parts_mut(base, total_size) };
        allocator::alloc(alloc_header, bytes, size, 64)
    }

    /// Free a bare block previously returned by [`Segment::alloc_raw`].
    pub fn free_raw(&self, offset: u64, size: usize) {
        if offset == 0 {
            return;
        }
        let (base, total_size) = self.raw_parts();
        let alloc_header = unsafe { &*(base.add(allocator_header_offset() as usize) as *const AllocatorHeader) };
        let bytes = unsafe { std::slice::from_raw_parts_mut(base, total_size) };
        allocator::free_slab(alloc_header, bytes, offset, size);
    }

    /// Read `size` bytes at a bare offset previously returned by
    /// [`Segment::alloc_raw`].
    pub fn read_raw(&self, offset: u64, size: usize) -> &[u8] {
        let (base, _) = self.raw_parts();
        unsafe { std::slice::from_raw_parts(base.add(offset as usize), size) }
    }

    /// Mutable view of `size` bytes at a bare offset. See
    /// [`Segment::payload_mut`]'s synchronization note — the same
    /// applies here.
    pub fn write_raw(&self, offset: u64, size: usize) -> &mut [u8] {
        let (base, _) = self.raw_parts();
        unsafe { std::slice::from_raw_parts_mut(base.add(offset as usize), size) }
    }

    /// Current allocation epoch, for stamping reclamation-queue entries.
    pub fn current_epoch(&self) -> u64 {
        self.allocator_header().epoch()
    }

    /// Bump the allocation epoch; called once per commit by the
    /// reclamation sweeper in `shoal_txn`.
    pub fn bump_epoch(&self) -> u64 {
        self.allocator_header().bump_epoch()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Some(idx) = self.participant_idx.take() {
            self.participant_table().unregister(idx);
            if self.is_creator {
                let path = shm_path(&self.inner.name);
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(?err, "failed to remove segment backing file on creator shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::consts::SEGMENT_MIN_SIZE;

    fn unique_name(tag: &str) -> String {
        format!("test_{tag}_{}", std::process::id())
    }

    #[test]
    fn create_then_attach_round_trips_root_handle() {
        let name = unique_name("create_attach");
        let mut creator = Segment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        assert!(creator.is_creator());
        assert_eq!(creator.root_handle(), Handle::NULL);

        let h = creator.alloc_object(ObjectTag::Scalar, &42i64.to_le_bytes(), true).unwrap();
        creator.set_root_handle(h);

        let joiner = Segment::attach(&name).unwrap();
        assert_eq!(joiner.root_handle(), h);
        assert_eq!(joiner.payload(h), 42i64.to_le_bytes());
        assert_eq!(creator.participant_count(), 2);
    }

    #[test]
    fn create_fails_if_name_taken() {
        let name = unique_name("dup");
        let _first = Segment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        let second = Segment::create(&name, SEGMENT_MIN_SIZE * 256);
        assert!(matches!(second, Err(ShmError::AlreadyExists { .. })));
    }

    #[test]
    fn attach_fails_for_missing_segment() {
        let result = Segment::attach("definitely_does_not_exist_xyz");
        assert!(matches!(result, Err(ShmError::NotFound { .. })));
    }

    #[test]
    fn alloc_object_round_trips_payload() {
        let name = unique_name("alloc");
        let mut seg = Segment::create(&name, SEGMENT_MIN_SIZE * 256).unwrap();
        let h = seg.alloc_object(ObjectTag::List, &[1, 2, 3, 4], false).unwrap();
        assert_eq!(seg.payload(h), &[1, 2, 3, 4]);
        assert_eq!(seg.header(h).tag(), ObjectTag::List);
    }
}
