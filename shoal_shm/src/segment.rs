//! Shared memory segment and its bit-exact metadata page.

use crate::error::{ShmError, ShmResult};
use crate::version::VersionCounter;
use memmap2::MmapMut;
use shoal_common::consts::{CACHE_LINE_SIZE, SEGMENT_MAX_SIZE, SEGMENT_MIN_SIZE};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU64, Ordering};

/// Segment magic number, written at offset 0 of every segment.
pub const SEGMENT_MAGIC: u64 = 0x5053_4F53_5348_4C31; // "POSOSHL1"

/// Layout identifier for the metadata page; bumped whenever the on-disk
/// struct shapes in this module change incompatibly.
pub const LAYOUT_VERSION: u32 = 1;

/// Segment metadata page: magic, layout version, base address, root
/// handle, and the offset of the participant table. Lives at offset 0 of
/// every segment and is bit-exact across processes per the external
/// interface contract.
#[repr(C, align(64))]
pub struct MetadataPage {
    /// Magic number for validation.
    pub magic: u64,
    /// Layout version; attach fails with `VersionMismatch` if it differs.
    pub layout_version: u32,
    _pad0: u32,
    /// Virtual address this segment was originally mapped at by its
    /// creator. Stored for diagnostics only — handles are always
    /// segment-relative offsets, never raw pointers.
    pub base_address: u64,
    /// Handle of the root shared map.
    pub root_handle: AtomicU64,
    /// Byte offset of the participant table from the start of the
    /// segment.
    pub participant_table_offset: u64,
    /// Segment-wide monotonically increasing allocation epoch, stamped on
    /// every allocated block to support reclamation.
    pub alloc_epoch: VersionCounter,
    /// Total segment size in bytes, including this page.
    pub size: u64,
}

const_assert_eq!(std::mem::align_of::<MetadataPage>(), CACHE_LINE_SIZE);

impl MetadataPage {
    /// Initialize a freshly mapped segment's metadata page.
    pub fn init(&mut self, size: usize, participant_table_offset: u64, base_address: u64) {
        self.magic = SEGMENT_MAGIC;
        self.layout_version = LAYOUT_VERSION;
        self.base_address = base_address;
        self.root_handle = AtomicU64::new(0);
        self.participant_table_offset = participant_table_offset;
        self.alloc_epoch = VersionCounter::new();
        self.size = size as u64;
    }

    /// Validate magic and layout version of an attached segment.
    pub fn validate(&self) -> ShmResult<()> {
        if self.magic != SEGMENT_MAGIC {
            return Err(ShmError::Corruption {
                detail: "metadata page magic mismatch".into(),
            });
        }
        if self.layout_version != LAYOUT_VERSION {
            return Err(ShmError::VersionMismatch);
        }
        Ok(())
    }

    /// Load the root handle.
    pub fn root_handle(&self) -> u64 {
        self.root_handle.load(Ordering::Acquire)
    }

    /// Publish the root handle. Called exactly once, by the creator,
    /// before any participant other than the creator can observe it.
    pub fn set_root_handle(&self, handle: u64) {
        self.root_handle.store(handle, Ordering::Release);
    }
}

/// Core shared-memory segment: the metadata page plus everything the
/// allocator and participant table live in.
pub struct SharedMemorySegment {
    /// Segment name, as passed to `create`/`attach`.
    pub name: String,
    /// Total mapped size.
    pub total_size: usize,
    mmap: MmapMut,
}

impl SharedMemorySegment {
    /// Wrap an already-mapped region, validating size.
    pub fn new(name: String, total_size: usize, mmap: MmapMut) -> ShmResult<Self> {
        validate_segment_size(total_size)?;
        validate_memory_alignment(mmap.as_ptr() as usize)?;
        Ok(Self {
            name,
            total_size,
            mmap,
        })
    }

    /// View the metadata page.
    pub fn metadata(&self) -> &MetadataPage {
        unsafe { &*(self.mmap.as_ptr() as *const MetadataPage) }
    }

    /// Mutable view of the metadata page (creator only).
    pub fn metadata_mut(&mut self) -> &mut MetadataPage {
        unsafe { &mut *(self.mmap.as_mut_ptr() as *mut MetadataPage) }
    }

    /// Raw pointer to the start of the segment, for computing handle
    /// offsets. Never store this pointer in shared structures.
    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Mutable raw pointer to the start of the segment.
    pub fn base_ptr_mut(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Entire segment as a byte slice.
    pub fn bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Entire segment as a mutable byte slice.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }
}

/// Validate segment size constraints.
pub fn validate_segment_size(size: usize) -> ShmResult<()> {
    if size < SEGMENT_MIN_SIZE || size > SEGMENT_MAX_SIZE {
        return Err(ShmError::InvalidSize { size });
    }
    if size % SEGMENT_MIN_SIZE != 0 {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

/// Validate memory alignment against the cache line size.
pub fn validate_memory_alignment(address: usize) -> ShmResult<()> {
    if address % CACHE_LINE_SIZE != 0 {
        return Err(ShmError::AlignmentError {
            address,
            alignment: CACHE_LINE_SIZE,
        });
    }
    Ok(())
}
