//! Control block layout — the shared-memory header the writer and every
//! reader map at offset 0 of the segment, followed by the packet slot array.
//!
//! The layout is compile-time fixed so processes built separately agree on
//! every offset: `#[repr(C)]`, naturally aligned fields, explicit padding,
//! and size asserts. No pointers are stored in shared memory; the reader
//! table is a fixed array of value slots indexed by scan.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use common::types::RingGeometry;

use crate::error::{RingError, RingResult};
use crate::sync::{mono_time_ns, ShmCondvar, ShmMutex};

/// Maximum number of concurrently registered readers.
pub const MAX_READERS: usize = 16;

/// A reader idle longer than this while the writer commits is evicted.
pub const READER_TIMEOUT_NS: u64 = 2 * crate::sync::NSEC_PER_SEC;

/// Segment identification, checked on attach.
pub const RING_MAGIC: u32 = 0x5650_4b52; // "VPKR"
pub const RING_VERSION: u32 = 1;

/// One entry of the reader table. `id == 0` means the slot is free and the
/// remaining fields are meaningless.
#[repr(C, align(64))]
pub struct ReaderSlot {
    /// Owner token (process id). Nonzero while registered.
    pub id: AtomicI32,
    /// Next slot index this reader will consume.
    pub offset: AtomicU32,
    /// Slots granted to the currently open read borrow (0 when none).
    pub allowed_to_read: AtomicU32,
    _pad0: [u8; 4],
    /// Monotonic ns timestamp of this reader's last activity.
    pub last_access_ns: AtomicU64,
    _pad1: [u8; 40],
}

impl ReaderSlot {
    pub fn is_free(&self) -> bool {
        self.id.load(Ordering::Acquire) == 0
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        self.last_access_ns.store(mono_time_ns(), Ordering::Release);
    }

    /// Return the slot to the free state. `id` is cleared last so a
    /// concurrent scan never sees a free slot with live-looking fields.
    pub fn clear(&self) {
        self.offset.store(0, Ordering::Relaxed);
        self.allowed_to_read.store(0, Ordering::Relaxed);
        self.last_access_ns.store(0, Ordering::Relaxed);
        self.id.store(0, Ordering::Release);
    }
}

/// Control block at the start of the shared segment.
///
/// Mutable fields are atomics; cross-process exclusion is provided by the
/// three futex mutexes and the two condition words. Lock order, outer to
/// inner: `readers_mutex` -> `mutex` -> `write_mutex`.
#[repr(C)]
pub struct RingHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    /// Bytes per packet slot, immutable after init.
    pub packet_size: AtomicU32,
    /// Slot count, immutable after init.
    pub num_buffers: AtomicU32,
    /// Slot index of the slowest live reader; advanced only by aggregation.
    pub read_offset: AtomicU32,
    /// Next slot the writer will fill.
    pub write_offset: AtomicU32,
    /// Slots not yet consumed by the slowest live reader.
    pub buffer_level: AtomicU32,
    /// Slots the open write borrow may commit (0 when none).
    pub allowed_to_write: AtomicU32,
    /// Smallest level any waiting reader is waiting for.
    pub read_wait_level: AtomicU32,
    /// Level at or below which a waiting writer wants to be woken.
    pub write_wait_level: AtomicU32,
    /// One-shot init flag (nonzero once geometry is recorded).
    pub initialized: AtomicU32,
    /// Recorded at init; the primitives are process-shared either way.
    pub shared: AtomicU32,
    /// Single-writer borrow flag, claimed by compare-exchange.
    pub write_in_progress: AtomicU32,
    /// Protects offset/level aggregation and the wait levels.
    pub mutex: ShmMutex,
    /// Protects the reader table.
    pub readers_mutex: ShmMutex,
    /// Held for the duration of a write borrow.
    pub write_mutex: ShmMutex,
    /// Readers block here until more data arrives.
    pub cond_read: ShmCondvar,
    /// Writers block here until space frees up.
    pub cond_write: ShmCondvar,
    /// Monotonic ns timestamp of the writer's last activity.
    pub writer_last_access_ns: AtomicU64,
    _pad: [u8; 48],
    pub readers: [ReaderSlot; MAX_READERS],
}

const _: () = {
    assert!(std::mem::size_of::<ReaderSlot>() == 64);
    assert!(std::mem::align_of::<ReaderSlot>() == 64);
    assert!(std::mem::size_of::<RingHeader>() == 128 + MAX_READERS * 64);
    assert!(std::mem::align_of::<RingHeader>() == 64);
};

/// Total segment size for a given geometry: header plus slot array.
pub fn region_size(geometry: RingGeometry) -> usize {
    std::mem::size_of::<RingHeader>() + geometry.data_size()
}

impl RingHeader {
    /// Record geometry and mark the segment live. The caller provides a
    /// zeroed header (fresh mapping), so every offset, level, lock word and
    /// reader slot already starts in its ground state.
    pub fn init(&self, geometry: RingGeometry, shared: bool) -> RingResult<()> {
        if !geometry.is_valid() {
            return Err(RingError::InvalidParam);
        }

        self.magic.store(RING_MAGIC, Ordering::Relaxed);
        self.version.store(RING_VERSION, Ordering::Relaxed);
        self.packet_size
            .store(geometry.packet_size, Ordering::Relaxed);
        self.num_buffers
            .store(geometry.num_buffers, Ordering::Relaxed);
        self.shared.store(shared as u32, Ordering::Relaxed);
        self.writer_last_access_ns
            .store(mono_time_ns(), Ordering::Relaxed);
        // Publish last: attaching processes gate on this flag
        self.initialized.store(1, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) != 0
    }

    /// Attach-time validation: magic, version, and the init flag.
    pub fn validate(&self) -> bool {
        self.magic.load(Ordering::Relaxed) == RING_MAGIC
            && self.version.load(Ordering::Relaxed) == RING_VERSION
            && self.is_initialized()
    }

    pub fn geometry(&self) -> RingGeometry {
        RingGeometry::new(
            self.packet_size.load(Ordering::Relaxed),
            self.num_buffers.load(Ordering::Relaxed),
        )
    }

    /// Refresh the writer activity timestamp.
    pub fn touch_writer(&self) {
        self.writer_last_access_ns
            .store(mono_time_ns(), Ordering::Release);
    }
}
