//! Packet ring buffer over shared memory — one writer, many readers.
//!
//! The segment holds a [`RingHeader`] control block followed by
//! `num_buffers` fixed-size packet slots. A single writer fills contiguous
//! runs of slots; up to [`MAX_READERS`](crate::layout::MAX_READERS) reader
//! processes drain independently,
//! each at its own offset. Transfers are zero-copy: `begin_access` grants a
//! contiguous slot run, the caller memcpys directly through
//! [`PacketRing::packet`] / [`PacketRing::packet_mut`], and `end_access`
//! commits how much was actually produced or consumed.
//!
//! The writer never blocks on readers: a reader that stays idle past
//! [`READER_TIMEOUT_NS`] while the writer commits is evicted from the table.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use memmap2::MmapMut;
use tracing::{debug, warn};

use common::types::RingGeometry;

use crate::error::{RingError, RingResult};
use crate::layout::{region_size, ReaderSlot, RingHeader, READER_TIMEOUT_NS};
use crate::mmap;
use crate::sync::{mono_time_ns, WaitOutcome};

/// Which side of the ring an operation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingAccess {
    Read,
    Write,
}

/// Non-blocking snapshot of the control block, for inspection tools.
#[derive(Debug, Clone)]
pub struct RingStatus {
    pub geometry: RingGeometry,
    pub read_offset: u32,
    pub write_offset: u32,
    pub buffer_level: u32,
    pub write_in_progress: bool,
    pub writer_last_access_ns: u64,
    pub readers: Vec<ReaderStatus>,
}

#[derive(Debug, Clone)]
pub struct ReaderStatus {
    pub id: i32,
    pub offset: u32,
    pub level: u32,
    pub last_access_ns: u64,
}

/// A mapped packet ring segment.
///
/// Every process holds its own `PacketRing`; all shared state lives in the
/// mapping. The handle does not unlink the segment on drop — lifecycle is
/// explicit via [`PacketRing::unlink`].
pub struct PacketRing {
    mmap: MmapMut,
}

impl PacketRing {
    /// Create the segment under /dev/shm and initialize the control block.
    pub fn create(name: &str, geometry: RingGeometry) -> Result<Self> {
        if !geometry.is_valid() {
            return Err(RingError::InvalidParam.into());
        }
        let mmap = mmap::create_shm(name, region_size(geometry))?;
        let ring = Self { mmap };
        ring.header().init(geometry, true)?;
        debug!(
            name,
            packet_size = geometry.packet_size,
            num_buffers = geometry.num_buffers,
            "packet ring created"
        );
        Ok(ring)
    }

    /// Attach to an existing, initialized segment.
    pub fn open(name: &str) -> Result<Self> {
        let mmap = mmap::open_shm(name, std::mem::size_of::<RingHeader>())?;
        let ring = Self { mmap };
        anyhow::ensure!(
            ring.header().validate(),
            "shm {} is not an initialized packet ring",
            name
        );
        let needed = region_size(ring.header().geometry());
        anyhow::ensure!(
            ring.mmap.len() >= needed,
            "shm {} truncated: expected {}, got {}",
            name,
            needed,
            ring.mmap.len()
        );
        Ok(ring)
    }

    /// Remove the backing segment.
    pub fn unlink(name: &str) -> Result<()> {
        mmap::remove_shm(name)
    }

    fn header(&self) -> &RingHeader {
        // Safety: the mapping is at least RingHeader-sized (checked at
        // create/open) and page-aligned, which covers the 64-byte alignment;
        // all mutable header fields are atomics or futex words
        unsafe { &*(self.mmap.as_ptr() as *const RingHeader) }
    }

    pub fn geometry(&self) -> RingGeometry {
        self.header().geometry()
    }

    /// Borrow the packet slot at `index`. Valid only while the caller holds a
    /// read borrow covering that slot.
    pub fn packet(&self, index: u32) -> &[u8] {
        let g = self.header().geometry();
        assert!(index < g.num_buffers);
        let start = std::mem::size_of::<RingHeader>() + index as usize * g.packet_size as usize;
        &self.mmap[start..start + g.packet_size as usize]
    }

    /// Mutably borrow the packet slot at `index`. Valid only while the caller
    /// holds the write borrow covering that slot.
    pub fn packet_mut(&mut self, index: u32) -> &mut [u8] {
        let g = self.header().geometry();
        assert!(index < g.num_buffers);
        let start = std::mem::size_of::<RingHeader>() + index as usize * g.packet_size as usize;
        &mut self.mmap[start..start + g.packet_size as usize]
    }

    fn ensure_initialized(&self) -> RingResult<()> {
        if self.header().is_initialized() {
            Ok(())
        } else {
            Err(RingError::NotInitialized)
        }
    }

    // --- Reader registration ---

    /// Register a reader under a nonzero id (the process id in practice).
    /// The new reader starts at the current aggregate read offset.
    pub fn add_reader(&self, id: i32) -> RingResult<()> {
        self.ensure_initialized()?;
        if id <= 0 {
            return Err(RingError::InvalidParam);
        }
        let header = self.header();
        let _guard = header.readers_mutex.guard();
        for slot in &header.readers {
            if slot.is_free() {
                slot.offset
                    .store(header.read_offset.load(Ordering::Acquire), Ordering::Relaxed);
                slot.allowed_to_read.store(0, Ordering::Relaxed);
                slot.touch();
                // Publish last so lock-free scans never see a half-built entry
                slot.id.store(id, Ordering::Release);
                return Ok(());
            }
        }
        Err(RingError::TooManyReaders)
    }

    /// Deregister every table entry matching `id`.
    pub fn remove_reader(&self, id: i32) -> RingResult<()> {
        self.ensure_initialized()?;
        if id <= 0 {
            return Err(RingError::InvalidParam);
        }
        let header = self.header();
        let _guard = header.readers_mutex.guard();
        let mut removed = false;
        for slot in &header.readers {
            if slot.id.load(Ordering::Acquire) == id {
                slot.clear();
                removed = true;
            }
        }
        if removed {
            Ok(())
        } else {
            Err(RingError::InvalidParam)
        }
    }

    fn find_reader(&self, id: i32) -> Option<&ReaderSlot> {
        self.header()
            .readers
            .iter()
            .find(|slot| slot.id.load(Ordering::Acquire) == id)
    }

    // --- Availability ---

    /// How many slots are currently readable by reader `id` (read access) or
    /// writable (write access), without borrowing anything.
    ///
    /// The write figure is `num_buffers - buffer_level` and may over-report
    /// by one compared to what `begin_access` will actually grant when the
    /// writer trails the slowest reader in the array (the full/empty gap
    /// slot is applied only at borrow time).
    pub fn update_available(&self, access: RingAccess, id: i32) -> RingResult<u32> {
        self.ensure_initialized()?;
        let header = self.header();
        match access {
            RingAccess::Read => {
                let reader = self.find_reader(id).ok_or(RingError::InvalidParam)?;
                Ok(self.calc_reader_level(reader))
            }
            RingAccess::Write => {
                let num = header.num_buffers.load(Ordering::Relaxed);
                Ok(num - header.buffer_level.load(Ordering::Acquire))
            }
        }
    }

    /// Slots not yet consumed by `reader`, relative to the writer position.
    ///
    /// The writer may advance `write_offset` concurrently; a stale value only
    /// under-reports the backlog, which the next call makes up for. Equal
    /// offsets are ambiguous (a full lap looks like an empty ring), so the
    /// global level breaks the tie.
    fn calc_reader_level(&self, reader: &ReaderSlot) -> u32 {
        let header = self.header();
        let num = header.num_buffers.load(Ordering::Relaxed);
        let write_offset = header.write_offset.load(Ordering::Acquire);
        let offset = reader.offset.load(Ordering::Acquire);
        if write_offset > offset {
            write_offset - offset
        } else if write_offset < offset {
            num - offset + write_offset
        } else if header.buffer_level.load(Ordering::Acquire) == num {
            num
        } else {
            0
        }
    }

    // --- Borrow protocol ---

    /// Borrow a contiguous run of up to `requested` slots.
    ///
    /// Returns `(offset, granted)`: the first slot index and how many slots
    /// the caller may touch. `granted` may be zero. A run never wraps past
    /// the physical end of the array; consume to the end, then borrow again.
    pub fn begin_access(
        &self,
        access: RingAccess,
        id: i32,
        requested: u32,
    ) -> RingResult<(u32, u32)> {
        self.ensure_initialized()?;
        match access {
            RingAccess::Read => self.begin_read(id, requested),
            RingAccess::Write => self.begin_write(requested),
        }
    }

    fn begin_read(&self, id: i32, requested: u32) -> RingResult<(u32, u32)> {
        let header = self.header();
        let reader = self.find_reader(id).ok_or(RingError::InvalidParam)?;
        let num = header.num_buffers.load(Ordering::Relaxed);
        let level = self.calc_reader_level(reader);
        let offset = reader.offset.load(Ordering::Acquire);

        let mut granted = requested.min(level);
        if offset + granted >= num {
            granted = num - offset;
        }

        reader.allowed_to_read.store(granted, Ordering::Relaxed);
        reader.touch();
        Ok((offset, granted))
    }

    fn begin_write(&self, requested: u32) -> RingResult<(u32, u32)> {
        let header = self.header();
        // Claim the single-writer flag; exactly one of two racing borrows wins
        if header
            .write_in_progress
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(RingError::NotAllowed);
        }
        // Held until end_access(Write); a crashed writer leaves it visibly taken
        header.write_mutex.lock();

        let num = header.num_buffers.load(Ordering::Relaxed);
        let write_offset = header.write_offset.load(Ordering::Relaxed);
        // Snapshot once: readers shrink the level concurrently, and working
        // from an older (larger) value only makes the grant smaller
        let level = header.buffer_level.load(Ordering::Acquire);
        let read_offset = header.read_offset.load(Ordering::Acquire);

        let mut granted = requested;
        if granted > num - level {
            granted = num - level;
        }
        if write_offset + granted >= num {
            granted = num - write_offset;
        }
        if write_offset < read_offset {
            // Leave one slot free so a full ring and an empty one stay
            // distinguishable when the writer is physically behind
            granted = read_offset - write_offset - 1;
        }

        header.allowed_to_write.store(granted, Ordering::Relaxed);
        header.touch_writer();
        Ok((write_offset, granted))
    }

    /// Commit `count` slots of an open borrow (`count` may be less than what
    /// `begin_access` granted). `offset` is accepted for call symmetry and
    /// not interpreted.
    pub fn end_access(
        &self,
        access: RingAccess,
        id: i32,
        _offset: u32,
        count: u32,
    ) -> RingResult<()> {
        self.ensure_initialized()?;
        match access {
            RingAccess::Read => self.end_read(id, count),
            RingAccess::Write => self.end_write(count),
        }
    }

    fn end_read(&self, id: i32, count: u32) -> RingResult<()> {
        let header = self.header();
        let reader = self.find_reader(id).ok_or(RingError::InvalidParam)?;
        if count > reader.allowed_to_read.load(Ordering::Acquire) {
            return Err(RingError::InvalidParam);
        }
        reader.allowed_to_read.store(0, Ordering::Relaxed);
        let offset = reader.offset.load(Ordering::Relaxed);
        // Publish consumption before aggregation recomputes the minimum
        reader.offset.store(offset + count, Ordering::Release);
        self.aggregate_reader_offset();

        if header.buffer_level.load(Ordering::Acquire)
            <= header.write_wait_level.load(Ordering::Acquire)
        {
            header.cond_write.broadcast();
        }
        reader.touch();
        Ok(())
    }

    fn end_write(&self, count: u32) -> RingResult<()> {
        let header = self.header();
        if header.write_in_progress.load(Ordering::Acquire) == 0 {
            return Err(RingError::NotAllowed);
        }
        if count > header.allowed_to_write.load(Ordering::Acquire) {
            return Err(RingError::InvalidParam);
        }

        let num = header.num_buffers.load(Ordering::Relaxed);
        {
            let _guard = header.mutex.guard();
            let write_offset = header.write_offset.load(Ordering::Relaxed);
            if write_offset + count == num {
                header.write_offset.store(0, Ordering::Release);
            } else if write_offset + count > num {
                // Arithmetic inconsistency; nothing is committed and the
                // borrow stays open so the caller can retry with a legal count
                return Err(RingError::InvalidParam);
            } else {
                header.write_offset.store(write_offset + count, Ordering::Release);
            }
            header.buffer_level.fetch_add(count, Ordering::AcqRel);
        }

        header.allowed_to_write.store(0, Ordering::Relaxed);
        header.write_in_progress.store(0, Ordering::Release);
        header.write_mutex.unlock();

        if header.buffer_level.load(Ordering::Acquire)
            >= header.read_wait_level.load(Ordering::Acquire)
        {
            header.cond_read.broadcast();
        }
        header.touch_writer();
        self.purge_unresponsive_readers();
        Ok(())
    }

    // --- Offset aggregation ---

    /// Smallest offset among live readers. Must be called with
    /// `readers_mutex` held. When every live reader has consumed to the
    /// physical end of the array, all of them are wrapped back to slot 0.
    fn update_smaller_reader_offset(&self) -> Option<u32> {
        let header = self.header();
        let mut smallest = u32::MAX;
        for slot in &header.readers {
            if slot.id.load(Ordering::Acquire) != 0 {
                smallest = smallest.min(slot.offset.load(Ordering::Acquire));
            }
        }
        if smallest == u32::MAX {
            return None;
        }
        if smallest == header.num_buffers.load(Ordering::Relaxed) {
            for slot in &header.readers {
                if slot.id.load(Ordering::Acquire) != 0 {
                    slot.offset.store(0, Ordering::Release);
                }
            }
        }
        Some(smallest)
    }

    /// Advance the aggregate read offset to the slowest live reader and
    /// shrink the buffer level accordingly. This is the only place
    /// `read_offset` moves. The table lock is held across the level update
    /// so a concurrent reader commit cannot interleave a second aggregation
    /// against a stale minimum.
    fn aggregate_reader_offset(&self) {
        let header = self.header();
        let _readers = header.readers_mutex.guard();
        let Some(smallest) = self.update_smaller_reader_offset() else {
            return;
        };
        let num = header.num_buffers.load(Ordering::Relaxed);

        let _guard = header.mutex.guard();
        let read_offset = header.read_offset.load(Ordering::Relaxed);
        header
            .buffer_level
            .fetch_sub(smallest - read_offset, Ordering::AcqRel);
        if smallest == num {
            header.read_offset.store(0, Ordering::Release);
        } else {
            header.read_offset.store(smallest, Ordering::Release);
        }
    }

    // --- Reader eviction ---

    /// Drop table entries whose last activity is older than
    /// [`READER_TIMEOUT_NS`]. Runs on the writer's commit path only: the
    /// point is to keep a stalled reader from pinning `read_offset` and
    /// starving the writer. The `now > last` guard keeps an unset or skewed
    /// stamp from triggering an eviction.
    fn purge_unresponsive_readers(&self) {
        let header = self.header();
        let now = mono_time_ns();
        let _guard = header.readers_mutex.guard();
        for slot in &header.readers {
            let id = slot.id.load(Ordering::Acquire);
            if id == 0 {
                continue;
            }
            let last = slot.last_access_ns.load(Ordering::Acquire);
            if now > last && now - last > READER_TIMEOUT_NS {
                warn!(reader = id, idle_ns = now - last, "purging unresponsive reader");
                slot.clear();
            }
        }
    }

    // --- Blocking waits ---

    /// Block until at least `count` slots are free for writing, or
    /// `timeout_ms` elapses. Does not borrow anything; follow up with
    /// `begin_access`/`end_access` to transfer.
    pub fn wait_write(&self, count: u32, timeout_ms: u32) -> RingResult<()> {
        self.ensure_initialized()?;
        let header = self.header();
        let num = header.num_buffers.load(Ordering::Relaxed);
        if count == 0 || count > num || timeout_ms == 0 {
            return Err(RingError::InvalidParam);
        }

        let wait_level = num - count;
        header.write_wait_level.store(wait_level, Ordering::Release);
        let timeout = Duration::from_millis(u64::from(timeout_ms));

        while header.buffer_level.load(Ordering::Acquire) > wait_level {
            let snapshot = header.cond_write.snapshot();
            // The level may have dropped between the check and the snapshot
            if header.buffer_level.load(Ordering::Acquire) <= wait_level {
                break;
            }
            match header.cond_write.wait(snapshot, timeout) {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => {
                    return if header.buffer_level.load(Ordering::Acquire) > wait_level {
                        Err(RingError::Timeout)
                    } else {
                        Ok(())
                    };
                }
                WaitOutcome::Failed => return Err(RingError::CondWaitFailed),
            }
        }
        Ok(())
    }

    /// Block until reader `id` has at least `count` slots to read, or
    /// `timeout_ms` elapses.
    pub fn wait_read(&self, id: i32, count: u32, timeout_ms: u32) -> RingResult<()> {
        self.ensure_initialized()?;
        let header = self.header();
        let num = header.num_buffers.load(Ordering::Relaxed);
        let reader = self.find_reader(id).ok_or(RingError::InvalidParam)?;
        if count == 0 || count > num || timeout_ms == 0 {
            return Err(RingError::InvalidParam);
        }

        {
            // Concurrent waiting readers must not loosen a stricter bound
            let _guard = header.mutex.guard();
            if count < header.read_wait_level.load(Ordering::Relaxed) {
                header.read_wait_level.store(count, Ordering::Release);
            }
        }

        reader.touch();
        let timeout = Duration::from_millis(u64::from(timeout_ms));

        while self.calc_reader_level(reader) < count {
            let snapshot = header.cond_read.snapshot();
            if self.calc_reader_level(reader) >= count {
                break;
            }
            let outcome = header.cond_read.wait(snapshot, timeout);
            reader.touch();
            match outcome {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => {
                    return if self.calc_reader_level(reader) < count {
                        Err(RingError::Timeout)
                    } else {
                        Ok(())
                    };
                }
                WaitOutcome::Failed => return Err(RingError::CondWaitFailed),
            }
        }
        Ok(())
    }

    // --- Inspection ---

    /// Lock-free snapshot of offsets, level, and the live reader table.
    pub fn status(&self) -> RingStatus {
        let header = self.header();
        let readers = header
            .readers
            .iter()
            .filter(|slot| !slot.is_free())
            .map(|slot| ReaderStatus {
                id: slot.id.load(Ordering::Acquire),
                offset: slot.offset.load(Ordering::Acquire),
                level: self.calc_reader_level(slot),
                last_access_ns: slot.last_access_ns.load(Ordering::Acquire),
            })
            .collect();

        RingStatus {
            geometry: header.geometry(),
            read_offset: header.read_offset.load(Ordering::Acquire),
            write_offset: header.write_offset.load(Ordering::Acquire),
            buffer_level: header.buffer_level.load(Ordering::Acquire),
            write_in_progress: header.write_in_progress.load(Ordering::Acquire) != 0,
            writer_last_access_ns: header.writer_last_access_ns.load(Ordering::Acquire),
            readers,
        }
    }
}
