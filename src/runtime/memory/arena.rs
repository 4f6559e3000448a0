//! File-backed shared arena
//!
//! The arena is a single shared mapping split into fixed-size slots. Every
//! process that maps the same file sees the same slot headers, so the
//! reference count and generation of a context live next to its data.
//!
//! ```text
//! +--------------------------------------------------------------+
//! | ArenaHeader (64 bytes)                                       |
//! |   magic: u64 | version: u32 | slot_count: u32                |
//! |   slot_size: u32 | data_offset: u32                          |
//! +--------------------------------------------------------------+
//! | SlotHeader[0..N] (16 bytes each)                             |
//! |   word: AtomicU64 = generation << 32 | refcount              |
//! |   state: AtomicU32 | _pad: u32                               |
//! +--------------------------------------------------------------+
//! | SlotData[0..N] (slot_size bytes each)                        |
//! +--------------------------------------------------------------+
//! ```
//!
//! Generation and refcount share one atomic word, so checking the generation
//! and taking a reference happen in a single compare-and-swap. The decrement
//! that drops an attached slot to zero bumps the generation in the same way,
//! which makes every outstanding `ContextRef` to that slot stale.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use super::{ContextRef, MemoryError};
use crate::util::config::ArenaConfig;

/// Magic number identifying an arena file ("TLN_ARNA").
const ARENA_MAGIC: u64 = 0x544C_4E5F_4152_4E41;

/// Current arena layout version.
const ARENA_VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;
const SLOT_HEADER_SIZE: usize = 16;

/// Slot states (stored in shared memory).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot can be acquired.
    Free = 0,
    /// Owner is writing the block; nobody else may look at it.
    Writing = 1,
    /// Block is immutable and has never been attached to a job.
    Published = 2,
    /// Block has been attached at least once; the last release reclaims it.
    Live = 3,
}

impl SlotState {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Writing),
            2 => Some(SlotState::Published),
            3 => Some(SlotState::Live),
            _ => None,
        }
    }
}

#[repr(C)]
struct ArenaHeader {
    magic: u64,
    version: u32,
    slot_count: u32,
    slot_size: u32,
    data_offset: u32,
}

#[repr(C)]
struct SlotHeader {
    word: AtomicU64,
    state: AtomicU32,
    _pad: u32,
}

#[inline]
fn pack(
    generation: u32,
    refcount: u32,
) -> u64 {
    (u64::from(generation) << 32) | u64::from(refcount)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// A shared arena mapped into this process.
///
/// The creating process owns the backing file and removes it on drop;
/// processes that `open` the arena only map it.
pub struct SharedArena {
    base: NonNull<u8>,
    len: usize,
    slot_count: u32,
    slot_size: u32,
    data_offset: u32,
    path: PathBuf,
    /// Rotating start index for slot search, so a freed slot is not reused
    /// immediately.
    hint: AtomicU32,
    _map: MmapMut,
    owned_file: Option<NamedTempFile>,
}

// The mapping is only touched through atomics or through slots that a
// single writer owns in `Writing` state.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl std::fmt::Debug for SharedArena {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SharedArena")
            .field("path", &self.path)
            .field("slot_count", &self.slot_count)
            .field("slot_size", &self.slot_size)
            .field("owner", &self.owned_file.is_some())
            .finish()
    }
}

impl SharedArena {
    /// Create a new arena file and map it.
    pub fn create(config: &ArenaConfig) -> Result<Self, MemoryError> {
        if config.slot_count == 0 || config.slot_size < 16 {
            return Err(MemoryError::BadHeader(format!(
                "invalid arena geometry: {} slots of {} bytes",
                config.slot_count, config.slot_size
            )));
        }

        let data_offset = HEADER_SIZE + SLOT_HEADER_SIZE * config.slot_count as usize;
        // Keep slot data 64-byte aligned.
        let data_offset = (data_offset + 63) & !63;
        let len = data_offset + config.slot_size as usize * config.slot_count as usize;

        let mut builder = tempfile::Builder::new();
        builder.prefix("tasklane-arena-");
        let file = match &config.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.as_file().set_len(len as u64)?;

        // Safety: the file was just created with the right length and stays
        // alive for as long as the mapping.
        let mut map = unsafe { MmapMut::map_mut(file.as_file())? };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| MemoryError::BadHeader("null mapping".to_string()))?;

        let header = ArenaHeader {
            magic: ARENA_MAGIC,
            version: ARENA_VERSION,
            slot_count: config.slot_count,
            slot_size: config.slot_size,
            data_offset: data_offset as u32,
        };
        // Safety: the mapping is at least HEADER_SIZE bytes and page aligned.
        unsafe { std::ptr::write(base.as_ptr().cast::<ArenaHeader>(), header) };

        let path = file.path().to_path_buf();
        debug!(
            path = %path.display(),
            slots = config.slot_count,
            slot_size = config.slot_size,
            "created shared arena"
        );

        Ok(Self {
            base,
            len,
            slot_count: config.slot_count,
            slot_size: config.slot_size,
            data_offset: data_offset as u32,
            path,
            hint: AtomicU32::new(0),
            _map: map,
            owned_file: Some(file),
        })
    }

    /// Map an existing arena created by another process.
    pub fn open(path: &Path) -> Result<Self, MemoryError> {
        let file: File = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(MemoryError::BadHeader(format!(
                "{} is too small to be an arena",
                path.display()
            )));
        }

        // Safety: the file is kept open by the mapping; the creator never
        // truncates it while workers are running.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| MemoryError::BadHeader("null mapping".to_string()))?;

        // Safety: length checked above.
        let header = unsafe { std::ptr::read(base.as_ptr().cast::<ArenaHeader>()) };
        if header.magic != ARENA_MAGIC {
            return Err(MemoryError::BadHeader(format!(
                "bad magic {:#018x} in {}",
                header.magic,
                path.display()
            )));
        }
        if header.version != ARENA_VERSION {
            return Err(MemoryError::BadHeader(format!(
                "unsupported arena version {}",
                header.version
            )));
        }
        let expected = header.data_offset as usize + header.slot_size as usize * header.slot_count as usize;
        if expected > len {
            return Err(MemoryError::BadHeader(format!(
                "arena geometry needs {} bytes, file has {}",
                expected, len
            )));
        }

        debug!(path = %path.display(), slots = header.slot_count, "opened shared arena");

        Ok(Self {
            base,
            len,
            slot_count: header.slot_count,
            slot_size: header.slot_size,
            data_offset: header.data_offset,
            path: path.to_path_buf(),
            hint: AtomicU32::new(0),
            _map: map,
            owned_file: None,
        })
    }

    /// Path of the backing file, passed to worker processes.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// Whether this process created (and will delete) the arena file.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owned_file.is_some()
    }

    fn slot_header(
        &self,
        slot: u32,
    ) -> &SlotHeader {
        debug_assert!(slot < self.slot_count);
        // Safety: slot headers are 16-byte aligned inside the mapping and
        // `slot` was bounds-checked by the caller.
        unsafe {
            &*self
                .base
                .as_ptr()
                .add(HEADER_SIZE + SLOT_HEADER_SIZE * slot as usize)
                .cast::<SlotHeader>()
        }
    }

    fn slot_offset(
        &self,
        slot: u32,
    ) -> u64 {
        u64::from(self.data_offset) + u64::from(slot) * u64::from(self.slot_size)
    }

    fn check_ref(
        &self,
        ctx: &ContextRef,
    ) -> Result<(), MemoryError> {
        if ctx.slot >= self.slot_count {
            return Err(MemoryError::Corrupted(format!(
                "slot {} out of range (arena has {})",
                ctx.slot, self.slot_count
            )));
        }
        if ctx.arena_offset != self.slot_offset(ctx.slot) || ctx.byte_length > self.slot_size {
            return Err(MemoryError::Corrupted(format!(
                "context ref for slot {} does not match the arena layout",
                ctx.slot
            )));
        }
        Ok(())
    }

    fn state(
        &self,
        slot: u32,
    ) -> Result<SlotState, MemoryError> {
        let raw = self.slot_header(slot).state.load(Ordering::Acquire);
        SlotState::from_u32(raw)
            .ok_or_else(|| MemoryError::Corrupted(format!("slot {} has invalid state {}", slot, raw)))
    }

    /// Claim a free slot for writing.
    pub fn acquire(&self) -> Result<SlotWriter<'_>, MemoryError> {
        let start = self.hint.fetch_add(1, Ordering::Relaxed) % self.slot_count;
        for i in 0..self.slot_count {
            let slot = (start + i) % self.slot_count;
            let header = self.slot_header(slot);
            if header
                .state
                .compare_exchange(
                    SlotState::Free as u32,
                    SlotState::Writing as u32,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let (generation, refcount) = unpack(header.word.load(Ordering::Acquire));
                if refcount != 0 {
                    header.state.store(SlotState::Free as u32, Ordering::Release);
                    return Err(MemoryError::Corrupted(format!(
                        "free slot {} has refcount {}",
                        slot, refcount
                    )));
                }
                trace!(slot, generation, "acquired arena slot");
                return Ok(SlotWriter {
                    arena: self,
                    slot,
                    generation,
                    published: false,
                });
            }
        }
        Err(MemoryError::ArenaFull(self.slot_count))
    }

    /// Current generation and refcount of a slot.
    pub fn slot_word(
        &self,
        slot: u32,
    ) -> Option<(u32, u32)> {
        (slot < self.slot_count).then(|| unpack(self.slot_header(slot).word.load(Ordering::Acquire)))
    }

    /// Current state of a slot.
    pub fn slot_state(
        &self,
        slot: u32,
    ) -> Option<SlotState> {
        (slot < self.slot_count)
            .then(|| self.state(slot).ok())
            .flatten()
    }

    /// Add one reference to a published context.
    ///
    /// Returns the new refcount. The generation check and the increment are
    /// a single atomic step.
    pub fn acquire_ref(
        &self,
        ctx: &ContextRef,
    ) -> Result<u32, MemoryError> {
        self.check_ref(ctx)?;
        let header = self.slot_header(ctx.slot);
        let mut current = header.word.load(Ordering::Acquire);
        loop {
            let (generation, refcount) = unpack(current);
            if generation != ctx.generation {
                return Err(MemoryError::StaleGeneration {
                    slot: ctx.slot,
                    expected: ctx.generation,
                    found: generation,
                });
            }
            let next = refcount.checked_add(1).ok_or_else(|| {
                MemoryError::Corrupted(format!("refcount overflow on slot {}", ctx.slot))
            })?;
            match header.word.compare_exchange_weak(
                current,
                pack(generation, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // The generation matched while we took the reference, so the slot
        // cannot be Free or Writing unless the layout is corrupted.
        match self.state(ctx.slot)? {
            SlotState::Published | SlotState::Live => Ok(unpack(current).1 + 1),
            other => {
                self.release_ref(ctx)?;
                Err(MemoryError::Corrupted(format!(
                    "slot {} referenced in state {:?}",
                    ctx.slot, other
                )))
            }
        }
    }

    /// Mark a published slot as attached, so the last release reclaims it.
    pub(crate) fn mark_live(
        &self,
        slot: u32,
    ) {
        let _ = self.slot_header(slot).state.compare_exchange(
            SlotState::Published as u32,
            SlotState::Live as u32,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Drop one reference. Returns the new refcount.
    ///
    /// When the count of an attached slot reaches zero the slot is reclaimed:
    /// its generation is bumped and it becomes free.
    pub fn release_ref(
        &self,
        ctx: &ContextRef,
    ) -> Result<u32, MemoryError> {
        self.check_ref(ctx)?;
        let header = self.slot_header(ctx.slot);
        let mut current = header.word.load(Ordering::Acquire);
        let remaining = loop {
            let (generation, refcount) = unpack(current);
            if generation != ctx.generation {
                return Err(MemoryError::StaleGeneration {
                    slot: ctx.slot,
                    expected: ctx.generation,
                    found: generation,
                });
            }
            if refcount == 0 {
                return Err(MemoryError::Corrupted(format!(
                    "refcount underflow on slot {}",
                    ctx.slot
                )));
            }
            match header.word.compare_exchange_weak(
                current,
                pack(generation, refcount - 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break refcount - 1,
                Err(actual) => current = actual,
            }
        };

        if remaining == 0 && self.state(ctx.slot)? == SlotState::Live {
            self.reclaim(ctx.slot, ctx.generation);
        }
        Ok(remaining)
    }

    /// Free a published slot that was never attached.
    pub fn discard(
        &self,
        ctx: &ContextRef,
    ) -> Result<(), MemoryError> {
        self.check_ref(ctx)?;
        let (generation, refcount) = unpack(self.slot_header(ctx.slot).word.load(Ordering::Acquire));
        if generation != ctx.generation {
            return Err(MemoryError::StaleGeneration {
                slot: ctx.slot,
                expected: ctx.generation,
                found: generation,
            });
        }
        if refcount != 0 || self.state(ctx.slot)? != SlotState::Published {
            return Err(MemoryError::InUse(ctx.slot));
        }
        if self.reclaim(ctx.slot, ctx.generation) {
            Ok(())
        } else {
            Err(MemoryError::InUse(ctx.slot))
        }
    }

    /// Bump the generation of an unreferenced slot and free it.
    ///
    /// Fails (returns false) when a reader took a reference in the meantime;
    /// that reader's release will reclaim instead.
    fn reclaim(
        &self,
        slot: u32,
        generation: u32,
    ) -> bool {
        let header = self.slot_header(slot);
        let reclaimed = header
            .word
            .compare_exchange(
                pack(generation, 0),
                pack(generation.wrapping_add(1), 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if reclaimed {
            header.state.store(SlotState::Free as u32, Ordering::Release);
            debug!(slot, generation, "reclaimed context slot");
        }
        reclaimed
    }

    /// Borrow the data of a referenced slot.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference on `ctx` for the lifetime of the
    /// returned slice.
    pub(crate) unsafe fn data(
        &self,
        ctx: &ContextRef,
    ) -> &[u8] {
        let start = self.slot_offset(ctx.slot) as usize;
        debug_assert!(start + ctx.byte_length as usize <= self.len);
        std::slice::from_raw_parts(self.base.as_ptr().add(start), ctx.byte_length as usize)
    }

    /// Number of slots that are published or live.
    pub fn occupied(&self) -> usize {
        (0..self.slot_count)
            .filter(|&slot| {
                matches!(
                    self.slot_state(slot),
                    Some(SlotState::Published) | Some(SlotState::Live)
                )
            })
            .count()
    }
}

/// Exclusive write access to a slot in `Writing` state.
///
/// Dropping the writer without publishing frees the slot again.
pub struct SlotWriter<'a> {
    arena: &'a SharedArena,
    slot: u32,
    generation: u32,
    published: bool,
}

impl<'a> SlotWriter<'a> {
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The slot's data area.
    pub fn buffer(&mut self) -> &mut [u8] {
        let start = self.arena.slot_offset(self.slot) as usize;
        // Safety: the slot is in Writing state, which only this writer could
        // have set, so nobody else reads or writes this range.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.base.as_ptr().add(start),
                self.arena.slot_size as usize,
            )
        }
    }

    /// Make the first `len` bytes immutable and visible to readers.
    pub fn publish(
        mut self,
        len: usize,
    ) -> Result<ContextRef, MemoryError> {
        if len > self.arena.slot_size as usize {
            return Err(MemoryError::TooLarge {
                size: len,
                slot_size: self.arena.slot_size,
            });
        }
        self.published = true;
        self.arena
            .slot_header(self.slot)
            .state
            .store(SlotState::Published as u32, Ordering::Release);
        Ok(ContextRef {
            slot: self.slot,
            arena_offset: self.arena.slot_offset(self.slot),
            byte_length: len as u32,
            generation: self.generation,
        })
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.arena
                .slot_header(self.slot)
                .state
                .store(SlotState::Free as u32, Ordering::Release);
        }
    }
}
