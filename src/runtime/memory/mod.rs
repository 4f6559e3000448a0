//! Shared-memory contexts
//!
//! A context is an immutable `Value` graph flattened into one slot of a
//! file-backed shared arena. The dispatching process publishes it once;
//! worker processes map the same file and read it without copying.
//!
//! Lifetime rules:
//! - all writes happen before `publish`, nothing is written afterwards
//! - `attach` adds one reference per job that will read the context
//! - `detach` drops it when the job's response is retrieved or abandoned
//! - readers take a transient reference for the duration of a read
//! - the release that drops an attached context to zero reclaims the slot and
//!   bumps its generation, so any later read through an old `ContextRef`
//!   fails with `StaleGeneration`

mod arena;
pub mod layout;
mod view;

pub use arena::{SharedArena, SlotState, SlotWriter};
pub use layout::{encoded_len, flatten_into, flatten_to_vec};
pub use view::ContextView;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::runtime::value::{Value, ValueKind};
use crate::util::config::ArenaConfig;

/// Shared-memory errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("arena I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid arena: {0}")]
    BadHeader(String),

    #[error("context needs {size} bytes but slots hold {slot_size}")]
    TooLarge { size: usize, slot_size: u32 },

    #[error("all {0} arena slots are in use")]
    ArenaFull(u32),

    #[error("stale context for slot {slot}: generation {expected}, arena has {found}")]
    StaleGeneration { slot: u32, expected: u32, found: u32 },

    #[error("shared memory corrupted: {0}")]
    Corrupted(String),

    #[error("context slot {0} is still referenced")]
    InUse(u32),

    #[error("expected {expected}, found {found}")]
    KindMismatch { expected: ValueKind, found: ValueKind },
}

impl MemoryError {
    /// Corruption errors signal a logic bug; the affected dispatch must be
    /// aborted rather than retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemoryError::StaleGeneration { .. } | MemoryError::Corrupted(_)
        )
    }
}

/// Reference to a published context.
///
/// Plain data: it can be copied into a job request and sent to another
/// process. Its validity is checked against the arena on every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextRef {
    pub slot: u32,
    pub arena_offset: u64,
    pub byte_length: u32,
    pub generation: u32,
}

impl ContextRef {
    /// Start a read. The returned guard holds a transient reference until it
    /// is dropped.
    pub fn read<'a>(
        &self,
        arena: &'a SharedArena,
    ) -> Result<ReadGuard<'a>, MemoryError> {
        arena.acquire_ref(self)?;
        trace!(slot = self.slot, generation = self.generation, "context read started");
        Ok(ReadGuard { arena, ctx: *self })
    }
}

/// A transient reference held while reading a context.
pub struct ReadGuard<'a> {
    arena: &'a SharedArena,
    ctx: ContextRef,
}

impl<'a> ReadGuard<'a> {
    /// Raw block bytes.
    pub fn bytes(&self) -> &[u8] {
        // Safety: this guard holds a reference on the slot.
        unsafe { self.arena.data(&self.ctx) }
    }

    /// Root node of the block.
    pub fn view(&self) -> Result<ContextView<'_>, MemoryError> {
        ContextView::root(self.bytes())
    }

    pub fn context(&self) -> &ContextRef {
        &self.ctx
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.arena.release_ref(&self.ctx) {
            error!(slot = self.ctx.slot, error = %e, "failed to release context read");
        }
    }
}

/// Counters for context lifetime events.
#[derive(Debug, Default)]
pub struct ContextStats {
    pub published: AtomicUsize,
    pub attached: AtomicUsize,
    pub detached: AtomicUsize,
    pub discarded: AtomicUsize,
}

/// Publishes and reference-counts contexts in a shared arena.
#[derive(Debug, Clone)]
pub struct ContextManager {
    arena: Arc<SharedArena>,
    stats: Arc<ContextStats>,
}

impl ContextManager {
    /// Create a manager over a fresh arena.
    pub fn create(config: &ArenaConfig) -> Result<Self, MemoryError> {
        Ok(Self::with_arena(Arc::new(SharedArena::create(config)?)))
    }

    pub fn with_arena(arena: Arc<SharedArena>) -> Self {
        Self {
            arena,
            stats: Arc::new(ContextStats::default()),
        }
    }

    #[inline]
    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }

    #[inline]
    pub fn stats(&self) -> &ContextStats {
        &self.stats
    }

    /// Flatten `value` into a free slot and make it immutable.
    ///
    /// The returned context has refcount 0.
    pub fn publish(
        &self,
        value: &Value,
    ) -> Result<ContextRef, MemoryError> {
        let needed = encoded_len(value);
        if needed > self.arena.slot_size() as usize {
            return Err(MemoryError::TooLarge {
                size: needed,
                slot_size: self.arena.slot_size(),
            });
        }
        let mut writer = self.arena.acquire()?;
        let len = flatten_into(value, writer.buffer())?;
        let ctx = writer.publish(len)?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(slot = ctx.slot, generation = ctx.generation, bytes = len, "published context");
        Ok(ctx)
    }

    /// Add the reference of one job. Returns the new refcount.
    pub fn attach(
        &self,
        ctx: &ContextRef,
    ) -> Result<u32, MemoryError> {
        let count = self.arena.acquire_ref(ctx)?;
        self.arena.mark_live(ctx.slot);
        self.stats.attached.fetch_add(1, Ordering::Relaxed);
        trace!(slot = ctx.slot, refcount = count, "attached context");
        Ok(count)
    }

    /// Drop the reference of one job. Returns the new refcount; at zero the
    /// slot has been reclaimed.
    pub fn detach(
        &self,
        ctx: &ContextRef,
    ) -> Result<u32, MemoryError> {
        let count = self.arena.release_ref(ctx)?;
        self.stats.detached.fetch_add(1, Ordering::Relaxed);
        trace!(slot = ctx.slot, refcount = count, "detached context");
        Ok(count)
    }

    /// Reclaim a context that was published but never attached.
    pub fn discard(
        &self,
        ctx: &ContextRef,
    ) -> Result<(), MemoryError> {
        self.arena.discard(ctx)?;
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Start a read of `ctx` in this process.
    pub fn read(
        &self,
        ctx: &ContextRef,
    ) -> Result<ReadGuard<'_>, MemoryError> {
        ctx.read(&self.arena)
    }

    /// Current refcount, or `StaleGeneration` once the slot was reclaimed.
    pub fn refcount(
        &self,
        ctx: &ContextRef,
    ) -> Result<u32, MemoryError> {
        let (generation, refcount) = self
            .arena
            .slot_word(ctx.slot)
            .ok_or_else(|| MemoryError::Corrupted(format!("slot {} out of range", ctx.slot)))?;
        if generation != ctx.generation {
            return Err(MemoryError::StaleGeneration {
                slot: ctx.slot,
                expected: ctx.generation,
                found: generation,
            });
        }
        Ok(refcount)
    }

    /// Number of contexts currently published or attached.
    pub fn live_contexts(&self) -> usize {
        self.arena.occupied()
    }
}

#[cfg(test)]
pub(crate) mod tests;
