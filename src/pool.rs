//! Fixed pool of frame buffers and their ownership states.
//!
//! The pool owns every byte handed to the hardware. Buffers never grow or
//! shrink after allocation; the stream moves them through
//! `Free -> Announced -> Queued -> Filled -> InUse -> Queued ...` and back to
//! `Free` when they are revoked.

use std::collections::TryReserveError;
use std::fmt;

use tracing::{debug, info};

use crate::error::{CameraError, Result};

/// Identifies one buffer of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    /// Position of the buffer in its pool.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ownership state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the pool, not known to any stream.
    Free,
    /// Owned by a stream, eligible to be queued.
    Announced,
    /// Waiting for the hardware to fill it.
    Queued,
    /// Written by the hardware, not yet claimed.
    Filled,
    /// Claimed by the caller; must be queued again before reuse.
    InUse,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Announced => "announced",
            Self::Queued => "queued",
            Self::Filled => "filled",
            Self::InUse => "in use",
        })
    }
}

struct Slot {
    memory: Vec<u8>,
    state: BufferState,
}

/// A fixed set of equally sized, non-aliasing buffers.
pub struct BufferPool {
    slots: Vec<Slot>,
    buffer_size: usize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("len", &self.slots.len())
            .field("buffer_size", &self.buffer_size)
            .field("announced", &self.announced_count())
            .finish()
    }
}

impl BufferPool {
    /// Allocate `count` buffers of `size` bytes, all in the `Free` state.
    pub fn allocate(count: usize, size: usize) -> Result<Self> {
        if count == 0 || size == 0 {
            return Err(CameraError::Allocation(format!(
                "cannot allocate {count} buffers of {size} bytes"
            )));
        }
        count.checked_mul(size).ok_or_else(|| {
            CameraError::Allocation(format!("{count} x {size} bytes overflows the address space"))
        })?;

        let mut slots = Vec::new();
        slots.try_reserve_exact(count).map_err(allocation_error)?;
        for _ in 0..count {
            let mut memory = Vec::new();
            memory.try_reserve_exact(size).map_err(allocation_error)?;
            memory.resize(size, 0);
            slots.push(Slot {
                memory,
                state: BufferState::Free,
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let total_mb = (count * size) as f64 / (1024.0 * 1024.0);
        info!(count, buffer_size = size, total_mb, "buffer pool allocated");

        Ok(Self {
            slots,
            buffer_size: size,
        })
    }

    /// Allocate buffers for a device payload, rejecting undersized requests
    /// before any memory is reserved.
    pub fn allocate_for_payload(count: usize, size: usize, payload_size: usize) -> Result<Self> {
        if size < payload_size {
            return Err(CameraError::Allocation(format!(
                "buffer size {size} is smaller than the {payload_size}-byte payload"
            )));
        }
        Self::allocate(count, size)
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no buffers. Never true for an allocated pool.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Size of every buffer in bytes.
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Ids of all buffers, in allocation order.
    pub fn ids(&self) -> impl Iterator<Item = BufferId> {
        (0..self.slots.len()).map(BufferId)
    }

    /// Ids of buffers currently in `state`.
    pub fn ids_in(&self, state: BufferState) -> Vec<BufferId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == state)
            .map(|(index, _)| BufferId(index))
            .collect()
    }

    /// Number of buffers in `state`.
    pub fn count_in(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Buffers owned by a stream, whatever their queue position.
    pub fn announced_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != BufferState::Free)
            .count()
    }

    /// Current state of a buffer.
    pub fn state(&self, id: BufferId) -> Result<BufferState> {
        self.slot(id).map(|slot| slot.state)
    }

    /// Move a buffer from `Free` to `Announced`.
    pub fn announce(&mut self, id: BufferId) -> Result<()> {
        self.transition(id, &[BufferState::Free], BufferState::Announced)
    }

    /// Move a buffer from `Announced` back to `Free`.
    pub fn revoke(&mut self, id: BufferId) -> Result<()> {
        self.transition(id, &[BufferState::Announced], BufferState::Free)
    }

    pub(crate) fn mark_queued(&mut self, id: BufferId) -> Result<()> {
        self.transition(
            id,
            &[BufferState::Announced, BufferState::InUse],
            BufferState::Queued,
        )
    }

    pub(crate) fn mark_filled(&mut self, id: BufferId) -> Result<()> {
        self.transition(id, &[BufferState::Queued], BufferState::Filled)
    }

    pub(crate) fn claim(&mut self, id: BufferId) -> Result<()> {
        self.transition(id, &[BufferState::Filled], BufferState::InUse)
    }

    pub(crate) fn discard(&mut self, id: BufferId) -> Result<()> {
        self.transition(
            id,
            &[BufferState::Queued, BufferState::Filled, BufferState::InUse],
            BufferState::Announced,
        )
    }

    /// Read access to a buffer's bytes.
    pub fn memory(&self, id: BufferId) -> Result<&[u8]> {
        self.slot(id).map(|slot| slot.memory.as_slice())
    }

    pub(crate) fn memory_mut(&mut self, id: BufferId) -> Result<&mut [u8]> {
        self.slots
            .get_mut(id.0)
            .map(|slot| slot.memory.as_mut_slice())
            .ok_or_else(|| unknown_buffer(id))
    }

    fn slot(&self, id: BufferId) -> Result<&Slot> {
        self.slots.get(id.0).ok_or_else(|| unknown_buffer(id))
    }

    fn transition(&mut self, id: BufferId, from: &[BufferState], to: BufferState) -> Result<()> {
        let slot = self.slots.get_mut(id.0).ok_or_else(|| unknown_buffer(id))?;
        if !from.contains(&slot.state) {
            return Err(CameraError::InvalidState(format!(
                "buffer {id} is {}, cannot become {to}",
                slot.state
            )));
        }
        debug!(buffer = %id, from = %slot.state, %to, "buffer transition");
        slot.state = to;
        Ok(())
    }
}

fn unknown_buffer(id: BufferId) -> CameraError {
    CameraError::InvalidState(format!("buffer {id} does not belong to this pool"))
}

fn allocation_error(err: TryReserveError) -> CameraError {
    CameraError::Allocation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_creates_free_buffers() {
        let pool = BufferPool::allocate(4, 1024).expect("allocate should succeed");
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.buffer_size(), 1024);
        assert_eq!(pool.count_in(BufferState::Free), 4);
        assert_eq!(pool.announced_count(), 0);
    }

    #[test]
    fn test_buffers_do_not_alias() {
        let pool = BufferPool::allocate(3, 64).expect("allocate should succeed");
        let mut starts: Vec<usize> = pool
            .ids()
            .map(|id| pool.memory(id).expect("memory").as_ptr() as usize)
            .collect();
        starts.sort_unstable();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= 64, "buffers overlap: {pair:?}");
        }
    }

    #[test]
    fn test_allocate_rejects_empty_requests() {
        assert!(matches!(
            BufferPool::allocate(0, 1024),
            Err(CameraError::Allocation(_))
        ));
        assert!(matches!(
            BufferPool::allocate(4, 0),
            Err(CameraError::Allocation(_))
        ));
    }

    #[test]
    fn test_allocate_reports_unreservable_memory() {
        let result = BufferPool::allocate(2, usize::MAX / 2);
        assert!(matches!(result, Err(CameraError::Allocation(_))));
    }

    #[test]
    fn test_undersized_buffers_are_rejected() {
        let result = BufferPool::allocate_for_payload(4, 1000, 921_600);
        assert!(matches!(result, Err(CameraError::Allocation(_))));
    }

    #[test]
    fn test_announce_and_revoke() {
        let mut pool = BufferPool::allocate(2, 16).expect("allocate should succeed");
        let id = pool.ids().next().expect("one buffer");

        pool.announce(id).expect("announce should succeed");
        assert_eq!(pool.state(id).expect("state"), BufferState::Announced);
        assert!(pool.announce(id).is_err(), "double announce must fail");

        pool.revoke(id).expect("revoke should succeed");
        assert_eq!(pool.state(id).expect("state"), BufferState::Free);
        assert!(matches!(pool.revoke(id), Err(CameraError::InvalidState(_))));
    }

    #[test]
    fn test_queue_cycle() {
        let mut pool = BufferPool::allocate(1, 16).expect("allocate should succeed");
        let id = BufferId(0);
        pool.announce(id).expect("announce");
        pool.mark_queued(id).expect("queue");
        pool.mark_filled(id).expect("fill");
        pool.claim(id).expect("claim");
        assert!(pool.claim(id).is_err(), "a buffer cannot be claimed twice");
        pool.mark_queued(id).expect("requeue");
        assert!(pool.revoke(id).is_err(), "queued buffers cannot be revoked");
        pool.discard(id).expect("discard");
        pool.revoke(id).expect("revoke");
    }

    #[test]
    fn test_discard_reclaims_claimed_buffer() {
        let mut pool = BufferPool::allocate(1, 16).expect("allocate should succeed");
        let id = BufferId(0);
        pool.announce(id).expect("announce");
        pool.mark_queued(id).expect("queue");
        pool.mark_filled(id).expect("fill");
        pool.claim(id).expect("claim");
        pool.discard(id).expect("claimed buffers are discarded too");
        assert_eq!(pool.state(id).expect("state"), BufferState::Announced);
        assert!(pool.discard(id).is_err(), "announced buffers have nothing to discard");
    }

    #[test]
    fn test_unknown_buffer() {
        let pool = BufferPool::allocate(1, 16).expect("allocate should succeed");
        assert!(pool.state(BufferId(7)).is_err());
    }
}
