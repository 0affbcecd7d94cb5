//! Arena of fixed-length DMA buffers addressed by index/generation handles.
//!
//! Buffers are allocated once when the arena is built and never move, so the
//! hardware may keep writing into one while software works on another.
//! Ownership is tracked per slot with an atomic [`BufferState`] instead of a
//! reference count: a buffer is either free, posted to hardware, being waited
//! on, ready for software, or being processed, and every queue operation is a
//! checked state transition.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use daq_core::limits::MAX_NUM_BUFFERS;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{PoolError, Result};

/// Copyable reference to one arena slot.
///
/// The generation changes every time the arena is drained, so a handle kept
/// past shutdown can never reach a buffer leased by a later acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    /// Slot index inside the arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Lease generation this handle was issued for.
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Where a buffer currently lives.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Not leased; contents meaningless
    Free = 0,
    /// In the `posted` queue; hardware owns the memory
    Posted = 1,
    /// Popped from `posted`, receive thread is waiting for completion
    Waiting = 2,
    /// In the `ready` queue; filled and owned by software
    Ready = 3,
    /// Held by whoever popped it for reassembly
    Processing = 4,
}

impl BufferState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Posted,
            2 => Self::Waiting,
            3 => Self::Ready,
            4 => Self::Processing,
            _ => Self::Free,
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Free => "free",
            Self::Posted => "posted",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Processing => "processing",
        };
        write!(f, "{}", label)
    }
}

/// One fixed-length DMA buffer.
pub struct DmaBuffer {
    len: usize,
    generation: AtomicU32,
    state: AtomicU8,
    data: Mutex<Vec<u8>>,
}

impl DmaBuffer {
    fn new(len: usize) -> Self {
        Self {
            len,
            generation: AtomicU32::new(0),
            state: AtomicU8::new(BufferState::Free as u8),
            data: Mutex::new(vec![0u8; len]),
        }
    }

    /// Length of the buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds zero bytes (never true for arena buffers).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current state of the slot.
    #[must_use]
    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Lock the buffer contents.
    ///
    /// The lock is uncontended in normal operation: the state machine already
    /// guarantees a single owner. It exists so the simulated SDK and the
    /// reassembler can both touch the bytes without `unsafe`.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }
}

/// Fixed set of equally sized DMA buffers.
pub struct DmaArena {
    slots: Box<[DmaBuffer]>,
    buffer_len: usize,
}

impl DmaArena {
    /// Allocate `count` buffers of `buffer_len` bytes each.
    ///
    /// `count` must not exceed [`MAX_NUM_BUFFERS`] so the bounded queues can
    /// always accept every buffer.
    pub fn new(count: usize, buffer_len: usize) -> Result<Arc<Self>> {
        if count == 0 || count > MAX_NUM_BUFFERS {
            return Err(PoolError::InvalidSize {
                requested: count,
                max: MAX_NUM_BUFFERS,
            });
        }
        if buffer_len == 0 {
            return Err(PoolError::ZeroLength);
        }

        let slots: Box<[DmaBuffer]> = (0..count).map(|_| DmaBuffer::new(buffer_len)).collect();

        info!(
            count,
            buffer_len,
            total_mb = (count * buffer_len) as f64 / (1024.0 * 1024.0),
            "DMA arena allocated"
        );

        Ok(Arc::new(Self { slots, buffer_len }))
    }

    /// Number of buffers in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena has no buffers (never true once constructed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Length of each buffer in bytes.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Resolve a handle, rejecting stale or out-of-range handles.
    pub fn buffer(&self, handle: BufferHandle) -> Result<&DmaBuffer> {
        let slot = self.slots.get(handle.index()).ok_or(PoolError::OutOfRange {
            handle,
            size: self.slots.len(),
        })?;
        let current = slot.generation.load(Ordering::Acquire);
        if current != handle.generation {
            return Err(PoolError::StaleHandle { handle, current });
        }
        Ok(slot)
    }

    /// Number of slots currently in `state`.
    #[must_use]
    pub fn count(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|s| s.state() == state).count()
    }

    /// Claim a free slot and move it straight into `to`.
    pub(crate) fn lease(&self, to: BufferState) -> Result<BufferHandle> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(
                    BufferState::Free as u8,
                    to as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let handle = BufferHandle {
                    index: index as u32,
                    generation: slot.generation.load(Ordering::Acquire),
                };
                debug!(%handle, state = %to, "leased DMA buffer");
                return Ok(handle);
            }
        }
        Err(PoolError::Exhausted {
            size: self.slots.len(),
        })
    }

    /// Atomically move a buffer from `from` to `to`.
    pub(crate) fn transition(
        &self,
        handle: BufferHandle,
        from: BufferState,
        to: BufferState,
    ) -> Result<()> {
        let slot = self.buffer(handle)?;
        slot.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| PoolError::InvalidTransition {
                handle,
                expected: from,
                actual: BufferState::from_u8(actual),
            })
    }

    /// Return every slot to `Free` and invalidate outstanding handles.
    ///
    /// Returns the number of slots that were leased.
    pub(crate) fn release_all(&self) -> usize {
        let mut released = 0;
        for slot in self.slots.iter() {
            let previous = slot.state.swap(BufferState::Free as u8, Ordering::AcqRel);
            if previous != BufferState::Free as u8 {
                slot.generation.fetch_add(1, Ordering::AcqRel);
                released += 1;
            }
        }
        released
    }
}
