//! Fixed-size DMA buffer arena and the queue set that keeps it in flight.
//!
//! A digitizer streams into a small pool of DMA buffers that circulate
//! between the hardware and software forever. This crate provides the two
//! pieces that make that safe without shared-pointer lifetimes:
//!
//! - [`DmaArena`]: every buffer is allocated once, up front, and addressed by
//!   a copyable [`BufferHandle`] (slot index + generation). Each slot tracks
//!   a [`BufferState`], so a handle can only be in one place at a time.
//! - [`QueueSet`]: the three FIFO queues the acquisition thread and the
//!   API thread pass handles through:
//!   - `owner`: every leased buffer, drained once at shutdown
//!   - `posted`: buffers submitted to hardware, in submission order
//!   - `ready`: buffers the hardware filled, awaiting software
//!
//! # Buffer Flow
//!
//! ```text
//!   lease_and_post ──► posted ──pop_posted──► Waiting (hardware wait)
//!                        ▲                        │
//!                        │                   push_ready
//!                    repost                       ▼
//!                        │                      ready
//!                        │                        │
//!                   Processing ◄──pop_ready───────┘
//! ```
//!
//! Memory is only released by [`QueueSet::drain`], which the caller must
//! invoke after the hardware has been told to stop writing. Draining bumps
//! every slot's generation, so any handle still held elsewhere goes stale
//! instead of aliasing a reused buffer.
//!
//! # Example
//!
//! ```
//! use daq_pool::{DmaArena, QueueSet};
//!
//! # fn main() -> Result<(), daq_pool::PoolError> {
//! let arena = DmaArena::new(4, 8192)?;
//! let queues = QueueSet::new(arena);
//!
//! let handle = queues.lease_and_post()?;
//! assert_eq!(queues.pop_posted()?, Some(handle));
//! queues.push_ready(handle)?;
//! assert_eq!(queues.pop_ready()?, Some(handle));
//!
//! queues.drain();
//! assert!(queues.census().is_empty());
//! # Ok(())
//! # }
//! ```

/// Slot arena with generation-checked handles
pub mod arena;
/// Owner, posted and ready queues over the arena
pub mod queues;

pub use arena::{BufferHandle, BufferState, DmaArena, DmaBuffer};
pub use queues::{QueueCensus, QueueSet};

use thiserror::Error;

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors raised by the arena and queue set.
///
/// All of these indicate a broken invariant in the caller (double post,
/// stale handle after shutdown, oversize pool) rather than a transient
/// condition, so none are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Requested pool size is zero or above the in-flight bound
    #[error("Invalid pool size {requested}: must be between 1 and {max}")]
    InvalidSize {
        /// Requested number of buffers
        requested: usize,
        /// Largest pool allowed
        max: usize,
    },

    /// Buffers must hold at least one byte
    #[error("Buffer length must be greater than 0")]
    ZeroLength,

    /// Every slot is already leased
    #[error("No free buffer left in the arena ({size} slots)")]
    Exhausted {
        /// Number of slots in the arena
        size: usize,
    },

    /// Handle index is outside the arena
    #[error("Handle {handle} is out of range for an arena of {size} buffers")]
    OutOfRange {
        /// Offending handle
        handle: BufferHandle,
        /// Number of slots in the arena
        size: usize,
    },

    /// Handle refers to an earlier lease of the slot
    #[error("Stale handle {handle}: buffer generation is now {current}")]
    StaleHandle {
        /// Offending handle
        handle: BufferHandle,
        /// Generation the slot has reached
        current: u32,
    },

    /// Queue transition attempted from the wrong state
    #[error("Buffer {handle} is {actual}, expected {expected}")]
    InvalidTransition {
        /// Buffer that was found out of place
        handle: BufferHandle,
        /// State the transition starts from
        expected: BufferState,
        /// State the buffer was actually in
        actual: BufferState,
    },

    /// Queue is at capacity (only possible if the arena outgrew the bound)
    #[error("{queue} queue full (capacity {capacity})")]
    QueueFull {
        /// `owner`, `posted` or `ready`
        queue: &'static str,
        /// Bound of the queue
        capacity: usize,
    },
}
