//! Triple queue set: `owner`, `posted`, `ready`.
//!
//! All three queues are bounded lock-free FIFOs sized to
//! [`MAX_NUM_BUFFERS`], so a push only fails if the arena was built larger
//! than the bound allows (which [`DmaArena::new`] already rejects).
//!
//! Each queue has exactly one producer and one consumer while an acquisition
//! runs: the receive thread pops `posted` and pushes `ready`, the API thread
//! pops `ready` and pushes `posted` again after reassembly.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use daq_core::limits::MAX_NUM_BUFFERS;
use tracing::{debug, warn};

use crate::arena::{BufferHandle, BufferState, DmaArena, DmaBuffer};
use crate::{PoolError, Result};

/// Snapshot of where the arena's buffers are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCensus {
    /// Handles queued in `posted`
    pub posted: usize,
    /// Handles queued in `ready`
    pub ready: usize,
    /// Buffers the receive thread is waiting on
    pub waiting: usize,
    /// Buffers being reassembled or transmitted
    pub processing: usize,
    /// Buffers leased since the last drain
    pub owned: usize,
}

impl QueueCensus {
    /// Buffers accounted for outside the `owner` queue.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.posted + self.ready + self.waiting + self.processing
    }

    /// True once every queue is empty and no buffer is leased.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owned == 0 && self.in_flight() == 0
    }
}

/// The three queues plus the arena they index into.
pub struct QueueSet {
    arena: Arc<DmaArena>,
    owner: ArrayQueue<BufferHandle>,
    posted: ArrayQueue<BufferHandle>,
    ready: ArrayQueue<BufferHandle>,
}

impl QueueSet {
    /// Empty queues over `arena`; nothing is leased yet.
    pub fn new(arena: Arc<DmaArena>) -> Self {
        Self {
            arena,
            owner: ArrayQueue::new(MAX_NUM_BUFFERS),
            posted: ArrayQueue::new(MAX_NUM_BUFFERS),
            ready: ArrayQueue::new(MAX_NUM_BUFFERS),
        }
    }

    /// The arena the handles index into.
    #[must_use]
    pub fn arena(&self) -> &Arc<DmaArena> {
        &self.arena
    }

    /// Resolve a handle to its buffer.
    pub fn buffer(&self, handle: BufferHandle) -> Result<&DmaBuffer> {
        self.arena.buffer(handle)
    }

    /// Lease a free buffer, record it in `owner` and append it to `posted`.
    ///
    /// The caller hands the buffer to hardware afterwards; on failure it must
    /// [`drain`](Self::drain) rather than retry.
    pub fn lease_and_post(&self) -> Result<BufferHandle> {
        let handle = self.arena.lease(BufferState::Posted)?;
        push(&self.owner, "owner", handle)?;
        push(&self.posted, "posted", handle)?;
        Ok(handle)
    }

    /// Return a processed buffer to `posted` for reuse.
    pub fn push_posted(&self, handle: BufferHandle) -> Result<()> {
        self.arena
            .transition(handle, BufferState::Processing, BufferState::Posted)?;
        push(&self.posted, "posted", handle)
    }

    /// Oldest posted buffer, marked as being waited on.
    ///
    /// `Ok(None)` means the queue is empty. A buffer found in the wrong
    /// state is reported as [`PoolError::InvalidTransition`] carrying its
    /// handle; it stays recorded in `owner` until [`drain`](Self::drain).
    pub fn pop_posted(&self) -> Result<Option<BufferHandle>> {
        pop(&self.arena, &self.posted, "posted", BufferState::Posted, BufferState::Waiting)
    }

    /// Publish a buffer the hardware finished filling.
    pub fn push_ready(&self, handle: BufferHandle) -> Result<()> {
        self.arena
            .transition(handle, BufferState::Waiting, BufferState::Ready)?;
        push(&self.ready, "ready", handle)
    }

    /// Oldest filled buffer, now owned by the caller for processing.
    ///
    /// Fails like [`pop_posted`](Self::pop_posted) on a misplaced buffer.
    pub fn pop_ready(&self) -> Result<Option<BufferHandle>> {
        pop(&self.arena, &self.ready, "ready", BufferState::Ready, BufferState::Processing)
    }

    /// Take a just-completed buffer straight to processing, skipping `ready`.
    ///
    /// Used when the receive thread consumes the data itself (streaming).
    pub fn complete_in_place(&self, handle: BufferHandle) -> Result<()> {
        self.arena
            .transition(handle, BufferState::Waiting, BufferState::Processing)
    }

    /// Empty every queue and free every leased buffer.
    ///
    /// Only call this after the hardware has been told to abort; any buffer
    /// still posted would otherwise be freed under an active DMA transfer.
    /// Returns the number of buffers released.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.posted.pop().is_some() {
            dropped += 1;
        }
        while self.ready.pop().is_some() {
            dropped += 1;
        }
        let mut owned = 0;
        while self.owner.pop().is_some() {
            owned += 1;
        }
        let released = self.arena.release_all();
        debug!(owned, released, queued = dropped, "queue set drained");
        released
    }

    /// Count buffers by queue and state.
    #[must_use]
    pub fn census(&self) -> QueueCensus {
        QueueCensus {
            posted: self.posted.len(),
            ready: self.ready.len(),
            waiting: self.arena.count(BufferState::Waiting),
            processing: self.arena.count(BufferState::Processing),
            owned: self.owner.len(),
        }
    }
}

fn pop(
    arena: &DmaArena,
    queue: &ArrayQueue<BufferHandle>,
    name: &'static str,
    from: BufferState,
    to: BufferState,
) -> Result<Option<BufferHandle>> {
    let Some(handle) = queue.pop() else {
        return Ok(None);
    };
    arena.transition(handle, from, to).inspect_err(|e| {
        warn!(%handle, queue = name, error = %e, "queue held a buffer in the wrong state");
    })?;
    Ok(Some(handle))
}

fn push(queue: &ArrayQueue<BufferHandle>, name: &'static str, handle: BufferHandle) -> Result<()> {
    queue.push(handle).map_err(|_| PoolError::QueueFull {
        queue: name,
        capacity: queue.capacity(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn queues(count: usize, len: usize) -> QueueSet {
        QueueSet::new(DmaArena::new(count, len).unwrap())
    }

    #[test]
    fn test_lease_records_owner_and_posted() {
        let q = queues(4, 64);
        for _ in 0..4 {
            q.lease_and_post().unwrap();
        }
        let census = q.census();
        assert_eq!(census.owned, 4);
        assert_eq!(census.posted, 4);
        assert_eq!(census.in_flight(), 4);
        assert!(matches!(
            q.lease_and_post(),
            Err(PoolError::Exhausted { size: 4 })
        ));
    }

    #[test]
    fn test_posted_is_fifo() {
        let q = queues(3, 16);
        let a = q.lease_and_post().unwrap();
        let b = q.lease_and_post().unwrap();
        let c = q.lease_and_post().unwrap();
        assert_eq!(q.pop_posted().unwrap(), Some(a));
        assert_eq!(q.pop_posted().unwrap(), Some(b));
        assert_eq!(q.pop_posted().unwrap(), Some(c));
        assert_eq!(q.pop_posted().unwrap(), None);
        assert_eq!(q.pop_ready().unwrap(), None);
    }

    #[test]
    fn test_buffer_in_exactly_one_place() {
        let q = queues(4, 16);
        let handles: Vec<_> = (0..4).map(|_| q.lease_and_post().unwrap()).collect();

        // one waiting, one ready, one processing, one still posted
        let w = q.pop_posted().unwrap().unwrap();
        q.push_ready(w).unwrap();
        let r = q.pop_posted().unwrap().unwrap();
        q.push_ready(r).unwrap();
        let p = q.pop_ready().unwrap().unwrap();
        let _waiting = q.pop_posted().unwrap().unwrap();

        assert_eq!(p, handles[0]);
        let census = q.census();
        assert_eq!(census.posted, 1);
        assert_eq!(census.ready, 1);
        assert_eq!(census.waiting, 1);
        assert_eq!(census.processing, 1);
        assert_eq!(census.in_flight(), census.owned);
    }

    #[test]
    fn test_repost_after_processing() {
        let q = queues(1, 16);
        q.lease_and_post().unwrap();
        let h = q.pop_posted().unwrap().unwrap();
        q.push_ready(h).unwrap();
        let h = q.pop_ready().unwrap().unwrap();

        // cannot skip processing and publish twice
        assert!(q.push_ready(h).is_err());

        q.push_posted(h).unwrap();
        assert_eq!(q.census().posted, 1);
        assert_eq!(q.pop_posted().unwrap(), Some(h));
    }

    #[test]
    fn test_misplaced_buffer_is_reported_not_dropped() {
        let q = queues(2, 16);
        let h = q.lease_and_post().unwrap();
        let other = q.lease_and_post().unwrap();
        // knock the head of `posted` out of the Posted state
        q.arena()
            .transition(h, BufferState::Posted, BufferState::Processing)
            .unwrap();

        assert_eq!(
            q.pop_posted(),
            Err(PoolError::InvalidTransition {
                handle: h,
                expected: BufferState::Posted,
                actual: BufferState::Processing,
            })
        );
        // the queue moves on and the bad buffer is still owned
        assert_eq!(q.pop_posted().unwrap(), Some(other));
        assert_eq!(q.census().owned, 2);
        assert_eq!(q.census().processing, 1);

        q.push_ready(other).unwrap();
        q.arena()
            .transition(other, BufferState::Ready, BufferState::Posted)
            .unwrap();
        assert!(matches!(
            q.pop_ready(),
            Err(PoolError::InvalidTransition { handle, .. }) if handle == other
        ));
        assert_eq!(q.drain(), 2);
    }

    #[test]
    fn test_complete_in_place_skips_ready() {
        let q = queues(2, 16);
        q.lease_and_post().unwrap();
        let h = q.pop_posted().unwrap().unwrap();
        q.complete_in_place(h).unwrap();
        assert_eq!(q.census().ready, 0);
        assert_eq!(q.census().processing, 1);
        q.push_posted(h).unwrap();
    }

    #[test]
    fn test_drain_empties_everything_and_stales_handles() {
        let q = queues(4, 16);
        for _ in 0..4 {
            q.lease_and_post().unwrap();
        }
        let h = q.pop_posted().unwrap().unwrap();
        q.push_ready(h).unwrap();

        assert_eq!(q.drain(), 4);
        assert!(q.census().is_empty());
        assert!(matches!(q.buffer(h), Err(PoolError::StaleHandle { .. })));
        assert!(q.push_posted(h).is_err());

        // arena is reusable after a drain
        let again = q.lease_and_post().unwrap();
        assert_eq!(again.generation(), 1);
    }

    #[test]
    fn test_producer_consumer_keeps_order_and_contents() {
        const BUFFERS: usize = MAX_NUM_BUFFERS;
        const LEN: usize = 1024;

        let q = Arc::new(queues(BUFFERS, LEN));
        let handles: Vec<_> = (0..BUFFERS).map(|_| q.lease_and_post().unwrap()).collect();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..BUFFERS {
                    let h = q.pop_posted().unwrap().unwrap();
                    q.buffer(h).unwrap().lock().fill(i as u8);
                    q.push_ready(h).unwrap();
                    if i % 7 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };

        let mut seen = 0;
        while seen < BUFFERS {
            match q.pop_ready().unwrap() {
                Some(h) => {
                    assert_eq!(h, handles[seen]);
                    let buf = q.buffer(h).unwrap();
                    assert!(buf.lock().iter().all(|&b| b == seen as u8));
                    seen += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();

        let census = q.census();
        assert_eq!(census.processing, BUFFERS);
        assert_eq!(census.owned, BUFFERS);
        assert_eq!(census.posted + census.ready + census.waiting, 0);
    }
}
