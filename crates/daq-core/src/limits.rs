//! Shared hard limits to keep DMA buffer usage and hardware waits bounded.
//!
//! This module centralizes:
//! - Buffer pool bounds (in-flight DMA buffers per board)
//! - Largest single DMA buffer accepted by the geometry calculator
//! - Timeout durations for hardware completion waits
//! - Board table size

use std::time::Duration;

// =============================================================================
// Buffer Pool Limits
// =============================================================================

/// Maximum number of DMA buffers kept in flight per board.
///
/// Every queue in the pool is bounded by this value, so pushes never fail
/// for capacity reasons as long as the pool never allocates more.
pub const MAX_NUM_BUFFERS: usize = 32;

/// Minimum number of DMA buffers posted before capture starts.
///
/// Keeps the hardware supplied while software processes a completed buffer,
/// even for acquisitions that only need one buffer in total.
pub const MIN_NUM_BUFFERS: usize = 4;

/// Clamp a requested buffer count into the pool bounds.
#[must_use]
pub fn pool_size_for(nbr_buffers: usize) -> usize {
    nbr_buffers.clamp(MIN_NUM_BUFFERS, MAX_NUM_BUFFERS)
}

/// Largest DMA buffer (and partial-mode work buffer) in bytes: 64 MiB.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Per-call timeout for the hardware buffer-complete wait (1 second).
///
/// The receive loop re-checks its stop flag between calls, so this is also
/// the worst-case cancellation latency.
pub const BUFFER_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

// =============================================================================
// Board Table
// =============================================================================

/// Default number of boards a registry accepts (board ids `1..=MAX_NUM_BOARDS`).
pub const MAX_NUM_BOARDS: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_is_clamped() {
        assert_eq!(pool_size_for(1), MIN_NUM_BUFFERS);
        assert_eq!(pool_size_for(10), 10);
        assert_eq!(pool_size_for(1000), MAX_NUM_BUFFERS);
    }
}
