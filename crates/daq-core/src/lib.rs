//! `daq-core`
//!
//! Shared building blocks for the digitizer acquisition crates.
//!
//! - [`error`]: the [`DaqError`] taxonomy every driver error converts into
//! - [`limits`]: hard limits for the DMA buffer pool and hardware waits
//!
//! Driver crates keep their own detailed error enums and map them into
//! [`DaqError`] at the crate boundary, so applications juggling several
//! drivers only need to handle one error type.

/// Application error taxonomy
pub mod error;
/// Pool, buffer and timeout bounds
pub mod limits;

pub use error::{AppResult, DaqError, DriverError, DriverErrorKind};
