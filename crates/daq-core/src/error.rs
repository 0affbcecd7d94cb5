//! Custom error types shared across the acquisition crates.
//!
//! `DaqError` is the application-level error. Driver crates define their own
//! `thiserror` enums and convert into [`DaqError::Driver`] with a
//! [`DriverErrorKind`] so callers can decide how to react without knowing
//! the vendor details.
//!
//! ## Error Categories
//!
//! - **Configuration**: invalid values that parsed but are semantically wrong
//!   (record length not a multiple of 64, unknown coupling key, ...).
//!   Never retried.
//! - **Hardware**: a vendor SDK call returned a non-success status. The
//!   acquisition stops; the caller re-configures and restarts.
//! - **Resource**: null/undersized output buffers, queue invariant violations.
//! - **Transmission**: short writes on a streaming connection. Fatal because
//!   the framing of the channel is lost.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad category of a driver failure, used to pick a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Board not opened or not configured yet
    Initialization,
    /// Rejected parameter values
    Configuration,
    /// Operating-system I/O towards the device or a peer
    Communication,
    /// Vendor SDK call failed
    Hardware,
    /// Hardware did not answer in time
    Timeout,
    /// Buffers or queues in an unexpected state
    Resource,
    /// Streaming output lost its framing
    Transmission,
    /// Anything the driver could not classify
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Resource => "resource",
            DriverErrorKind::Transmission => "transmission",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// A driver failure with its category and driver name.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Short driver name, e.g. `alazar`
    pub driver_type: String,
    /// Category deciding the recovery
    pub kind: DriverErrorKind,
    /// Driver-specific detail
    pub message: String,
}

impl DriverError {
    /// Build an error for `driver_type`.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    ///
    /// Only timeouts qualify; every other kind needs a state change
    /// (new configuration, reconnect) first.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == DriverErrorKind::Timeout
    }
}

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition application.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Values parsed correctly but fail semantic validation.
    ///
    /// **Recovery Strategy**: Abort, report to the user, fix the values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed (output files, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(DriverError),

    /// An operation was requested while the device was busy acquiring.
    #[error("Device is busy during operation")]
    DeviceBusy,
}

impl DaqError {
    /// Driver error kind, if this error came from a driver.
    #[must_use]
    pub fn driver_kind(&self) -> Option<DriverErrorKind> {
        match self {
            DaqError::Driver(e) => Some(e.kind),
            _ => None,
        }
    }
}
