//! Error types for AlazarTech board operations.

use std::panic::Location;

use daq_core::error::{DaqError, DriverError, DriverErrorKind};
use daq_pool::PoolError;
use thiserror::Error;
use tracing::error;

use crate::api::{ApiResult, ApiStatus};

/// Result type alias for Alazar operations.
pub type Result<T> = std::result::Result<T, AlazarError>;

/// Errors that can occur while configuring or running a board.
#[derive(Error, Debug)]
pub enum AlazarError {
    /// Parsed configuration values are semantically invalid
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// An SDK call returned a status other than `ApiSuccess`
    #[error("{call} failed: {status} at {}:{}", .location.file(), .location.line())]
    Hardware {
        /// SDK function name
        call: &'static str,
        /// Status it returned
        status: ApiStatus,
        /// Call site inside the driver
        location: &'static Location<'static>,
    },

    /// Undersized output arrays or a broken buffer-queue invariant
    #[error("Resource error: {0}")]
    Resource(String),

    /// A streaming write did not transfer the whole frame
    #[error("Transmission on channel {channel} failed: {message}")]
    Transmission {
        /// 1 for channel A, 2 for channel B
        channel: usize,
        /// What went wrong with the write
        message: String,
    },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer arena or queue error
    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    /// Configuration file or environment could not be read
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// `start`/`poll` before a successful `configure`
    #[error("Board is not configured")]
    NotConfigured,

    /// Operation not allowed while the receive loop is running
    #[error("Board is busy acquiring")]
    Busy,

    /// The receive thread panicked
    #[error("Receive thread panicked")]
    WorkerPanicked,
}

impl AlazarError {
    /// Build a hardware error and log it with the caller's location.
    #[track_caller]
    pub fn hardware(call: &'static str, status: ApiStatus) -> Self {
        let location = Location::caller();
        error!(
            call,
            code = status.code(),
            text = status.text(),
            file = location.file(),
            line = location.line(),
            "Alazar SDK call failed"
        );
        Self::Hardware {
            call,
            status,
            location,
        }
    }

    /// SDK status code, if this came from a failed SDK call.
    #[must_use]
    pub fn status(&self) -> Option<ApiStatus> {
        match self {
            Self::Hardware { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<figment::Error> for AlazarError {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

/// Turn an SDK status into a logged [`AlazarError::Hardware`].
pub(crate) trait CheckStatus<T> {
    fn check(self, call: &'static str) -> Result<T>;
}

impl<T> CheckStatus<T> for ApiResult<T> {
    #[track_caller]
    fn check(self, call: &'static str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(status) => Err(AlazarError::hardware(call, status)),
        }
    }
}

impl From<AlazarError> for DaqError {
    fn from(err: AlazarError) -> Self {
        let kind = match &err {
            AlazarError::Configuration(_) | AlazarError::ConfigLoad(_) => {
                DriverErrorKind::Configuration
            }
            AlazarError::Hardware { status, .. } if status.is_timeout() => {
                DriverErrorKind::Timeout
            }
            AlazarError::Hardware { .. } => DriverErrorKind::Hardware,
            AlazarError::Resource(_) | AlazarError::Pool(_) => DriverErrorKind::Resource,
            AlazarError::Transmission { .. } => DriverErrorKind::Transmission,
            AlazarError::Io(_) => DriverErrorKind::Communication,
            AlazarError::NotConfigured => DriverErrorKind::Initialization,
            AlazarError::Busy => return DaqError::DeviceBusy,
            AlazarError::WorkerPanicked => DriverErrorKind::Unknown,
        };
        DaqError::Driver(DriverError::new("alazar", kind, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_hardware_error_is_logged_with_location() {
        let result: ApiResult<()> = Err(ApiStatus::FAILED);
        let err = result.check("AlazarStartCapture").unwrap_err();

        let text = err.to_string();
        assert!(text.contains("AlazarStartCapture failed: ApiFailed (513)"));
        assert!(text.contains("error.rs"));
        assert_eq!(err.status(), Some(ApiStatus::FAILED));
        assert!(logs_contain("Alazar SDK call failed"));
        assert!(logs_contain("AlazarStartCapture"));
    }

    #[test]
    fn test_conversion_to_daq_error() {
        let cfg: DaqError = AlazarError::Configuration("bad mode".into()).into();
        assert_eq!(cfg.driver_kind(), Some(DriverErrorKind::Configuration));

        let tx: DaqError = AlazarError::Transmission {
            channel: 1,
            message: "short write".into(),
        }
        .into();
        assert_eq!(tx.driver_kind(), Some(DriverErrorKind::Transmission));

        let busy: DaqError = AlazarError::Busy.into();
        assert!(matches!(busy, DaqError::DeviceBusy));
    }
}
