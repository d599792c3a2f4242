//! Custom error types for the application.
//!
//! `PickPlateError` consolidates the error sources of the control stack:
//! configuration loading and validation, I/O, and the closed-channel
//! conditions that appear when a worker has already shut down. Transport
//! failures on the serial link are deliberately *not* represented here;
//! the link retries forever and surfaces them only as log events.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type Result<T> = std::result::Result<T, PickPlateError>;

#[derive(Error, Debug)]
pub enum PickPlateError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial link is no longer running")]
    LinkClosed,

    #[error("Motion controller is no longer running")]
    MotionStopped,

    #[error("Shutdown requested")]
    ShuttingDown,

    #[error("Calibration error: {0}")]
    Calibration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PickPlateError::Configuration("vertical velocity must be positive".into());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: vertical velocity must be positive"
        );
    }
}
