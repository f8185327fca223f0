//! Custom error types for the emulator.
//!
//! This module defines the primary error type, `EmulatorError`. Using the `thiserror`
//! crate, it gives one consistent way to report everything that can go wrong between
//! reading the configuration and the last byte written to the link.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps [`ConfigError`], covering file parsing and semantic validation of
//!   the run configuration.
//! - **`Provisioning`**: The transport could not be opened before the retry window closed.
//!   Carries the path and the last error observed while retrying.
//! - **`HelperSpawn`**: The pairing helper process could not be launched. Not retried.
//! - **`HelperExited`**: The pairing helper quit before both endpoints appeared.
//! - **`PairingUnsupported`**: Pair synthesis was requested on a platform without POSIX
//!   pseudo-terminals.
//! - **`Transport`** / **`Serial`**: I/O failures on an open link, or failures reported by the
//!   `serialport` crate while opening one.
//!
//! Only `Serial` and `Transport` errors raised while *opening* are treated as transient; see
//! [`EmulatorError::is_transient`].

use crate::config::ConfigError;
use thiserror::Error;

/// Convenience alias for results using the emulator error type.
pub type EmuResult<T> = std::result::Result<T, EmulatorError>;

/// Every failure the emulator core can surface.
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// Loading or validating the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The transport never became available within the retry window.
    #[error("Failed to open '{path}': {message}")]
    Provisioning {
        /// Transport path that was being opened.
        path: String,
        /// Last error observed, or a timeout notice.
        message: String,
    },

    /// The pairing helper could not be launched.
    #[error("Failed to spawn pairing helper '{program}': {source}")]
    HelperSpawn {
        /// Program that was executed.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The pairing helper quit before it finished creating its endpoints.
    #[error("Pairing helper exited early with {status}")]
    HelperExited {
        /// Exit status reported by the operating system.
        status: std::process::ExitStatus,
    },

    /// Pair synthesis needs POSIX pseudo-terminals.
    #[error("Pseudo-terminal pairing is not supported on this platform; pass an explicit --port")]
    PairingUnsupported,

    /// Read or write on an open transport failed.
    #[error("Serial I/O error: {0}")]
    Transport(#[from] std::io::Error),

    /// The `serialport` crate rejected the device or its settings.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl EmulatorError {
    /// Returns true for errors that may clear up if the open is attempted again,
    /// e.g. a device node that has not been created yet.
    pub fn is_transient(&self) -> bool {
        matches!(self, EmulatorError::Transport(_) | EmulatorError::Serial(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmulatorError::Provisioning {
            path: "/dev/ttyUSB9".into(),
            message: "open retry timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to open '/dev/ttyUSB9': open retry timed out"
        );
    }

    #[test]
    fn test_transient_classification() {
        let io = EmulatorError::Transport(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_transient());

        let spawn = EmulatorError::HelperSpawn {
            program: "socat".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!spawn.is_transient());
        assert!(!EmulatorError::PairingUnsupported.is_transient());
    }
}
