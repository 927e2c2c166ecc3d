//! Unified error types for the slotd-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.
//!
//! Two families live here. [`Error`] covers failures of the system
//! collaborators (spawning tools, scanning devices, reading config, swap
//! syscalls). [`RequestError`] is the closed set of named errors a control
//! request can be answered with.

use nix::errno::Errno;
use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// Failed to read a sysfs or procfs attribute.
    #[snafu(display("failed to read {}", path.display()))]
    SysfsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file could not be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::config::Config`].
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Failed to write a published state file.
    #[snafu(display("failed to write state file {}", path.display()))]
    StateWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `swapon(2)` failed.
    #[snafu(display("swapon {} failed: {source}", path.display()))]
    SwapOn { path: PathBuf, source: Errno },

    /// `swapoff(2)` failed.
    #[snafu(display("swapoff {} failed: {source}", path.display()))]
    SwapOff { path: PathBuf, source: Errno },

    /// Swap file path cannot be handed to the kernel.
    #[snafu(display("swap path {} contains a NUL byte", path.display()))]
    SwapPath { path: PathBuf },

    /// Privilege escalation tool (pkexec/sudo) not found.
    #[snafu(display(
        "privilege escalation tool '{tool}' not found. Please install it to use this feature."
    ))]
    EscalationToolNotFound { tool: String },

    /// Failed to encode a protocol message.
    #[snafu(display("failed to encode protocol message"))]
    ProtocolEncode { source: serde_json::Error },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

impl Error {
    /// True when the kernel rejected the swap file itself (`EINVAL`),
    /// which means the file on the card is damaged.
    pub fn is_corrupted_swap(&self) -> bool {
        matches!(
            self,
            Error::SwapOn {
                source: Errno::EINVAL,
                ..
            }
        )
    }
}

/// Named error a control request is answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum RequestError {
    #[snafu(display("bad_device_name"))]
    BadDeviceName,
    #[snafu(display("no_argument"))]
    NoArgument,
    #[snafu(display("improper_state"))]
    ImproperState,
    #[snafu(display("failure"))]
    Failure,
    #[snafu(display("invalid_characters"))]
    InvalidCharacters,
    #[snafu(display("too_long_name"))]
    TooLongName,
    #[snafu(display("in_use"))]
    InUse,
    #[snafu(display("not_enough_ram"))]
    NotEnoughRam,
}

impl RequestError {
    /// Wire name of the error.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::BadDeviceName => "bad_device_name",
            RequestError::NoArgument => "no_argument",
            RequestError::ImproperState => "improper_state",
            RequestError::Failure => "failure",
            RequestError::InvalidCharacters => "invalid_characters",
            RequestError::TooLongName => "too_long_name",
            RequestError::InUse => "in_use",
            RequestError::NotEnoughRam => "not_enough_ram",
        }
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for sysfs/procfs read errors.
    fn sysfs_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for state file write errors.
    fn state_write_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn sysfs_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(SysfsReadSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn state_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(StateWriteSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_codes_match_display() {
        let all = [
            RequestError::BadDeviceName,
            RequestError::NoArgument,
            RequestError::ImproperState,
            RequestError::Failure,
            RequestError::InvalidCharacters,
            RequestError::TooLongName,
            RequestError::InUse,
            RequestError::NotEnoughRam,
        ];
        for err in all {
            assert_eq!(err.to_string(), err.code());
        }
    }

    #[test]
    fn test_corrupted_swap_detection() {
        let einval = Error::SwapOn {
            path: PathBuf::from("/media/card/.swap"),
            source: Errno::EINVAL,
        };
        assert!(einval.is_corrupted_swap());

        let busy = Error::SwapOff {
            path: PathBuf::from("/media/card/.swap"),
            source: Errno::EINVAL,
        };
        assert!(!busy.is_corrupted_swap());
    }
}
