//! Custom error types for the cell simulator host library.
//!
//! This module defines the primary error type, `CellSimError`. Using the `thiserror`
//! crate, it gives every layer (link, transport, device API, configuration) one
//! consistent error vocabulary that composes with the `?` operator.
//!
//! ## Error Hierarchy
//!
//! Errors fall into three broad categories:
//!
//! 1. **Link Errors** - `LinkUnavailable`, `Io`
//!    - The serial endpoint could not be opened, or a read/write on it failed.
//!    - Fatal to that one link. During discovery they are recorded as a failed
//!      probe for the single candidate and never abort the run.
//!
//! 2. **Protocol Errors** - `CommandRejected`, `NoResponse`, `MalformedPayload`
//!    - Raised by the device API layer only. The transport itself never raises
//!      for a timeout or an `Error:` reply; it returns the partial response and
//!      lets the caller classify it.
//!
//! 3. **Caller / Configuration Errors** - `InvalidCommand`, `InvalidChannel`,
//!    `InvalidValue`, `Config`, `Configuration`, `DeviceNotFound`
//!    - Permanent; retrying with the same input will fail the same way.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type CellSimResult<T> = std::result::Result<T, CellSimError>;

/// Primary error type for the cell simulator host library.
#[derive(Error, Debug)]
pub enum CellSimError {
    /// The link could not be opened (device absent, permission denied, busy).
    ///
    /// **Error Type**: Usually permanent for the current session.
    ///
    /// **Recovery Strategy**: Check the port path and that no other program holds
    /// the port. Discovery converts this into a failed probe for one candidate.
    #[error("Link '{link}' unavailable: {reason}")]
    LinkUnavailable {
        /// Identifier of the link that failed to open
        link: String,
        /// Human-readable cause reported by the host platform
        reason: String,
    },

    /// A read or write on an open link failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command text is empty or contains an embedded line terminator.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The instrument answered with an `Error:` line.
    ///
    /// The payload is passed through verbatim; the transport does not interpret it.
    #[error("Instrument rejected '{command}': {message}")]
    CommandRejected {
        /// The command that was rejected
        command: String,
        /// Failure payload following the `Error:` marker
        message: String,
    },

    /// No terminal line arrived before the deadline (indeterminate outcome).
    ///
    /// **Error Type**: Transient.
    ///
    /// **Recovery Strategy**: The caller may resend. Stale bytes from the late
    /// reply are discarded before the next command.
    #[error("No terminal response to '{command}' before deadline")]
    NoResponse {
        /// The command that went unanswered
        command: String,
    },

    /// An `OK:` line whose payload does not have the expected shape.
    #[error("Malformed payload for '{command}': {reason} (line: {line:?})")]
    MalformedPayload {
        /// The command whose reply could not be parsed
        command: String,
        /// The offending response line
        line: String,
        /// What was wrong with it
        reason: String,
    },

    /// Channel number outside `1..=max`.
    #[error("Channel {channel} out of range (1-{max})")]
    InvalidChannel {
        /// Requested channel
        channel: u8,
        /// Number of channels on the instrument
        max: u8,
    },

    /// A setpoint value that cannot be sent (NaN, infinite).
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Discovery finished without any candidate answering the liveness probe.
    #[error("No cell simulator found among candidate ports")]
    DeviceNotFound,
}

impl From<figment::Error> for CellSimError {
    fn from(err: figment::Error) -> Self {
        CellSimError::Config(Box::new(err))
    }
}
