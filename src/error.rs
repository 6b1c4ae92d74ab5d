//! Crate-wide error type.
//!
//! Every fallible public function in this crate returns `Result<T, Error>`.
//! Lower layers never downcast or string-match an error from a layer below;
//! they propagate the variant unchanged or wrap it in a variant of their own.

use thiserror::Error;

/// A fault surfaced anywhere in the driver stack.
#[derive(Debug, Error)]
pub enum Error {
    /// No device matching the vendor/product ID was found during enumeration.
    #[error("no matching USB device found (index {index})")]
    NoDevice {
        /// Device index that was requested.
        index: usize,
    },

    /// The OS refused to claim or configure the device.
    #[error("access denied opening USB device: {reason}")]
    AccessDenied {
        /// Underlying OS/driver message.
        reason: String,
    },

    /// A USB transfer failed: short read/write, timeout, or wrong reply length.
    #[error("USB communication error: {reason}")]
    Communication {
        /// Description of the failed transfer.
        reason: String,
    },

    /// A list packet or opcode frame was malformed.
    #[error("malformed list data: {reason}")]
    DataValidity {
        /// What was wrong with the data.
        reason: String,
    },

    /// A parameter exceeded the 16-bit range the board's wire format allows.
    #[error("parameter {value} overflows 16 bits for opcode 0x{opcode:04x}")]
    ParameterOverflow {
        /// Opcode the parameter belonged to.
        opcode: u16,
        /// The out-of-range value.
        value: i64,
    },

    /// `mark()` was called before a required setting was established.
    #[error("mark() requires {setting} to be set first")]
    MissingSetting {
        /// Name of the missing setting.
        setting: &'static str,
    },

    /// A coordinate fell outside the calibration table's envelope.
    #[error(
        "point ({x}, {y}) mm is outside the calibration envelope \
         [{x_min}, {x_max}] x [{y_min}, {y_max}]"
    )]
    OutOfEnvelope {
        /// Requested X coordinate, millimeters.
        x: f64,
        /// Requested Y coordinate, millimeters.
        y: f64,
        /// Envelope minimum X.
        x_min: f64,
        /// Envelope maximum X.
        x_max: f64,
        /// Envelope minimum Y.
        y_min: f64,
        /// Envelope maximum Y.
        y_max: f64,
    },

    /// The calibration table text could not be parsed.
    #[error("invalid calibration file: {reason}")]
    InvalidCalibration {
        /// Parse failure description.
        reason: String,
    },

    /// The init configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] toml::de::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Outcome of a job run through the execution engine (§7: cancellation is a
/// first-class return, not an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// The job ran to completion (all loop iterations finished).
    Completed,
    /// The job was cancelled via [`crate::engine::Session::abort`].
    Aborted,
}
