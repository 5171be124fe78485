//! Common error types for boardlink.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the underlying error types used throughout the crate.
//! Selection ambiguity is deliberately absent from the recoverable path: the
//! heuristic reports it as [`crate::select::Selection::Ambiguous`], and
//! [`Error::Ambiguous`] only surfaces when no interactive fallback resolved it.

use thiserror::Error;

/// Main error type for boardlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No device matched the discovery filter
    #[error("{0}")]
    NotFound(String),

    /// More than one device could be meant and nothing disambiguated them
    #[error("Multiple possible device connections found.")]
    Ambiguous,

    /// The interactive chooser declined to pick a device
    #[error("No device selected, mission aborted!")]
    Aborted,

    /// A device name that is not a valid hostname label
    #[error("Invalid name: {0}. The name must be a valid hostname string.")]
    NameInvalid(String),

    /// The device did not report which firmware it runs
    #[error("Could not determine the firmware version on {device}. Use force to update anyway.")]
    VersionUnknown { device: String },

    /// The requested firmware version is not in the build catalog
    #[error("The requested build ({0}) was not found in the build catalog.")]
    VersionNotFound(String),

    /// The flash chip answered the identification command with the wrong ID
    #[error("Invalid Device ID (Flash Memory Communication Error), read {}", hex::encode(.found))]
    InvalidDeviceId { found: Vec<u8> },

    /// A firmware image does not fit the flash region reserved for it
    #[error("The {image} image is {len} bytes, larger than its {max} byte flash region")]
    ImageTooLarge {
        image: &'static str,
        len: usize,
        max: usize,
    },

    /// The board's flash holds no factory partition to carry over
    #[error("No factory partition found on the flash chip. Restore the board instead.")]
    PartitionMissing,

    /// Transport level failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// The operation was interrupted from outside
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation needs a USB connection but the device has none
    #[error("Must have the device connected over USB to complete this operation.")]
    UsbRequired,

    /// A bounded wait on the device expired
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The connection does not implement this request
    #[error("Not supported by this connection: {0}")]
    Unsupported(&'static str),

    /// Build catalog could not be used
    #[error("Build catalog error: {0}")]
    Catalog(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP errors while talking to the build server
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON from the build server
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the message tells the user what to do next, as opposed to
    /// reporting a failure in the machinery.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::VersionNotFound(_)
                | Error::NameInvalid(_)
                | Error::UsbRequired
                | Error::VersionUnknown { .. }
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
