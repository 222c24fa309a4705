//! Error types for the Attys scanner.
//!
//! This module defines all error types that can occur while scanning for,
//! connecting to and streaming from Attys devices, including Bluetooth,
//! I/O, configuration and decoding errors.

use thiserror::Error;

/// Main error type for the Attys scanner.
#[derive(Error, Debug)]
pub enum AttysError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Adapter not available")]
   AdapterNotAvailable,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("No OK reply to command {0:?}")]
   NoReply(String),

   #[error("Acquisition already started")]
   AlreadyStarted,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl AttysError {
   /// True when the failure means there is no usable Bluetooth adapter at all.
   pub const fn is_adapter_missing(&self) -> bool {
      matches!(self, Self::AdapterNotFound | Self::AdapterNotAvailable)
   }
}

/// Convenience type alias for Results with `AttysError`.
pub type Result<T> = std::result::Result<T, AttysError>;
