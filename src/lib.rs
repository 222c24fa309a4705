//! Scanner and data acquisition for Attys Bluetooth data loggers.
//!
//! [`AttysScan`] finds Attys devices nearby and connects them over RFCOMM,
//! each connection is driven by an [`AttysComm`] which configures the
//! device and decodes its sample stream.

pub mod attys;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;

pub use attys::{
   comm::{AttysComm, CommMessage, DataListener, MessageListener},
   protocol::{AttysSettings, Channel, NCHANNELS, Sample},
   recorder::{DataRecorder, Separator},
};
pub use bluetooth::{
   rfcomm::BluezBackend,
   scanner::{AttysScan, Backend, Candidate, ScanSettings, ScannedAttys},
};
pub use config::Config;
pub use error::{AttysError, Result};
pub use event::{ScanListener, ScanListenerRef, ScanStatus};
