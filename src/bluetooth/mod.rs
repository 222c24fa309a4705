//! Bluetooth discovery and connection of Attys devices.
//!
//! This module provides the scan-and-connect loop and the BlueZ backend
//! which supplies it with RFCOMM streams.

pub mod rfcomm;
pub mod scanner;
