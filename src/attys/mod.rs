//! Attys device communication.
//!
//! This module contains the Attys wire protocol, the packet decoder, the
//! acquisition task talking to a connected device and the sample recorder.

pub mod comm;
pub mod parser;
pub mod protocol;
pub mod recorder;

#[cfg(test)]
pub(crate) mod mock;
