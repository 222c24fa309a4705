//! Status reporting for the Attys scanner.
//!
//! The scanner reports its progress as a status code plus a human readable
//! message. Anything implementing [`ScanListener`] can receive them.

use std::sync::Arc;

/// Progress and error states reported during a scan.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
pub enum ScanStatus {
   #[strum(serialize = "connected")]
   Connected = 0,
   #[strum(serialize = "searching")]
   Searching = 1,
   #[strum(serialize = "no-device")]
   NoDevice = 2,
   #[strum(serialize = "socket-error")]
   SocketError = 3,
   #[strum(serialize = "connecting")]
   Connecting = 4,
   #[strum(serialize = "connect-error")]
   ConnectError = 5,
}

impl ScanStatus {
   /// Numeric status code as understood by existing front-ends.
   pub const fn code(self) -> u8 {
      self as u8
   }

   pub const fn is_error(self) -> bool {
      matches!(self, Self::NoDevice | Self::SocketError | Self::ConnectError)
   }
}

/// Receives status updates from the scanner.
pub trait ScanListener: Send + Sync {
   /// Called for every status change with a message suitable for display.
   fn message(&self, status: ScanStatus, text: &str);
}

impl<F> ScanListener for F
where
   F: Fn(ScanStatus, &str) + Send + Sync,
{
   fn message(&self, status: ScanStatus, text: &str) {
      self(status, text);
   }
}

/// Type alias for a thread-safe listener handle.
pub type ScanListenerRef = Arc<dyn ScanListener>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_status_codes_are_stable() {
      let all = [
         ScanStatus::Connected,
         ScanStatus::Searching,
         ScanStatus::NoDevice,
         ScanStatus::SocketError,
         ScanStatus::Connecting,
         ScanStatus::ConnectError,
      ];
      for (i, status) in all.into_iter().enumerate() {
         assert_eq!(status.code() as usize, i);
         assert_eq!(ScanStatus::from_repr(i as u8), Some(status));
      }
      assert_eq!(ScanStatus::from_repr(6), None);
   }

   #[test]
   fn test_closure_listener() {
      let seen = parking_lot::Mutex::new(Vec::new());
      let listener = |status: ScanStatus, text: &str| seen.lock().push((status, text.to_owned()));
      listener.message(ScanStatus::Searching, "Searching for\nAttys devices");
      listener.message(ScanStatus::ConnectError, "Connect failed");

      let seen = seen.into_inner();
      assert_eq!(seen.len(), 2);
      assert_eq!(seen[0].0, ScanStatus::Searching);
      assert!(seen[1].0.is_error());
      assert_eq!(seen[1].1, "Connect failed");
   }
}
