//! Scan-and-connect for Attys devices.
//!
//! [`AttysScan`] enumerates nearby devices through a [`Backend`], picks the
//! ones that look like an Attys, opens an RFCOMM channel to each and wraps
//! the stream in an [`AttysComm`].

use std::{collections::HashSet, future::Future, io, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use tokio::{
   io::{AsyncRead, AsyncWrite},
   time,
};

use crate::{
   attys::{comm::AttysComm, protocol::AttysSettings},
   error::Result,
   event::{ScanListenerRef, ScanStatus},
};

/// Name reported for devices whose remote name could not be read
pub const UNKNOWN_NAME: &str = "[unknown]";

/// Scan parameters, the `[scan]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSettings {
   #[serde(default = "default_name_pattern")]
   pub name_pattern: SmolStr,

   #[serde(default = "default_max_devices")]
   pub max_devices: usize,

   #[serde(default = "default_connect_attempts")]
   pub connect_attempts: u32,

   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_secs: u64,

   /// Length of the inquiry, 0 only looks at devices BlueZ already knows.
   #[serde(default = "default_inquiry_secs")]
   pub inquiry_secs: u64,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<SmolStr>,
}

fn default_name_pattern() -> SmolStr {
   SmolStr::new_static("GN-ATTYS")
}

const fn default_max_devices() -> usize {
   4
}

const fn default_connect_attempts() -> u32 {
   3
}

const fn default_rfcomm_channel() -> u8 {
   1
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_inquiry_secs() -> u64 {
   10
}

impl Default for ScanSettings {
   fn default() -> Self {
      Self {
         name_pattern: default_name_pattern(),
         max_devices: default_max_devices(),
         connect_attempts: default_connect_attempts(),
         rfcomm_channel: default_rfcomm_channel(),
         connect_timeout_secs: default_connect_timeout(),
         inquiry_secs: default_inquiry_secs(),
         adapter: None,
      }
   }
}

impl ScanSettings {
   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }

   pub const fn inquiry_duration(&self) -> Duration {
      Duration::from_secs(self.inquiry_secs)
   }
}

/// A device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
   pub address: Address,
   pub name: SmolStr,
   pub paired: bool,
}

/// Access to the Bluetooth stack.
pub trait Backend: Send + Sync {
   type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

   /// Lists nearby and known devices in discovery order.
   fn discover(&self, settings: &ScanSettings) -> impl Future<Output = Result<Vec<Candidate>>> + Send;

   /// Opens a serial channel to the device.
   fn connect(&self, address: Address, channel: u8) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// A connected Attys.
#[derive(Debug, Clone)]
pub struct ScannedAttys {
   pub index: usize,
   pub address: Address,
   pub name: SmolStr,
   /// `"{index}:{name}"`
   pub display_name: SmolStr,
   pub comm: AttysComm,
}

/// Finds and connects Attys devices.
pub struct AttysScan<B: Backend> {
   backend: B,
   settings: ScanSettings,
   attys_settings: AttysSettings,
   known_devices: HashSet<Address>,
   listener: Option<ScanListenerRef>,
   devices: Vec<ScannedAttys>,
}

impl<B: Backend> AttysScan<B> {
   pub fn new(backend: B, settings: ScanSettings) -> Self {
      Self {
         backend,
         settings,
         attys_settings: AttysSettings::default(),
         known_devices: HashSet::new(),
         listener: None,
         devices: Vec::new(),
      }
   }

   /// Addresses accepted regardless of their name.
   pub fn with_known_devices(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
      self.known_devices.extend(addresses);
      self
   }

   /// Settings handed to every [`AttysComm`] created by the scan.
   pub fn with_attys_settings(mut self, settings: AttysSettings) -> Self {
      self.attys_settings = settings;
      self
   }

   pub const fn settings(&self) -> &ScanSettings {
      &self.settings
   }

   pub fn register_listener(&mut self, listener: ScanListenerRef) {
      self.listener = Some(listener);
   }

   pub fn unregister_listener(&mut self) {
      self.listener = None;
   }

   fn emit(&self, status: ScanStatus, text: &str) {
      debug!("[{status}] {}", text.replace('\n', " "));
      if let Some(listener) = &self.listener {
         listener.message(status, text);
      }
   }

   fn is_attys(&self, candidate: &Candidate) -> bool {
      candidate.name.contains(self.settings.name_pattern.as_str())
         || self.known_devices.contains(&candidate.address)
   }

   /// Scans and connects, returning the number of connected devices.
   ///
   /// Devices from a previous scan are shut down first.
   pub async fn scan(&mut self) -> Result<usize> {
      self.quit_all();
      self.devices.clear();

      self.emit(ScanStatus::Searching, "Searching for\nAttys devices");
      let candidates = match self.backend.discover(&self.settings).await {
         Ok(candidates) => candidates,
         Err(e) if e.is_adapter_missing() => {
            self.emit(ScanStatus::NoDevice, "No bluetooth\ndevices available");
            return Err(e);
         },
         Err(e) => {
            warn!("Discovery failed: {e}");
            self.emit(ScanStatus::SocketError, "Error opening socket");
            return Err(e);
         },
      };

      if candidates.is_empty() {
         self.emit(
            ScanStatus::NoDevice,
            "No bluetooth devices found.\nHave you paired the Attys?\nIs bluetooth switched on?",
         );
         return Ok(0);
      }

      let mut seen = HashSet::new();
      for candidate in candidates {
         if self.devices.len() >= self.settings.max_devices {
            debug!("Reached the maximum of {} devices", self.settings.max_devices);
            break;
         }
         if !seen.insert(candidate.address) {
            continue;
         }
         if !self.is_attys(&candidate) {
            debug!("{} {}: not an Attys", candidate.address, candidate.name);
            continue;
         }

         if candidate.paired {
            info!("{} {}: found one, connecting", candidate.address, candidate.name);
         } else {
            warn!(
               "{} {}: found one but it is not paired, connecting anyway",
               candidate.address, candidate.name
            );
         }
         if let Some(comm) = self.connect(&candidate).await {
            let index = self.devices.len();
            self.devices.push(ScannedAttys {
               index,
               address: candidate.address,
               display_name: format_smolstr!("{index}:{}", candidate.name),
               name: candidate.name,
               comm,
            });
         }
      }

      if !self.devices.is_empty() {
         let text = format!("Connected to\n{} Attys", self.devices.len());
         self.emit(ScanStatus::Connected, &text);
      }
      Ok(self.devices.len())
   }

   async fn connect(&self, candidate: &Candidate) -> Option<AttysComm> {
      let text = format!("Connecting to\nAttys #{}:\n{}", self.devices.len(), candidate.name);
      self.emit(ScanStatus::Connecting, &text);

      let timeout = self.settings.connect_timeout();
      for attempt in 1..=self.settings.connect_attempts {
         let result = time::timeout(
            timeout,
            self
               .backend
               .connect(candidate.address, self.settings.rfcomm_channel),
         )
         .await
         .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()));

         match result {
            Ok(stream) => {
               info!("{}: connected on attempt {attempt}", candidate.address);
               return Some(AttysComm::new(
                  stream,
                  candidate.address,
                  candidate.name.clone(),
                  self.attys_settings,
               ));
            },
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
               warn!(
                  "{}: permission denied, please pair the Attys with your bluetooth adapter",
                  candidate.address
               );
               self.emit(
                  ScanStatus::ConnectError,
                  "Permission denied. Attys not paired with this computer.",
               );
            },
            Err(e) => {
               warn!("{}: connect attempt {attempt} failed: {e}", candidate.address);
               self.emit(ScanStatus::ConnectError, "Connect failed");
            },
         }
      }
      None
   }

   pub fn len(&self) -> usize {
      self.devices.len()
   }

   pub fn is_empty(&self) -> bool {
      self.devices.is_empty()
   }

   pub fn devices(&self) -> &[ScannedAttys] {
      &self.devices
   }

   pub fn get(&self, index: usize) -> Option<&ScannedAttys> {
      self.devices.get(index)
   }

   pub fn attys_comm(&self, index: usize) -> Option<&AttysComm> {
      self.get(index).map(|d| &d.comm)
   }

   pub fn attys_name(&self, index: usize) -> Option<&str> {
      self.get(index).map(|d| d.display_name.as_str())
   }

   /// Stops every connected device. The records are kept.
   pub fn quit_all(&self) {
      for device in &self.devices {
         device.comm.quit();
      }
   }
}

impl<B: Backend> Drop for AttysScan<B> {
   fn drop(&mut self) {
      self.quit_all();
   }
}

#[cfg(test)]
mod tests {
   use std::{
      collections::{HashMap, VecDeque},
      sync::Arc,
   };

   use parking_lot::Mutex;
   use tokio::io::DuplexStream;

   use super::*;
   use crate::{
      attys::mock::{MockAttys, address},
      error::AttysError,
   };

   enum Discovery {
      Devices(Vec<Candidate>),
      NoAdapter,
      Broken,
   }

   struct MockBackend {
      discovery: Discovery,
      failures: Mutex<HashMap<Address, VecDeque<io::ErrorKind>>>,
      hanging: HashSet<Address>,
      connects: Mutex<Vec<Address>>,
   }

   impl MockBackend {
      fn new(discovery: Discovery) -> Self {
         Self {
            discovery,
            failures: Mutex::new(HashMap::new()),
            hanging: HashSet::new(),
            connects: Mutex::new(Vec::new()),
         }
      }

      fn with_devices(names: &[&str]) -> Self {
         let devices = names
            .iter()
            .enumerate()
            .map(|(i, name)| candidate(i as u8, name))
            .collect();
         Self::new(Discovery::Devices(devices))
      }

      fn fail(self, address: Address, errors: &[io::ErrorKind]) -> Self {
         self.failures.lock().insert(address, errors.iter().copied().collect());
         self
      }

      fn connect_count(&self, address: Address) -> usize {
         self.connects.lock().iter().filter(|a| **a == address).count()
      }
   }

   impl Backend for MockBackend {
      type Stream = DuplexStream;

      async fn discover(&self, _settings: &ScanSettings) -> Result<Vec<Candidate>> {
         match &self.discovery {
            Discovery::Devices(devices) => Ok(devices.clone()),
            Discovery::NoAdapter => Err(AttysError::AdapterNotFound),
            Discovery::Broken => Err(io::Error::other("hci down").into()),
         }
      }

      async fn connect(&self, address: Address, _channel: u8) -> io::Result<DuplexStream> {
         self.connects.lock().push(address);
         if self.hanging.contains(&address) {
            std::future::pending::<()>().await;
         }
         let failure = self
            .failures
            .lock()
            .get_mut(&address)
            .and_then(VecDeque::pop_front);
         if let Some(kind) = failure {
            return Err(kind.into());
         }
         let (client, device) = tokio::io::duplex(4096);
         tokio::spawn(MockAttys::new(Vec::new()).serve(device));
         Ok(client)
      }
   }

   fn candidate(n: u8, name: &str) -> Candidate {
      Candidate {
         address: address(n),
         name: name.into(),
         paired: true,
      }
   }

   type Log = Arc<Mutex<Vec<(ScanStatus, String)>>>;

   fn scanner(backend: MockBackend, settings: ScanSettings) -> (AttysScan<MockBackend>, Log) {
      let log: Log = Arc::default();
      let sink = log.clone();
      let mut scan = AttysScan::new(backend, settings);
      scan.register_listener(Arc::new(move |status: ScanStatus, text: &str| {
         sink.lock().push((status, text.to_owned()));
      }));
      (scan, log)
   }

   fn statuses(log: &Log) -> Vec<ScanStatus> {
      log.lock().iter().map(|(s, _)| *s).collect()
   }

   #[tokio::test]
   async fn test_connects_matching_devices() {
      let backend = MockBackend::with_devices(&["Phone", "GN-ATTYS1", "Headset", "GN-ATTYS2"]);
      let (mut scan, log) = scanner(backend, ScanSettings::default());

      assert_eq!(scan.scan().await.unwrap(), 2);
      assert_eq!(scan.len(), 2);
      assert_eq!(scan.attys_name(0), Some("0:GN-ATTYS1"));
      assert_eq!(scan.attys_name(1), Some("1:GN-ATTYS2"));
      assert_eq!(scan.get(1).unwrap().address, address(3));
      assert_eq!(scan.attys_comm(0).unwrap().name(), "GN-ATTYS1");
      assert!(scan.get(2).is_none());
      assert!(scan.attys_name(2).is_none());

      assert_eq!(
         statuses(&log),
         vec![
            ScanStatus::Searching,
            ScanStatus::Connecting,
            ScanStatus::Connecting,
            ScanStatus::Connected
         ]
      );
      assert_eq!(log.lock()[2].1, "Connecting to\nAttys #1:\nGN-ATTYS2");
      assert_eq!(scan.backend.connect_count(address(0)), 0);
   }

   #[tokio::test]
   async fn test_duplicate_candidate_connects_once() {
      let twice = candidate(0, "GN-ATTYS1");
      let backend = MockBackend::new(Discovery::Devices(vec![twice.clone(), twice]));
      let (mut scan, log) = scanner(backend, ScanSettings::default());

      assert_eq!(scan.scan().await.unwrap(), 1);
      assert_eq!(scan.backend.connect_count(address(0)), 1);
      assert_eq!(
         statuses(&log),
         vec![ScanStatus::Searching, ScanStatus::Connecting, ScanStatus::Connected]
      );
   }

   #[tokio::test]
   async fn test_pattern_is_case_sensitive() {
      let backend = MockBackend::with_devices(&["gn-attys1"]);
      let (mut scan, log) = scanner(backend, ScanSettings::default());
      assert_eq!(scan.scan().await.unwrap(), 0);
      assert_eq!(statuses(&log), vec![ScanStatus::Searching]);
   }

   #[tokio::test]
   async fn test_known_device_matches_without_name() {
      let backend = MockBackend::with_devices(&[UNKNOWN_NAME, "Phone"]);
      let (scan, _log) = scanner(backend, ScanSettings::default());
      let mut scan = scan.with_known_devices([address(0)]);
      assert_eq!(scan.scan().await.unwrap(), 1);
      assert_eq!(scan.attys_name(0), Some("0:[unknown]"));
   }

   #[tokio::test]
   async fn test_respects_max_devices() {
      let backend = MockBackend::with_devices(&["GN-ATTYS1", "GN-ATTYS2", "GN-ATTYS3"]);
      let settings = ScanSettings {
         max_devices: 2,
         ..Default::default()
      };
      let (mut scan, _log) = scanner(backend, settings);
      assert_eq!(scan.scan().await.unwrap(), 2);
      assert_eq!(scan.backend.connect_count(address(2)), 0);
   }

   #[tokio::test]
   async fn test_retries_then_gives_up() {
      let backend = MockBackend::with_devices(&["GN-ATTYS1", "GN-ATTYS2"])
         .fail(
            address(0),
            &[
               io::ErrorKind::PermissionDenied,
               io::ErrorKind::ConnectionRefused,
               io::ErrorKind::HostUnreachable,
            ],
         )
         .fail(address(1), &[io::ErrorKind::ConnectionRefused]);
      let (mut scan, log) = scanner(backend, ScanSettings::default());

      assert_eq!(scan.scan().await.unwrap(), 1);
      assert_eq!(scan.backend.connect_count(address(0)), 3);
      assert_eq!(scan.backend.connect_count(address(1)), 2);
      assert_eq!(scan.attys_name(0), Some("0:GN-ATTYS2"));

      let log = log.lock();
      let errors: Vec<_> = log
         .iter()
         .filter(|(s, _)| *s == ScanStatus::ConnectError)
         .map(|(_, t)| t.as_str())
         .collect();
      assert_eq!(
         errors,
         vec![
            "Permission denied. Attys not paired with this computer.",
            "Connect failed",
            "Connect failed",
            "Connect failed"
         ]
      );
      // numbering follows the connected devices
      assert_eq!(log[5].1, "Connecting to\nAttys #0:\nGN-ATTYS2");
      assert_eq!(log.last().unwrap().0, ScanStatus::Connected);
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_timeout_counts_as_attempt() {
      let mut backend = MockBackend::with_devices(&["GN-ATTYS1"]);
      backend.hanging.insert(address(0));
      let settings = ScanSettings {
         connect_attempts: 2,
         ..Default::default()
      };
      let (mut scan, log) = scanner(backend, settings);

      assert_eq!(scan.scan().await.unwrap(), 0);
      assert_eq!(scan.backend.connect_count(address(0)), 2);
      assert_eq!(
         statuses(&log),
         vec![
            ScanStatus::Searching,
            ScanStatus::Connecting,
            ScanStatus::ConnectError,
            ScanStatus::ConnectError
         ]
      );
   }

   #[tokio::test]
   async fn test_discovery_failures() {
      let (mut scan, log) = scanner(MockBackend::new(Discovery::NoAdapter), ScanSettings::default());
      assert!(matches!(scan.scan().await, Err(AttysError::AdapterNotFound)));
      assert_eq!(statuses(&log), vec![ScanStatus::Searching, ScanStatus::NoDevice]);

      let (mut scan, log) = scanner(MockBackend::new(Discovery::Broken), ScanSettings::default());
      assert!(matches!(scan.scan().await, Err(AttysError::Io(_))));
      assert_eq!(statuses(&log), vec![ScanStatus::Searching, ScanStatus::SocketError]);

      let (mut scan, log) = scanner(MockBackend::with_devices(&[]), ScanSettings::default());
      assert_eq!(scan.scan().await.unwrap(), 0);
      assert_eq!(statuses(&log), vec![ScanStatus::Searching, ScanStatus::NoDevice]);
   }

   #[tokio::test]
   async fn test_rescan_and_drop_quit_devices() {
      let backend = MockBackend::with_devices(&["GN-ATTYS1"]);
      let (mut scan, _log) = scanner(backend, ScanSettings::default());
      scan.unregister_listener();

      scan.scan().await.unwrap();
      let first = scan.attys_comm(0).unwrap().clone();
      assert!(!first.is_quitting());

      scan.scan().await.unwrap();
      assert!(first.is_quitting());
      let second = scan.attys_comm(0).unwrap().clone();
      assert_eq!(scan.len(), 1);

      drop(scan);
      assert!(second.is_quitting());
   }
}
