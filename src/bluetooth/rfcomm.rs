//! BlueZ backend for the scanner.
//!
//! Discovery goes through the BlueZ D-Bus API, the serial channel is a plain
//! RFCOMM stream socket.

use std::{io, pin::pin};

use bluer::{
   Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session, Uuid,
   rfcomm::{SocketAddr, Stream},
};
use futures::StreamExt;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::time;

use crate::{
   bluetooth::scanner::{Backend, Candidate, ScanSettings, UNKNOWN_NAME},
   error::{AttysError, Result},
};

/// Serial Port Profile, the service the Attys offers on its RFCOMM channel
const SERIAL_PORT_PROFILE: Uuid = uuid::uuid!("00001101-0000-1000-8000-00805f9b34fb");

/// [`Backend`] talking to the local BlueZ daemon.
pub struct BluezBackend {
   session: Session,
}

impl BluezBackend {
   pub async fn new() -> Result<Self> {
      Ok(Self {
         session: Session::new().await?,
      })
   }

   /// Selects the configured or default adapter and makes sure it is powered.
   async fn adapter(&self, settings: &ScanSettings) -> Result<Adapter> {
      let adapter = match &settings.adapter {
         Some(name) => self.session.adapter(name),
         None => self.session.default_adapter().await,
      }
      .map_err(|e| {
         warn!("No bluetooth adapter: {e}");
         AttysError::AdapterNotFound
      })?;
      let name = adapter.name().to_owned();

      match adapter.is_powered().await {
         Ok(true) => {},
         Ok(false) => {
            if let Err(e) = adapter.set_powered(true).await {
               warn!("Failed to power on adapter {name}: {e}");
               return Err(AttysError::AdapterNotAvailable);
            }
            info!("Powered on adapter: {name}");
         },
         Err(e) => {
            warn!("Adapter {name} is not usable: {e}");
            return Err(AttysError::AdapterNotFound);
         },
      }
      Ok(adapter)
   }

   /// Runs a BR/EDR inquiry and returns the addresses in the order found.
   async fn inquiry(adapter: &Adapter, settings: &ScanSettings) -> Result<Vec<Address>> {
      let mut found = Vec::new();
      if settings.inquiry_secs == 0 {
         return Ok(found);
      }

      adapter
         .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::BrEdr,
            ..Default::default()
         })
         .await?;
      let mut events = pin!(adapter.discover_devices().await?);

      debug!("Inquiry on {} for {}s", adapter.name(), settings.inquiry_secs);
      let _ = time::timeout(settings.inquiry_duration(), async {
         while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
               debug!("Inquiry found {addr}");
               found.push(addr);
            }
         }
      })
      .await;
      Ok(found)
   }

   async fn candidate(adapter: &Adapter, address: Address) -> Result<Candidate> {
      let device = adapter.device(address)?;
      let name = match device.name().await {
         Ok(Some(name)) => SmolStr::from(name),
         _ => match device.alias().await {
            Ok(alias) if !alias.is_empty() => SmolStr::from(alias),
            _ => SmolStr::new_static(UNKNOWN_NAME),
         },
      };
      let paired = device.is_paired().await.unwrap_or(false);
      let spp = matches!(device.uuids().await, Ok(Some(uuids)) if uuids.contains(&SERIAL_PORT_PROFILE));
      debug!("{address}  {name} (paired: {paired}, serial port: {spp})");
      Ok(Candidate {
         address,
         name,
         paired,
      })
   }
}

/// Inquiry results in the order found, then the remaining known devices.
fn merge_addresses(
   found: impl IntoIterator<Item = Address>,
   known: impl IntoIterator<Item = Address>,
) -> Vec<Address> {
   let mut merged = Vec::new();
   for addr in found.into_iter().chain(known) {
      if !merged.contains(&addr) {
         merged.push(addr);
      }
   }
   merged
}

impl Backend for BluezBackend {
   type Stream = Stream;

   async fn discover(&self, settings: &ScanSettings) -> Result<Vec<Candidate>> {
      let adapter = self.adapter(settings).await?;
      let found = Self::inquiry(&adapter, settings).await?;
      // devices BlueZ already knows about, paired ones included
      let addresses = merge_addresses(found, adapter.device_addresses().await?);

      let mut candidates = Vec::with_capacity(addresses.len());
      for addr in addresses {
         match Self::candidate(&adapter, addr).await {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => warn!("{addr}: skipping, {e}"),
         }
      }
      info!("Found {} bluetooth devices", candidates.len());
      Ok(candidates)
   }

   async fn connect(&self, address: Address, channel: u8) -> io::Result<Stream> {
      debug!("Opening RFCOMM channel {channel} to {address}");
      Stream::connect(SocketAddr::new(address, channel)).await
   }
}
