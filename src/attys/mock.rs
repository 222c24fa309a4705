//! In-memory Attys for tests.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bluer::Address;
use tokio::{
   io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
   task::JoinHandle,
};

use crate::attys::{comm::AttysComm, protocol::AttysSettings};

pub fn address(n: u8) -> Address {
   Address::new([0x00, 0x06, 0x66, 0x00, 0x00, n])
}

/// Full mode packet with the given ADC 1 value and counter.
pub fn packet(adc1: u32, ts: u8) -> String {
   let mut raw = Vec::new();
   raw.extend_from_slice(&adc1.to_le_bytes()[..3]);
   raw.extend_from_slice(&0x80_0000u32.to_le_bytes()[..3]);
   raw.push(0);
   raw.push(ts);
   for _ in 0..6 {
      raw.extend_from_slice(&0x8000u16.to_le_bytes());
   }
   BASE64.encode(raw)
}

/// Answers every command with `OK` and streams canned packets after `x=1`.
#[derive(Debug, Clone, Default)]
pub struct MockAttys {
   packets: Vec<Vec<u8>>,
   silent: bool,
   hang_up: bool,
}

impl MockAttys {
   pub fn new(packets: Vec<String>) -> Self {
      Self::from_raw(packets.into_iter().map(String::into_bytes).collect())
   }

   /// Streams the lines as given, without any validation.
   pub fn from_raw(packets: Vec<Vec<u8>>) -> Self {
      Self {
         packets,
         ..Default::default()
      }
   }

   /// Never replies.
   pub fn silent() -> Self {
      Self {
         silent: true,
         ..Default::default()
      }
   }

   /// Closes the stream once all packets are sent.
   pub fn hang_up_after_streaming(mut self) -> Self {
      self.hang_up = true;
      self
   }

   /// Connects a new [`AttysComm`] to this device.
   pub fn spawn(self, settings: AttysSettings) -> (AttysComm, JoinHandle<Vec<String>>) {
      let (client, device) = tokio::io::duplex(64 * 1024);
      let comm = AttysComm::new(client, address(1), "GN-ATTYS1", settings);
      (comm, tokio::spawn(self.serve(device)))
   }

   /// Serves one connection, returning the commands received.
   pub async fn serve(self, stream: DuplexStream) -> Vec<String> {
      let (reader, mut writer) = tokio::io::split(stream);
      let mut reader = BufReader::new(reader);
      let mut commands = Vec::new();
      let mut buf = Vec::new();
      loop {
         buf.clear();
         match reader.read_until(b'\r', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {},
         }
         let cmd = String::from_utf8_lossy(&buf).trim().to_owned();
         if cmd.is_empty() {
            continue;
         }
         commands.push(cmd.clone());
         if self.silent {
            continue;
         }

         if cmd == "x=1" {
            for p in &self.packets {
               if writer.write_all(p).await.is_err() || writer.write_all(b"\r\n").await.is_err() {
                  return commands;
               }
            }
            if self.hang_up {
               break;
            }
         } else if writer.write_all(b"OK\r\n").await.is_err() {
            break;
         }
      }
      commands
   }
}
