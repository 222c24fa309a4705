//! Packet decoding for the Attys data stream.
//!
//! In streaming mode every line sent by the Attys is one base64 encoded
//! packet. At 125Hz and 250Hz a packet carries one sample, at 500Hz it
//! carries two. Each packet also has an 8 bit counter used to detect
//! packets lost over the air.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use log::{trace, warn};
use smallvec::SmallVec;
use thiserror::Error;

use crate::attys::protocol::{
   AttysSettings, Channel, DataMode, MAG_FULL_SCALE, NCHANNELS, Sample,
};

/// Samples produced by a single packet, lost packets already filled in.
pub type Samples = SmallVec<[Sample; 2]>;

const MID_16: f32 = 0x8000 as f32;
const MID_24: f32 = 0x80_0000 as f32;

/// Minimum packet lengths per layout.
const PARTIAL_LEN: usize = 7;
const FULL_LEN: usize = 20;
const HIGH_SPEED_LEN: usize = 20;

/// Error type for packet decoding.
#[derive(Error, Debug)]
pub enum DecodeError {
   #[error("Invalid base64: {0}")]
   Base64(#[from] base64::DecodeError),

   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },
}

/// Stateful decoder turning packet lines into samples.
#[derive(Debug, Clone)]
pub struct Decoder {
   settings: AttysSettings,
   sample: Sample,
   expected_timestamp: u8,
   timestamp_synced: bool,
}

impl Decoder {
   pub fn new(settings: AttysSettings) -> Self {
      Self {
         settings,
         sample: [0.0; NCHANNELS],
         expected_timestamp: 0,
         timestamp_synced: false,
      }
   }

   /// Decodes one line. A line that cannot be decoded yields the previous
   /// sample again so the sample clock keeps running.
   pub fn decode_line(&mut self, line: &str) -> Samples {
      match self.try_decode(line.trim()) {
         Ok(samples) => samples,
         Err(e) => {
            warn!("Reception error ({e}): {line:?}");
            self.expected_timestamp = self.expected_timestamp.wrapping_add(1);
            SmallVec::from_elem(self.sample, 1)
         },
      }
   }

   fn try_decode(&mut self, line: &str) -> Result<Samples, DecodeError> {
      let raw = BASE64.decode(line)?;
      trace!("← {}", hex::encode(&raw));
      if self.settings.sampling_rate.is_high_speed() {
         self.decode_high_speed(&raw)
      } else {
         self.decode_standard(&raw)
      }
   }

   fn decode_standard(&mut self, raw: &[u8]) -> Result<Samples, DecodeError> {
      let full = self.settings.data_mode == DataMode::Full;
      check_len(raw, if full { FULL_LEN } else { PARTIAL_LEN })?;

      let mut sample = self.sample;
      decode_flags(&mut sample, raw[6]);
      for i in 0..2 {
         sample[Channel::Analogue1.index() + i] = self.adc_volts(i, le24(&raw[i * 3..]));
      }
      if full {
         let accel = self.settings.accel_range.full_scale();
         for i in 0..3 {
            sample[Channel::AccelerationX.index() + i] = scale16(le16(&raw[8 + i * 2..])) * accel;
            sample[Channel::MagneticFieldX.index() + i] =
               scale16(le16(&raw[14 + i * 2..])) * MAG_FULL_SCALE;
         }
      }

      let repeats = raw.get(7).map_or(1, |&ts| self.track_timestamp(ts));
      self.sample = sample;
      Ok(SmallVec::from_elem(sample, repeats))
   }

   fn decode_high_speed(&mut self, raw: &[u8]) -> Result<Samples, DecodeError> {
      check_len(raw, HIGH_SPEED_LEN)?;

      let mut sample = self.sample;
      decode_flags(&mut sample, raw[12]);
      let accel = self.settings.accel_range.full_scale();
      for i in 0..3 {
         sample[Channel::AccelerationX.index() + i] = scale16(le16(&raw[14 + i * 2..])) * accel;
      }

      let mut first = sample;
      for i in 0..2 {
         first[Channel::Analogue1.index() + i] = self.adc_volts(i, le24(&raw[i * 3..]));
         sample[Channel::Analogue1.index() + i] = self.adc_volts(i, le24(&raw[6 + i * 3..]));
      }

      let repeats = self.track_timestamp(raw[13]);
      self.sample = sample;

      let mut samples = Samples::new();
      samples.push(first);
      // a lost packet held two samples
      samples.extend((0..2 * repeats - 1).map(|_| sample));
      Ok(samples)
   }

   fn adc_volts(&self, channel: usize, v: u32) -> f32 {
      let gain = self.settings.adc(channel).unwrap_or_default().gain;
      (v as f32 - MID_24) / MID_24 * gain.full_scale()
   }

   /// Returns how often the packet has to be emitted to cover lost packets.
   fn track_timestamp(&mut self, ts: u8) -> usize {
      let gap = ts.wrapping_sub(self.expected_timestamp) as i8;
      let mut repeats = 1;
      if gap > 0 {
         if self.timestamp_synced {
            warn!("Timestamp={ts}, expected={}", self.expected_timestamp);
            repeats += gap as usize;
         } else {
            self.timestamp_synced = true;
         }
      }
      self.expected_timestamp = ts.wrapping_add(1);
      repeats
   }
}

fn check_len(raw: &[u8], expected: usize) -> Result<(), DecodeError> {
   if raw.len() < expected {
      return Err(DecodeError::PacketTooShort {
         expected,
         actual: raw.len(),
      });
   }
   Ok(())
}

fn decode_flags(sample: &mut Sample, flags: u8) {
   sample[Channel::Gpio0.index()] = bit(flags, 5);
   sample[Channel::Gpio1.index()] = bit(flags, 6);
   sample[Channel::Charging.index()] = bit(flags, 7);
}

fn le16(b: &[u8]) -> u32 {
   u32::from(b[0]) | u32::from(b[1]) << 8
}

fn le24(b: &[u8]) -> u32 {
   u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16
}

fn scale16(v: u32) -> f32 {
   (v as f32 - MID_16) / MID_16
}

fn bit(flags: u8, n: u8) -> f32 {
   if flags & (1 << n) == 0 { 0.0 } else { 1.0 }
}
