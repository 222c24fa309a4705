//! Attys protocol definitions and acquisition settings.
//!
//! This module contains the channel layout, the command strings understood
//! by the Attys firmware and the settings that are uploaded on connect.

use serde::{Deserialize, Serialize};

/// Number of channels in a decoded sample.
pub const NCHANNELS: usize = 11;

/// One decoded sample, indexed by [`Channel`].
pub type Sample = [f32; NCHANNELS];

/// Reference voltage of the ADC in volts.
pub const ADC_REF: f32 = 2.42;
/// Standard gravity in m/s^2.
pub const ONE_G: f32 = 9.80665;
/// Full scale range of the magnetometer in tesla.
pub const MAG_FULL_SCALE: f32 = 4800.0E-6;

/// Stops the ADC; preceded by blank lines to flush any partial command.
pub const CMD_STOP_ADC: &[u8] = b"\r\n\r\n\r\nx=0\r";
/// Starts the ADC and switches the device into streaming mode.
pub const CMD_START_ADC: &[u8] = b"\r\nx=1\r";
/// Acknowledgement line sent by the device after every command.
pub const REPLY_OK: &str = "OK";

/// Builds a synchronous `key=value` command.
pub fn sync_command(key: char, value: u8) -> String {
   format!("\n\r{key}={value}\r")
}

/// Channels of a decoded sample.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::EnumIter)]
pub enum Channel {
   AccelerationX = 0,
   AccelerationY = 1,
   AccelerationZ = 2,
   MagneticFieldX = 3,
   MagneticFieldY = 4,
   MagneticFieldZ = 5,
   Analogue1 = 6,
   Analogue2 = 7,
   Gpio0 = 8,
   Gpio1 = 9,
   Charging = 10,
}

impl Channel {
   pub const fn index(self) -> usize {
      self as usize
   }

   pub const fn description(self) -> &'static str {
      match self {
         Self::AccelerationX => "Acceleration X",
         Self::AccelerationY => "Acceleration Y",
         Self::AccelerationZ => "Acceleration Z",
         Self::MagneticFieldX => "Magnetic field X",
         Self::MagneticFieldY => "Magnetic field Y",
         Self::MagneticFieldZ => "Magnetic field Z",
         Self::Analogue1 => "Analogue channel 1",
         Self::Analogue2 => "Analogue channel 2",
         Self::Gpio0 => "Digital I/O 0",
         Self::Gpio1 => "Digital I/O 1",
         Self::Charging => "Charging",
      }
   }

   pub const fn short_description(self) -> &'static str {
      match self {
         Self::AccelerationX => "Acc X",
         Self::AccelerationY => "Acc Y",
         Self::AccelerationZ => "Acc Z",
         Self::MagneticFieldX => "Mag X",
         Self::MagneticFieldY => "Mag Y",
         Self::MagneticFieldZ => "Mag Z",
         Self::Analogue1 => "ADC 1",
         Self::Analogue2 => "ADC 2",
         Self::Gpio0 => "GPIO0",
         Self::Gpio1 => "GPIO1",
         Self::Charging => "CHARGING",
      }
   }

   pub const fn unit(self) -> &'static str {
      match self {
         Self::AccelerationX | Self::AccelerationY | Self::AccelerationZ => "m/s^2",
         Self::MagneticFieldX | Self::MagneticFieldY | Self::MagneticFieldZ => "T",
         _ => "V",
      }
   }
}

/// ADC sampling rate.
#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum SamplingRate {
   #[strum(serialize = "125Hz")]
   Hz125 = 0,
   #[default]
   #[strum(serialize = "250Hz")]
   Hz250 = 1,
   #[strum(serialize = "500Hz")]
   Hz500 = 2,
}

impl SamplingRate {
   pub const fn hz(self) -> u32 {
      match self {
         Self::Hz125 => 125,
         Self::Hz250 => 250,
         Self::Hz500 => 500,
      }
   }

   /// 500Hz packs two samples into every packet.
   pub const fn is_high_speed(self) -> bool {
      matches!(self, Self::Hz500)
   }
}

/// Full data set or only the ADC channels.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::FromRepr)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
   Partial = 0,
   #[default]
   Full = 1,
}

/// ADC gain. The wire index follows the ADC's own numbering where index 0
/// is a gain of 6.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::FromRepr)]
#[serde(rename_all = "lowercase")]
pub enum AdcGain {
   #[default]
   X6 = 0,
   X1 = 1,
   X2 = 2,
   X3 = 3,
   X4 = 4,
   X8 = 5,
   X12 = 6,
}

impl AdcGain {
   pub const fn factor(self) -> u32 {
      match self {
         Self::X6 => 6,
         Self::X1 => 1,
         Self::X2 => 2,
         Self::X3 => 3,
         Self::X4 => 4,
         Self::X8 => 8,
         Self::X12 => 12,
      }
   }

   /// Full scale range in volts.
   pub fn full_scale(self) -> f32 {
      ADC_REF / self.factor() as f32
   }
}

/// ADC input multiplexer setting.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::FromRepr)]
#[serde(rename_all = "snake_case")]
pub enum AdcMux {
   #[default]
   Normal = 0,
   Short = 1,
   Supply = 3,
   Temperature = 4,
   TestSignal = 5,
   EcgEinthoven = 6,
}

/// Accelerometer full scale range.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::FromRepr)]
#[serde(rename_all = "lowercase")]
pub enum AccelRange {
   G2 = 0,
   G4 = 1,
   G8 = 2,
   #[default]
   G16 = 3,
}

impl AccelRange {
   /// Full scale range in m/s^2.
   pub fn full_scale(self) -> f32 {
      let g = match self {
         Self::G2 => 2.0,
         Self::G4 => 4.0,
         Self::G8 => 8.0,
         Self::G16 => 16.0,
      };
      g * ONE_G
   }
}

/// Bias current used for resistance measurements.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::FromRepr)]
#[serde(rename_all = "lowercase")]
pub enum BiasCurrent {
   #[default]
   Na6 = 0,
   Na22 = 1,
   Ua6 = 2,
   Ua22 = 3,
}

/// Which ADC inputs get the bias current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CurrentMask {
   #[serde(default)]
   pub pos_ch1: bool,
   #[serde(default)]
   pub neg_ch1: bool,
   #[serde(default)]
   pub pos_ch2: bool,
}

impl CurrentMask {
   pub const fn bits(self) -> u8 {
      (self.pos_ch1 as u8) | (self.neg_ch1 as u8) << 1 | (self.pos_ch2 as u8) << 2
   }
}

/// Gain and mux of one ADC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdcChannel {
   #[serde(default)]
   pub gain: AdcGain,
   #[serde(default)]
   pub mux: AdcMux,
}

impl AdcChannel {
   /// Register value sent with the `a=`/`b=` commands.
   pub const fn register(self) -> u8 {
      (self.mux as u8 & 0x0f) | ((self.gain as u8 & 0x0f) << 4)
   }
}

/// Acquisition settings uploaded to the device before streaming starts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AttysSettings {
   #[serde(default)]
   pub sampling_rate: SamplingRate,
   #[serde(default)]
   pub data_mode: DataMode,
   #[serde(default)]
   pub accel_range: AccelRange,
   #[serde(default)]
   pub adc1: AdcChannel,
   #[serde(default)]
   pub adc2: AdcChannel,
   #[serde(default)]
   pub bias_current: BiasCurrent,
   #[serde(default)]
   pub current_mask: CurrentMask,
}

impl AttysSettings {
   pub const fn adc(&self, channel: usize) -> Option<AdcChannel> {
      match channel {
         0 => Some(self.adc1),
         1 => Some(self.adc2),
         _ => None,
      }
   }

   /// Synchronous commands in upload order, each answered with `OK`.
   pub fn init_commands(&self) -> Vec<String> {
      vec![
         // base64 encoded packets
         sync_command('d', 1),
         sync_command('r', self.sampling_rate as u8),
         sync_command('f', self.data_mode as u8),
         sync_command('t', self.accel_range as u8),
         sync_command('a', self.adc1.register()),
         sync_command('b', self.adc2.register()),
         sync_command('c', self.current_mask.bits()),
         sync_command('i', self.bias_current as u8),
      ]
   }
}
