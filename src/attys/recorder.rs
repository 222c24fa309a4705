//! Recording of samples into a delimited text file.
//!
//! Every sample becomes one line: the time in seconds followed by all
//! channel values, each terminated by the configured separator.

use std::{
   fs::File,
   io::{BufWriter, Write},
   path::{Path, PathBuf},
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
   attys::protocol::{Channel, Sample},
   error::Result,
};

/// Column separator of the recording.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Separator {
   #[default]
   Tab,
   Comma,
   Space,
}

impl Separator {
   pub const fn as_char(self) -> char {
      match self {
         Self::Tab => '\t',
         Self::Comma => ',',
         Self::Space => ' ',
      }
   }
}

struct Recording {
   path: PathBuf,
   writer: BufWriter<File>,
}

/// Writes samples to a text file while recording is active.
#[derive(Default)]
pub struct DataRecorder {
   recording: Option<Recording>,
   separator: Separator,
   gpio_logging: bool,
}

impl DataRecorder {
   pub fn new() -> Self {
      Self::default()
   }

   /// Starts a new recording, replacing any running one.
   pub fn start_rec(&mut self, path: impl AsRef<Path>) -> Result<()> {
      self.stop_rec()?;
      let path = path.as_ref().to_path_buf();
      let file = File::create(&path).inspect_err(|e| {
         warn!("Could not start recording to {}: {e}", path.display());
      })?;
      info!("Recording to {}", path.display());
      self.recording = Some(Recording {
         path,
         writer: BufWriter::new(file),
      });
      Ok(())
   }

   /// Stops recording and flushes the file. Does nothing when idle.
   pub fn stop_rec(&mut self) -> Result<()> {
      if let Some(mut rec) = self.recording.take() {
         rec.writer.flush()?;
         info!("Stopped recording to {}", rec.path.display());
      }
      Ok(())
   }

   pub const fn is_recording(&self) -> bool {
      self.recording.is_some()
   }

   pub fn path(&self) -> Option<&Path> {
      self.recording.as_ref().map(|r| r.path.as_path())
   }

   pub const fn set_separator(&mut self, separator: Separator) {
      self.separator = separator;
   }

   /// Appends the two GPIO channels once more at the end of each line.
   ///
   /// Every column, the extra ones included, is written as value then
   /// separator. The Android AttysComm service puts the separator in front
   /// of the GPIO values instead, leaving an empty column before them, so
   /// with GPIO logging on the columns do not line up with its recordings.
   pub const fn set_gpio_logging(&mut self, enabled: bool) {
      self.gpio_logging = enabled;
   }

   pub fn save_data(&mut self, sample_number: u64, rate_hz: u32, sample: &Sample) -> Result<()> {
      let Some(rec) = self.recording.as_mut() else {
         return Ok(());
      };

      let sep = self.separator.as_char();
      let time = sample_number as f64 / f64::from(rate_hz);
      let mut line = format!("{time:.6}{sep}");
      for v in sample {
         line.push_str(&format!("{v:.6}{sep}"));
      }
      if self.gpio_logging {
         for ch in [Channel::Gpio0, Channel::Gpio1] {
            line.push_str(&format!("{:.6}{sep}", sample[ch.index()]));
         }
      }
      line.push('\n');
      rec.writer.write_all(line.as_bytes())?;
      Ok(())
   }
}

impl Drop for DataRecorder {
   fn drop(&mut self) {
      if let Err(e) = self.stop_rec() {
         warn!("Failed to finish recording: {e}");
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::attys::protocol::NCHANNELS;
   use std::{fs, str::FromStr};

   #[test]
   fn test_record_lines() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("rec.tsv");

      let mut recorder = DataRecorder::new();
      assert!(!recorder.is_recording());
      recorder.start_rec(&path).unwrap();
      assert_eq!(recorder.path(), Some(path.as_path()));

      let mut sample = [0.0; NCHANNELS];
      sample[Channel::Analogue1.index()] = 1.5;
      recorder.save_data(0, 250, &sample).unwrap();
      recorder.save_data(125, 250, &sample).unwrap();
      recorder.stop_rec().unwrap();
      assert!(!recorder.is_recording());

      let contents = fs::read_to_string(&path).unwrap();
      let lines: Vec<_> = contents.lines().collect();
      assert_eq!(lines.len(), 2);
      let cols: Vec<_> = lines[1].split('\t').collect();
      // time + channels + trailing empty column
      assert_eq!(cols.len(), NCHANNELS + 2);
      assert_eq!(cols[0], "0.500000");
      assert_eq!(cols[1 + Channel::Analogue1.index()], "1.500000");
      assert_eq!(cols[NCHANNELS + 1], "");
   }

   #[test]
   fn test_separator_and_gpio() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("rec.csv");

      let mut recorder = DataRecorder::new();
      recorder.set_separator(Separator::from_str("comma").unwrap());
      recorder.set_gpio_logging(true);
      recorder.start_rec(&path).unwrap();

      let mut sample = [0.0; NCHANNELS];
      sample[Channel::Gpio1.index()] = 1.0;
      recorder.save_data(1, 125, &sample).unwrap();
      drop(recorder);

      let contents = fs::read_to_string(&path).unwrap();
      let cols: Vec<_> = contents.trim_end().split(',').collect();
      assert_eq!(cols.len(), NCHANNELS + 4);
      assert_eq!(cols[0], "0.008000");
      assert_eq!(cols[NCHANNELS + 2], "1.000000");
   }

   #[test]
   fn test_save_without_recording_is_noop() {
      let mut recorder = DataRecorder::new();
      recorder.save_data(0, 250, &[0.0; NCHANNELS]).unwrap();
      recorder.stop_rec().unwrap();
   }
}
