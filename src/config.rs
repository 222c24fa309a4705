//! Configuration management for the Attys scanner.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices, scan parameters and acquisition settings.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use bluer::Address;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
   attys::protocol::AttysSettings,
   bluetooth::scanner::ScanSettings,
   error::{AttysError, Result},
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default)]
   pub scan: ScanSettings,

   #[serde(default)]
   pub attys: AttysSettings,
}

/// A device that is treated as an Attys whatever its name.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         debug!("Loading configuration from {}", path.display());
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(attys_home) = env::var("ATTYS_HOME") {
         PathBuf::from(attys_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(AttysError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("attysscan").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }

   /// Parsed addresses of the known devices. Invalid entries are skipped.
   pub fn known_addresses(&self) -> Vec<Address> {
      self
         .known_devices
         .iter()
         .filter_map(|d| match d.address.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
               warn!("Ignoring known device {:?}: {e}", d.address);
               None
            },
         })
         .collect()
   }
}
