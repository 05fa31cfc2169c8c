//! Configuration management for the transport manager.
//!
//! This module handles loading and saving configuration from disk,
//! including queue sizing and per-transport adapter settings.

use std::{
   collections::BTreeMap,
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{Result, TransportError},
   types::DeviceType,
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Maximum number of queued outbound messages, `0` for unbounded.
   #[serde(default = "default_queue_capacity")]
   pub message_queue_capacity: usize,

   /// Maximum number of events dispatched per wake-up of the event thread.
   #[serde(default = "default_event_batch_limit")]
   pub event_batch_limit: usize,

   /// Settings keyed by device type.
   #[serde(default)]
   pub adapters: BTreeMap<SmolStr, AdapterSettings>,
}

/// Settings handed to an adapter at `init`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AdapterSettings {
   #[serde(default = "default_enabled")]
   pub enabled: bool,

   /// Transport-specific options, interpreted by the adapter itself.
   #[serde(default)]
   pub options: toml::Table,
}

const fn default_queue_capacity() -> usize {
   1024
}

const fn default_event_batch_limit() -> usize {
   64
}

const fn default_enabled() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         message_queue_capacity: default_queue_capacity(),
         event_batch_limit: default_event_batch_limit(),
         adapters: BTreeMap::new(),
      }
   }
}

impl Default for AdapterSettings {
   fn default() -> Self {
      Self {
         enabled: default_enabled(),
         options: toml::Table::new(),
      }
   }
}

impl AdapterSettings {
   pub fn option_bool(&self, key: &str) -> Option<bool> {
      self.options.get(key).and_then(toml::Value::as_bool)
   }

   pub fn option_u64(&self, key: &str) -> Option<u64> {
      self
         .options
         .get(key)
         .and_then(toml::Value::as_integer)
         .and_then(|v| u64::try_from(v).ok())
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Self::from_toml_str(&contents)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn from_toml_str(contents: &str) -> Result<Self> {
      Ok(toml::from_str(contents)?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("TRANSPORTD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(TransportError::ConfigDirNotFound);
      };

      Ok(config_dir.join("transportd").join("config.toml"))
   }

   /// Settings for `device_type`, falling back to defaults.
   pub fn adapter_settings(&self, device_type: &DeviceType) -> AdapterSettings {
      self
         .adapters
         .get(device_type.as_str())
         .cloned()
         .unwrap_or_default()
   }
}
