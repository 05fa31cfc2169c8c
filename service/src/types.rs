//! Identity and payload types shared by adapters and the transport manager.

use core::fmt;
use std::{ops::Deref, sync::Arc};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

macro_rules! handle_type {
   ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
      $(#[$meta])*
      #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
      #[serde(transparent)]
      pub struct $name(pub u32);

      impl $name {
         pub const fn get(self) -> u32 {
            self.0
         }
      }

      impl From<u32> for $name {
         fn from(value: u32) -> Self {
            Self(value)
         }
      }

      impl fmt::Display for $name {
         fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, concat!($prefix, "#{}"), self.0)
         }
      }
   };
}

handle_type!(
   /// Transport-scoped identity of a discovered device.
   ///
   /// Only meaningful together with the adapter that reported it.
   DeviceHandle,
   "dev"
);

handle_type!(
   /// Identity of an application instance reachable on a device.
   ApplicationHandle,
   "app"
);

handle_type!(
   /// Manager-scoped identity of one logical connection.
   ///
   /// Allocated by the transport manager and never reused.
   SessionId,
   "session"
);

/// Stable identifier of a transport kind (`"bluetooth"`, `"usb"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceType(SmolStr);

impl DeviceType {
   pub fn new(name: impl AsRef<str>) -> Self {
      Self(SmolStr::new(name))
   }

   pub const fn new_static(name: &'static str) -> Self {
      Self(SmolStr::new_static(name))
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }
}

impl fmt::Display for DeviceType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

pub type DeviceList = Vec<DeviceHandle>;
pub type ApplicationList = Vec<ApplicationHandle>;

/// Immutable byte buffer shared between an adapter and every listener.
///
/// Cloning is cheap and never copies the payload.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DataContainer(Arc<[u8]>);

impl DataContainer {
   pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
      Self(data.into())
   }

   pub fn as_slice(&self) -> &[u8] {
      &self.0
   }

   /// Number of live handles to the underlying buffer.
   pub fn holders(&self) -> usize {
      Arc::strong_count(&self.0)
   }
}

impl Deref for DataContainer {
   type Target = [u8];

   fn deref(&self) -> &[u8] {
      &self.0
   }
}

impl AsRef<[u8]> for DataContainer {
   fn as_ref(&self) -> &[u8] {
      &self.0
   }
}

impl From<Vec<u8>> for DataContainer {
   fn from(data: Vec<u8>) -> Self {
      Self(data.into())
   }
}

impl From<&[u8]> for DataContainer {
   fn from(data: &[u8]) -> Self {
      Self(data.into())
   }
}

impl<const N: usize> From<&[u8; N]> for DataContainer {
   fn from(data: &[u8; N]) -> Self {
      Self(data.as_slice().into())
   }
}

impl fmt::Debug for DataContainer {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.0.len() <= 16 {
         write!(f, "DataContainer({})", hex::encode(&self.0))
      } else {
         write!(
            f,
            "DataContainer({}.. {} bytes)",
            hex::encode(&self.0[..16]),
            self.0.len()
         )
      }
   }
}

/// Outbound payload waiting in the manager's queue.
#[derive(Debug, Clone)]
pub struct RawMessage {
   pub session: SessionId,
   pub payload: DataContainer,
   /// Enqueue order, assigned by the manager.
   pub serial: u64,
}
