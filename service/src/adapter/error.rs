//! Failure taxonomy reported by device adapters.

use smol_str::SmolStr;
use thiserror::Error;

use crate::types::{DeviceHandle, SessionId};

/// Failure domain of a [`DeviceAdapterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum ErrorKind {
   SearchDevice,
   ConnectDevice,
   DisconnectDevice,
   DataReceive,
   DataSend,
   Communication,
}

/// An adapter-side failure, constructed where it happened and reported
/// exactly once through the listener contract.
///
/// Device and session context is attached whenever the failing operation
/// had one, so the manager can update its registry precisely.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {reason}")]
pub struct DeviceAdapterError {
   kind: ErrorKind,
   device: Option<DeviceHandle>,
   session: Option<SessionId>,
   reason: SmolStr,
}

impl DeviceAdapterError {
   fn new(
      kind: ErrorKind,
      device: Option<DeviceHandle>,
      session: Option<SessionId>,
      reason: impl AsRef<str>,
   ) -> Self {
      Self {
         kind,
         device,
         session,
         reason: SmolStr::new(reason),
      }
   }

   pub fn search_device(reason: impl AsRef<str>) -> Self {
      Self::new(ErrorKind::SearchDevice, None, None, reason)
   }

   pub fn connect_device(
      device: DeviceHandle,
      session: SessionId,
      reason: impl AsRef<str>,
   ) -> Self {
      Self::new(ErrorKind::ConnectDevice, Some(device), Some(session), reason)
   }

   pub fn disconnect_device(session: SessionId, reason: impl AsRef<str>) -> Self {
      Self::new(ErrorKind::DisconnectDevice, None, Some(session), reason)
   }

   pub fn data_receive(session: SessionId, reason: impl AsRef<str>) -> Self {
      Self::new(ErrorKind::DataReceive, None, Some(session), reason)
   }

   pub fn data_send(session: SessionId, reason: impl AsRef<str>) -> Self {
      Self::new(ErrorKind::DataSend, None, Some(session), reason)
   }

   /// Transport fault not tied to a single operation.
   pub fn communication(device: Option<DeviceHandle>, reason: impl AsRef<str>) -> Self {
      Self::new(ErrorKind::Communication, device, None, reason)
   }

   #[must_use]
   pub fn with_device(mut self, device: DeviceHandle) -> Self {
      self.device = Some(device);
      self
   }

   pub const fn kind(&self) -> ErrorKind {
      self.kind
   }

   pub const fn device(&self) -> Option<DeviceHandle> {
      self.device
   }

   pub const fn session(&self) -> Option<SessionId> {
      self.session
   }

   pub fn reason(&self) -> &str {
      &self.reason
   }
}
