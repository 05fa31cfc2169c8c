//! Device adapter contract.
//!
//! A device adapter abstracts one physical or logical transport. Every
//! mutating operation is asynchronous: the call only starts the work and
//! the outcome arrives later through the [`DeviceAdapterListener`] the
//! adapter was initialized with. Concrete adapters own their I/O threads.
//!
//! [`DeviceAdapterListener`]: crate::event::DeviceAdapterListener

use core::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::{
   config::AdapterSettings,
   event::ListenerRef,
   types::{
      ApplicationHandle, ApplicationList, DataContainer, DeviceHandle, DeviceList, DeviceType,
      SessionId,
   },
};

pub mod error;
pub mod loopback;

/// Manager-assigned identity of a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(pub u32);

impl fmt::Display for AdapterId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "adapter#{}", self.0)
   }
}

/// Returned synchronously when the adapter cannot perform an operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation not supported")]
pub struct NotSupported;

pub type AdapterResult = std::result::Result<(), NotSupported>;

/// Capability contract of a transport.
pub trait DeviceAdapter: Send + Sync {
   /// Stable transport identifier, free of side effects.
   fn device_type(&self) -> DeviceType;

   /// Binds the adapter to its listener and starts internal resources.
   ///
   /// Called exactly once by the manager, before any other operation.
   fn init(&self, id: AdapterId, listener: ListenerRef, settings: &AdapterSettings)
   -> AdapterResult;

   fn is_search_devices_supported(&self) -> bool;

   /// Starts discovery. Reported via `on_search_device_done` or
   /// `on_search_device_failed`, never synchronously.
   fn search_devices(&self) -> AdapterResult;

   fn is_server_originated_connect_supported(&self) -> bool;

   /// Starts connecting `app` on `device` as `session`.
   fn connect(
      &self,
      device: DeviceHandle,
      app: ApplicationHandle,
      session: SessionId,
   ) -> AdapterResult;

   /// Whether the transport accepts connections the manager did not start.
   fn is_client_originated_connect_supported(&self) -> bool;

   /// Best-effort teardown of `session`.
   fn disconnect(&self, session: SessionId);

   /// Starts sending `data` on `session`.
   fn send_data(&self, session: SessionId, data: DataContainer) -> AdapterResult;

   /// Point-in-time copy of the devices currently known to the adapter.
   fn device_list(&self) -> DeviceList;

   /// Point-in-time copy of the applications reachable on `device`.
   fn application_list(&self, device: DeviceHandle) -> ApplicationList;

   /// Releases internal resources. The adapter receives no further calls.
   fn terminate(&self) {}
}

/// Type alias for a shared adapter handle.
pub type DeviceAdapterRef = Arc<dyn DeviceAdapter>;
