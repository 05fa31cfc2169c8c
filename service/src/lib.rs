//! Transport layer of the in-vehicle application gateway.
//!
//! The [`TransportManager`] discovers devices through pluggable
//! [`DeviceAdapter`]s, opens per-application sessions on them, queues
//! outbound traffic and fans adapter events out to registered
//! [`DeviceAdapterListener`]s.

pub mod adapter;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod types;

pub use adapter::{
   AdapterId, AdapterResult, DeviceAdapter, DeviceAdapterRef, NotSupported,
   error::{DeviceAdapterError, ErrorKind},
};
pub use config::{AdapterSettings, Config};
pub use error::{Result, TransportError};
pub use event::{DeviceAdapterListener, ListenerRef, TransportEvent};
pub use manager::{
   TransportManager,
   dispatch::ListenerId,
   registry::{ConnectionEntry, ConnectionState},
};
pub use types::{
   ApplicationHandle, ApplicationList, DataContainer, DeviceHandle, DeviceList, DeviceType,
   RawMessage, SessionId,
};
