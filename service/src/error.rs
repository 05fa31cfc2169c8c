//! Error types for the transport manager.
//!
//! Adapter-originated failures travel through the listener contract as
//! [`DeviceAdapterError`](crate::adapter::error::DeviceAdapterError); this
//! module covers the synchronous outcomes of manager operations plus
//! configuration and I/O errors.

use thiserror::Error;

use crate::{
   adapter::AdapterId,
   types::{DeviceHandle, DeviceType, SessionId},
};

/// Main error type for the transport manager.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Operation not supported by adapter {0}")]
   NotSupported(AdapterId),

   #[error("Adapter type {0} is disabled by configuration")]
   AdapterDisabled(DeviceType),

   #[error("Adapter not found: {0}")]
   AdapterNotFound(AdapterId),

   #[error("Adapter is already registered as {0}")]
   AdapterAlreadyRegistered(AdapterId),

   #[error("No adapter owns device {0}")]
   DeviceNotFound(DeviceHandle),

   #[error("Session not found: {0}")]
   SessionNotFound(SessionId),

   #[error("Disconnect already in progress for {0}")]
   DisconnectInProgress(SessionId),

   #[error("Session ids exhausted")]
   SessionsExhausted,

   #[error("Message queue is full")]
   QueueFull,

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Manager is already running")]
   AlreadyRunning,
}

/// Convenience type alias for Results with `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;
