//! Session and device bookkeeping.
//!
//! The registry is the authoritative `SessionId -> ConnectionEntry` map plus
//! the directory of which adapter most recently reported each device. All
//! mutation happens under one mutex, which is never held across adapter or
//! listener calls.

use std::{
   collections::HashMap,
   sync::atomic::{AtomicU32, Ordering},
};

use log::debug;
use parking_lot::Mutex;

use crate::{
   adapter::{AdapterId, DeviceAdapterRef},
   types::{ApplicationHandle, DeviceHandle, SessionId},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
   /// Connect requested, adapter has not answered yet.
   Pending,
   Connected,
   /// Disconnect requested, adapter has not answered yet.
   Disconnecting,
}

/// Binds a session to the adapter and device that carry it.
#[derive(Clone)]
pub struct ConnectionEntry {
   pub adapter_id: AdapterId,
   pub adapter: DeviceAdapterRef,
   pub device: DeviceHandle,
   pub application: ApplicationHandle,
   pub state: ConnectionState,
}

impl core::fmt::Debug for ConnectionEntry {
   fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
      f.debug_struct("ConnectionEntry")
         .field("adapter", &self.adapter_id)
         .field("device", &self.device)
         .field("application", &self.application)
         .field("state", &self.state)
         .finish()
   }
}

/// Why a disconnect could not be started.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectRefusal {
   Unknown,
   InProgress,
}

#[derive(Default)]
struct RegistryInner {
   sessions: HashMap<SessionId, ConnectionEntry>,
   devices: HashMap<DeviceHandle, AdapterId>,
}

pub struct ConnectionRegistry {
   inner: Mutex<RegistryInner>,
   next_session: AtomicU32,
}

impl Default for ConnectionRegistry {
   fn default() -> Self {
      Self::new()
   }
}

impl ConnectionRegistry {
   pub fn new() -> Self {
      Self {
         inner: Mutex::new(RegistryInner::default()),
         next_session: AtomicU32::new(1),
      }
   }

   /// Allocates a fresh session and records it as `Pending`.
   ///
   /// Returns `None` once the id space is exhausted; ids are never
   /// recycled.
   pub fn reserve(
      &self,
      adapter_id: AdapterId,
      adapter: DeviceAdapterRef,
      device: DeviceHandle,
      application: ApplicationHandle,
   ) -> Option<SessionId> {
      let session = self
         .next_session
         .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| next.checked_add(1))
         .map(SessionId)
         .ok()?;
      let entry = ConnectionEntry {
         adapter_id,
         adapter,
         device,
         application,
         state: ConnectionState::Pending,
      };
      let prev = self.inner.lock().sessions.insert(session, entry);
      debug_assert!(prev.is_none(), "session id reused: {session}");
      Some(session)
   }

   /// Marks a pending session as connected.
   ///
   /// Returns `false` if the session is gone or was not issued by
   /// `adapter`; the confirmation is then ignored.
   pub fn confirm(&self, session: SessionId, adapter: AdapterId) -> bool {
      let mut inner = self.inner.lock();
      match inner.sessions.get_mut(&session) {
         Some(entry) if entry.adapter_id == adapter => {
            if entry.state == ConnectionState::Pending {
               entry.state = ConnectionState::Connected;
            }
            true
         },
         _ => false,
      }
   }

   /// Moves a session to `Disconnecting` and returns its entry.
   pub fn begin_disconnect(
      &self,
      session: SessionId,
   ) -> Result<ConnectionEntry, DisconnectRefusal> {
      let mut inner = self.inner.lock();
      let entry = inner
         .sessions
         .get_mut(&session)
         .ok_or(DisconnectRefusal::Unknown)?;
      if entry.state == ConnectionState::Disconnecting {
         return Err(DisconnectRefusal::InProgress);
      }
      entry.state = ConnectionState::Disconnecting;
      Ok(entry.clone())
   }

   /// Removes a session, but only if `adapter` owns it.
   pub fn release(&self, session: SessionId, adapter: AdapterId) -> Option<ConnectionEntry> {
      let mut inner = self.inner.lock();
      if inner
         .sessions
         .get(&session)
         .is_some_and(|e| e.adapter_id == adapter)
      {
         inner.sessions.remove(&session)
      } else {
         None
      }
   }

   pub fn get(&self, session: SessionId) -> Option<ConnectionEntry> {
      self.inner.lock().sessions.get(&session).cloned()
   }

   pub fn sessions(&self) -> Vec<(SessionId, ConnectionState)> {
      let mut sessions: Vec<_> = self
         .inner
         .lock()
         .sessions
         .iter()
         .map(|(s, e)| (*s, e.state))
         .collect();
      sessions.sort_unstable_by_key(|(s, _)| *s);
      sessions
   }

   pub fn len(&self) -> usize {
      self.inner.lock().sessions.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Replaces the set of devices last reported by `adapter`.
   ///
   /// A device reported by several adapters belongs to the most recent
   /// reporter.
   pub fn record_devices(&self, adapter: AdapterId, devices: &[DeviceHandle]) {
      let mut inner = self.inner.lock();
      inner
         .devices
         .retain(|dev, owner| *owner != adapter || devices.contains(dev));
      for dev in devices {
         if let Some(prev) = inner.devices.insert(*dev, adapter)
            && prev != adapter
         {
            debug!("{dev} moved from {prev} to {adapter}");
         }
      }
   }

   pub fn owner_of(&self, device: DeviceHandle) -> Option<AdapterId> {
      self.inner.lock().devices.get(&device).copied()
   }

   pub fn devices(&self) -> Vec<(DeviceHandle, AdapterId)> {
      let mut devices: Vec<_> = self
         .inner
         .lock()
         .devices
         .iter()
         .map(|(d, a)| (*d, *a))
         .collect();
      devices.sort_unstable();
      devices
   }

   /// Drops every session and device owned by `adapter`.
   pub fn remove_adapter(&self, adapter: AdapterId) -> Vec<SessionId> {
      let mut inner = self.inner.lock();
      inner.devices.retain(|_, owner| *owner != adapter);
      let mut removed = Vec::new();
      inner.sessions.retain(|session, entry| {
         if entry.adapter_id == adapter {
            removed.push(*session);
            false
         } else {
            true
         }
      });
      removed.sort_unstable();
      removed
   }

   /// Empties the registry, returning the dropped entries.
   pub fn clear(&self) -> Vec<(SessionId, ConnectionEntry)> {
      let mut inner = self.inner.lock();
      inner.devices.clear();
      inner.sessions.drain().collect()
   }
}
