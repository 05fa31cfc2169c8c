//! Event dispatch thread.
//!
//! Adapters never call upper-layer listeners directly. They call the
//! [`EventSink`] they were initialized with, which only enqueues a
//! [`TransportEvent`]. The dispatch thread drains the queue in batches,
//! applies registry effects, and then fans each event out to every live
//! listener with no lock held.

use std::{
   panic::{self, AssertUnwindSafe},
   sync::{
      Arc, Weak,
      atomic::{AtomicU32, Ordering},
   },
};

use crossbeam::{
   channel::{Receiver, Sender},
   select,
};
use log::{debug, error, info};
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::{
   adapter::{AdapterId, error::DeviceAdapterError},
   event::{DeviceAdapterListener, ListenerRef, TransportEvent},
   manager::Shared,
   types::{DataContainer, DeviceHandle, SessionId},
};

type EventBatch = SmallVec<[TransportEvent; 16]>;

/// The manager's side of the listener contract, handed to every adapter.
///
/// Calls never block: each one turns into a descriptor on an unbounded
/// channel.
#[derive(Clone)]
pub struct EventSink {
   tx: Sender<TransportEvent>,
}

impl EventSink {
   pub(crate) fn new(tx: Sender<TransportEvent>) -> Self {
      Self { tx }
   }

   pub(crate) fn push(&self, event: TransportEvent) {
      if let Err(e) = self.tx.send(event) {
         debug!("Dispatcher stopped, dropping {}", e.0.name());
      }
   }
}

impl DeviceAdapterListener for EventSink {
   fn on_search_device_done(&self, adapter: AdapterId) {
      self.push(TransportEvent::SearchDeviceDone { adapter });
   }

   fn on_search_device_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {
      self.push(TransportEvent::SearchDeviceFailed {
         adapter,
         error: error.clone(),
      });
   }

   fn on_device_connect_done(&self, adapter: AdapterId, device: DeviceHandle, session: SessionId) {
      self.push(TransportEvent::DeviceConnectDone {
         adapter,
         device,
         session,
      });
   }

   fn on_device_connect_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {
      self.push(TransportEvent::DeviceConnectFailed {
         adapter,
         error: error.clone(),
      });
   }

   fn on_device_disconnect_done(
      &self,
      adapter: AdapterId,
      device: DeviceHandle,
      session: SessionId,
   ) {
      self.push(TransportEvent::DeviceDisconnectDone {
         adapter,
         device,
         session,
      });
   }

   fn on_device_disconnect_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {
      self.push(TransportEvent::DeviceDisconnectFailed {
         adapter,
         error: error.clone(),
      });
   }

   fn on_data_receive_done(&self, adapter: AdapterId, session: SessionId, data: &DataContainer) {
      self.push(TransportEvent::DataReceiveDone {
         adapter,
         session,
         data: data.clone(),
      });
   }

   fn on_data_receive_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {
      self.push(TransportEvent::DataReceiveFailed {
         adapter,
         error: error.clone(),
      });
   }

   fn on_data_send_done(&self, adapter: AdapterId, session: SessionId, data: &DataContainer) {
      self.push(TransportEvent::DataSendDone {
         adapter,
         session,
         data: data.clone(),
      });
   }

   fn on_data_send_failed(&self, adapter: Option<AdapterId>, error: &DeviceAdapterError) {
      self.push(TransportEvent::DataSendFailed {
         adapter,
         error: error.clone(),
      });
   }

   fn on_communication_error(&self, adapter: AdapterId, error: &DeviceAdapterError) {
      self.push(TransportEvent::CommunicationError {
         adapter,
         error: error.clone(),
      });
   }

   fn on_event(&self, event: &TransportEvent) {
      self.push(event.clone());
   }
}

/// Handle returned when registering an upper-layer listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u32);

/// Upper-layer listeners, held weakly.
///
/// A listener whose last strong reference is dropped simply stops
/// receiving events and is pruned on the next broadcast.
#[derive(Default)]
pub struct ListenerSet {
   next_id: AtomicU32,
   listeners: RwLock<Vec<(ListenerId, Weak<dyn DeviceAdapterListener>)>>,
}

impl ListenerSet {
   pub fn add(&self, listener: Weak<dyn DeviceAdapterListener>) -> ListenerId {
      let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
      self.listeners.write().push((id, listener));
      id
   }

   pub fn remove(&self, id: ListenerId) -> bool {
      let mut listeners = self.listeners.write();
      let before = listeners.len();
      listeners.retain(|(lid, _)| *lid != id);
      listeners.len() != before
   }

   pub fn len(&self) -> usize {
      self.listeners.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   fn snapshot(&self) -> SmallVec<[ListenerRef; 4]> {
      let live: SmallVec<[ListenerRef; 4]> = self
         .listeners
         .read()
         .iter()
         .filter_map(|(_, l)| l.upgrade())
         .collect();
      if live.len() != self.len() {
         self.listeners.write().retain(|(_, l)| l.strong_count() > 0);
      }
      live
   }

   /// Delivers `event` to every live listener. A panicking listener is
   /// logged and skipped.
   pub fn broadcast(&self, event: &TransportEvent) {
      for listener in self.snapshot() {
         let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
         if delivered.is_err() {
            error!("Listener panicked while handling {}", event.name());
         }
      }
   }
}

pub(crate) fn run_dispatcher(
   shared: Arc<Shared>,
   events: Receiver<TransportEvent>,
   shutdown: Receiver<()>,
) {
   info!("Event dispatcher starting up");
   let limit = shared.config.event_batch_limit.max(1);
   let mut batch = EventBatch::new();

   loop {
      select! {
         recv(events) -> event => match event {
            Ok(event) => batch.push(event),
            Err(_) => break,
         },
         recv(shutdown) -> _ => break,
      }
      batch.extend(events.try_iter().take(limit - 1));

      for event in batch.drain(..) {
         debug!("Dispatching {} (session: {:?})", event.name(), event.session());
         shared.apply(&event);
         shared.listeners.broadcast(&event);
      }
   }

   let dropped = events.try_iter().count();
   if dropped > 0 {
      debug!("Event dispatcher discarded {dropped} pending event(s)");
   }
   info!("Event dispatcher shutting down");
}
