//! Outbound message queue and its worker.

use std::{
   panic::{self, AssertUnwindSafe},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use crossbeam::{
   channel::{self, Receiver, Sender, TrySendError},
   select,
};
use log::{debug, error, info, warn};

use crate::{
   adapter::error::DeviceAdapterError,
   error::{Result, TransportError},
   event::TransportEvent,
   manager::{Shared, registry::ConnectionState},
   types::{DataContainer, RawMessage, SessionId},
};

/// Producer side of the outbound queue.
///
/// `push` never waits for transmission. A single worker drains the queue in
/// enqueue order, which keeps messages of one session in FIFO order.
pub struct MessageQueue {
   tx: Sender<RawMessage>,
   serial: AtomicU64,
}

impl MessageQueue {
   /// Creates the queue; `capacity == 0` means unbounded.
   pub fn new(capacity: usize) -> (Self, Receiver<RawMessage>) {
      let (tx, rx) = if capacity == 0 {
         channel::unbounded()
      } else {
         channel::bounded(capacity)
      };
      (
         Self {
            tx,
            serial: AtomicU64::new(0),
         },
         rx,
      )
   }

   pub fn push(&self, session: SessionId, payload: DataContainer) -> Result<u64> {
      let serial = self.serial.fetch_add(1, Ordering::Relaxed);
      let message = RawMessage {
         session,
         payload,
         serial,
      };
      match self.tx.try_send(message) {
         Ok(()) => Ok(serial),
         Err(TrySendError::Full(_)) => Err(TransportError::QueueFull),
         Err(TrySendError::Disconnected(_)) => Err(TransportError::ManagerShutdown),
      }
   }

   pub fn len(&self) -> usize {
      self.tx.len()
   }

   pub fn is_empty(&self) -> bool {
      self.tx.is_empty()
   }
}

pub(crate) fn run_queue_worker(
   shared: Arc<Shared>,
   messages: Receiver<RawMessage>,
   shutdown: Receiver<()>,
) {
   info!("Message queue worker starting up");
   loop {
      select! {
         recv(messages) -> message => match message {
            Ok(message) if shared.is_running() => deliver(&shared, message),
            Ok(_) | Err(_) => break,
         },
         recv(shutdown) -> _ => break,
      }
   }

   let discarded = messages.try_iter().count();
   if discarded > 0 {
      warn!("Discarding {discarded} undelivered message(s)");
   }
   info!("Message queue worker shutting down");
}

/// Hands one message to the adapter that owns its session.
///
/// A session that does not resolve to a connected entry is an expected race,
/// reported to listeners as a send failure.
fn deliver(shared: &Shared, message: RawMessage) {
   let RawMessage {
      session,
      payload,
      serial,
   } = message;

   let entry = shared.registry.get(session);
   let Some(entry) = entry.filter(|e| e.state == ConnectionState::Connected) else {
      debug!("Message #{serial} for {session} has no connection, dropping");
      shared.report(TransportEvent::DataSendFailed {
         adapter: None,
         error: DeviceAdapterError::data_send(session, "no connection"),
      });
      return;
   };

   debug!(
      "Message #{serial} → {} {session} ({} bytes)",
      entry.adapter_id,
      payload.len()
   );
   let sent = panic::catch_unwind(AssertUnwindSafe(|| entry.adapter.send_data(session, payload)));
   let reason = match sent {
      Ok(Ok(())) => return,
      Ok(Err(_)) => {
         warn!("{} refused data for {session}", entry.adapter_id);
         "send not supported"
      },
      Err(_) => {
         error!("{} panicked while sending data for {session}", entry.adapter_id);
         "adapter panicked"
      },
   };
   shared.report(TransportEvent::DataSendFailed {
      adapter: Some(entry.adapter_id),
      error: DeviceAdapterError::data_send(session, reason).with_device(entry.device),
   });
}
