//! Transport events and the listener contract.
//!
//! Adapters report every asynchronous outcome through
//! [`DeviceAdapterListener`], from their own threads. The manager hands each
//! adapter a sink that turns those calls into [`TransportEvent`] descriptors
//! and re-broadcasts them to upper-layer listeners from its dispatch thread.

use std::sync::Arc;

use crate::{
   adapter::{AdapterId, error::DeviceAdapterError},
   types::{DataContainer, DeviceHandle, SessionId},
};

/// Descriptor of one adapter-originated event.
#[derive(Debug, Clone, strum::IntoStaticStr)]
pub enum TransportEvent {
   SearchDeviceDone {
      adapter: AdapterId,
   },
   SearchDeviceFailed {
      adapter: AdapterId,
      error: DeviceAdapterError,
   },
   DeviceConnectDone {
      adapter: AdapterId,
      device: DeviceHandle,
      session: SessionId,
   },
   DeviceConnectFailed {
      adapter: AdapterId,
      error: DeviceAdapterError,
   },
   DeviceDisconnectDone {
      adapter: AdapterId,
      device: DeviceHandle,
      session: SessionId,
   },
   DeviceDisconnectFailed {
      adapter: AdapterId,
      error: DeviceAdapterError,
   },
   DataReceiveDone {
      adapter: AdapterId,
      session: SessionId,
      data: DataContainer,
   },
   DataReceiveFailed {
      adapter: AdapterId,
      error: DeviceAdapterError,
   },
   DataSendDone {
      adapter: AdapterId,
      session: SessionId,
      data: DataContainer,
   },
   /// `adapter` is `None` when the message never reached an adapter.
   DataSendFailed {
      adapter: Option<AdapterId>,
      error: DeviceAdapterError,
   },
   CommunicationError {
      adapter: AdapterId,
      error: DeviceAdapterError,
   },
}

impl TransportEvent {
   pub fn name(&self) -> &'static str {
      self.into()
   }

   pub const fn adapter(&self) -> Option<AdapterId> {
      match self {
         Self::SearchDeviceDone { adapter }
         | Self::SearchDeviceFailed { adapter, .. }
         | Self::DeviceConnectDone { adapter, .. }
         | Self::DeviceConnectFailed { adapter, .. }
         | Self::DeviceDisconnectDone { adapter, .. }
         | Self::DeviceDisconnectFailed { adapter, .. }
         | Self::DataReceiveDone { adapter, .. }
         | Self::DataReceiveFailed { adapter, .. }
         | Self::DataSendDone { adapter, .. }
         | Self::CommunicationError { adapter, .. } => Some(*adapter),
         Self::DataSendFailed { adapter, .. } => *adapter,
      }
   }

   /// Session the event refers to, if any.
   pub fn session(&self) -> Option<SessionId> {
      match self {
         Self::DeviceConnectDone { session, .. }
         | Self::DeviceDisconnectDone { session, .. }
         | Self::DataReceiveDone { session, .. }
         | Self::DataSendDone { session, .. } => Some(*session),
         Self::SearchDeviceFailed { error, .. }
         | Self::DeviceConnectFailed { error, .. }
         | Self::DeviceDisconnectFailed { error, .. }
         | Self::DataReceiveFailed { error, .. }
         | Self::DataSendFailed { error, .. }
         | Self::CommunicationError { error, .. } => error.session(),
         Self::SearchDeviceDone { .. } => None,
      }
   }

   /// Routes the descriptor to the matching typed listener method.
   pub fn deliver<L: DeviceAdapterListener + ?Sized>(&self, listener: &L) {
      match self {
         Self::SearchDeviceDone { adapter } => listener.on_search_device_done(*adapter),
         Self::SearchDeviceFailed { adapter, error } => {
            listener.on_search_device_failed(*adapter, error);
         },
         Self::DeviceConnectDone {
            adapter,
            device,
            session,
         } => listener.on_device_connect_done(*adapter, *device, *session),
         Self::DeviceConnectFailed { adapter, error } => {
            listener.on_device_connect_failed(*adapter, error);
         },
         Self::DeviceDisconnectDone {
            adapter,
            device,
            session,
         } => listener.on_device_disconnect_done(*adapter, *device, *session),
         Self::DeviceDisconnectFailed { adapter, error } => {
            listener.on_device_disconnect_failed(*adapter, error);
         },
         Self::DataReceiveDone {
            adapter,
            session,
            data,
         } => listener.on_data_receive_done(*adapter, *session, data),
         Self::DataReceiveFailed { adapter, error } => {
            listener.on_data_receive_failed(*adapter, error);
         },
         Self::DataSendDone {
            adapter,
            session,
            data,
         } => listener.on_data_send_done(*adapter, *session, data),
         Self::DataSendFailed { adapter, error } => listener.on_data_send_failed(*adapter, error),
         Self::CommunicationError { adapter, error } => {
            listener.on_communication_error(*adapter, error);
         },
      }
   }
}

/// Callback contract for transport events.
///
/// Adapters call these methods from their own execution context; upper
/// layers receive them from the manager's dispatch thread. Every method
/// defaults to a no-op so observers only implement what they need.
/// Implementations must not block.
#[allow(unused_variables)]
pub trait DeviceAdapterListener: Send + Sync {
   fn on_search_device_done(&self, adapter: AdapterId) {}
   fn on_search_device_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {}

   fn on_device_connect_done(&self, adapter: AdapterId, device: DeviceHandle, session: SessionId) {
   }
   fn on_device_connect_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {}

   fn on_device_disconnect_done(
      &self,
      adapter: AdapterId,
      device: DeviceHandle,
      session: SessionId,
   ) {
   }
   fn on_device_disconnect_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {}

   fn on_data_receive_done(&self, adapter: AdapterId, session: SessionId, data: &DataContainer) {}
   fn on_data_receive_failed(&self, adapter: AdapterId, error: &DeviceAdapterError) {}

   fn on_data_send_done(&self, adapter: AdapterId, session: SessionId, data: &DataContainer) {}
   fn on_data_send_failed(&self, adapter: Option<AdapterId>, error: &DeviceAdapterError) {}

   fn on_communication_error(&self, adapter: AdapterId, error: &DeviceAdapterError) {}

   /// Receives the whole descriptor. The default routes to the typed
   /// methods above.
   fn on_event(&self, event: &TransportEvent) {
      event.deliver(self);
   }
}

/// Type alias for a shared listener handle.
pub type ListenerRef = Arc<dyn DeviceAdapterListener>;

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;

   #[derive(Default)]
   struct Counting {
      connects: Mutex<Vec<SessionId>>,
      comm_errors: Mutex<u32>,
   }

   impl DeviceAdapterListener for Counting {
      fn on_device_connect_done(&self, _: AdapterId, _: DeviceHandle, session: SessionId) {
         self.connects.lock().push(session);
      }

      fn on_communication_error(&self, _: AdapterId, _: &DeviceAdapterError) {
         *self.comm_errors.lock() += 1;
      }
   }

   #[test]
   fn test_default_on_event_routes_to_typed_methods() {
      let listener = Counting::default();
      listener.on_event(&TransportEvent::DeviceConnectDone {
         adapter: AdapterId(1),
         device: DeviceHandle(4),
         session: SessionId(11),
      });
      listener.on_event(&TransportEvent::CommunicationError {
         adapter: AdapterId(1),
         error: DeviceAdapterError::communication(None, "reset"),
      });
      // not overridden, must be a silent no-op
      listener.on_event(&TransportEvent::SearchDeviceDone {
         adapter: AdapterId(1),
      });

      assert_eq!(*listener.connects.lock(), vec![SessionId(11)]);
      assert_eq!(*listener.comm_errors.lock(), 1);
   }

   #[test]
   fn test_event_context() {
      let event = TransportEvent::DataSendFailed {
         adapter: None,
         error: DeviceAdapterError::data_send(SessionId(3), "no connection"),
      };
      assert_eq!(event.session(), Some(SessionId(3)));
      assert_eq!(event.adapter(), None);
      assert_eq!(event.name(), "DataSendFailed");
   }
}
