//! Transport manager.
//!
//! The manager owns the connection registry, the outbound queue, the set of
//! registered adapters and two worker threads: the queue worker, which hands
//! messages to adapters, and the event dispatcher, which turns adapter
//! callbacks into registry updates and listener notifications.

use std::{
   collections::BTreeMap,
   mem,
   panic::{self, AssertUnwindSafe},
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU32, Ordering},
   },
   thread::{self, JoinHandle},
};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
   adapter::{AdapterId, DeviceAdapterRef, error::DeviceAdapterError},
   config::Config,
   error::{Result, TransportError},
   event::{DeviceAdapterListener, TransportEvent},
   types::{
      ApplicationHandle, ApplicationList, DataContainer, DeviceHandle, DeviceType, RawMessage,
      SessionId,
   },
};

pub mod dispatch;
pub mod queue;
pub mod registry;

use dispatch::{EventSink, ListenerId, ListenerSet};
use queue::MessageQueue;
use registry::{ConnectionEntry, ConnectionRegistry, ConnectionState, DisconnectRefusal};

/// State shared between the facade and its workers.
pub(crate) struct Shared {
   config: Config,
   adapters: RwLock<BTreeMap<AdapterId, DeviceAdapterRef>>,
   next_adapter: AtomicU32,
   registry: ConnectionRegistry,
   listeners: ListenerSet,
   queue: MessageQueue,
   sink: EventSink,
   running: AtomicBool,
}

impl Shared {
   fn is_running(&self) -> bool {
      self.running.load(Ordering::Acquire)
   }

   fn adapter(&self, id: AdapterId) -> Option<DeviceAdapterRef> {
      self.adapters.read().get(&id).cloned()
   }

   fn registered_id(
      adapters: &BTreeMap<AdapterId, DeviceAdapterRef>,
      adapter: &DeviceAdapterRef,
   ) -> Option<AdapterId> {
      adapters
         .iter()
         .find(|(_, a)| Arc::ptr_eq(a, adapter))
         .map(|(id, _)| *id)
   }

   /// Queues a locally synthesized event for the dispatcher.
   fn report(&self, event: TransportEvent) {
      self.sink.push(event);
   }

   /// Registry side effects of an event. Runs on the dispatch thread only.
   fn apply(&self, event: &TransportEvent) {
      match event {
         TransportEvent::SearchDeviceDone { adapter } => {
            let Some(handle) = self.adapter(*adapter) else {
               debug!("Search result from removed {adapter}, ignoring");
               return;
            };
            let Ok(devices) = panic::catch_unwind(AssertUnwindSafe(|| handle.device_list())) else {
               error!("{adapter} panicked while listing devices, keeping previous directory");
               return;
            };
            info!("{adapter} reports {} device(s)", devices.len());
            self.registry.record_devices(*adapter, &devices);
         },
         TransportEvent::SearchDeviceFailed { adapter, error } => {
            warn!("Search failed on {adapter}: {error}");
         },
         TransportEvent::DeviceConnectDone {
            adapter,
            device,
            session,
         } => {
            if self.registry.confirm(*session, *adapter) {
               info!("{session} connected to {device} via {adapter}");
            } else {
               debug!("Late connect result for {session}, ignoring");
            }
         },
         TransportEvent::DeviceConnectFailed { adapter, error }
         | TransportEvent::DeviceDisconnectFailed { adapter, error } => {
            warn!("{adapter}: {error}");
            if let Some(session) = error.session()
               && self.registry.release(session, *adapter).is_some()
            {
               info!("{session} released");
            }
         },
         TransportEvent::DeviceDisconnectDone {
            adapter, session, ..
         } => {
            if self.registry.release(*session, *adapter).is_some() {
               info!("{session} disconnected");
            }
         },
         TransportEvent::DataReceiveFailed { adapter, error } => {
            warn!("{adapter}: {error}");
         },
         TransportEvent::DataSendFailed { error, .. } => {
            debug!("{error} ({:?})", error.session());
         },
         TransportEvent::CommunicationError { adapter, error } => {
            warn!("Communication error on {adapter}: {error}");
         },
         TransportEvent::DataReceiveDone { .. } | TransportEvent::DataSendDone { .. } => {},
      }
   }
}

enum Workers {
   Idle {
      messages: Receiver<RawMessage>,
      events: Receiver<TransportEvent>,
   },
   Running {
      shutdown: Sender<()>,
      queue: JoinHandle<()>,
      dispatcher: JoinHandle<()>,
   },
   Stopped,
}

/// Facade consumed by the layers above the transport.
///
/// Construct one per process and share it by reference. Background threads
/// start with [`initialize`](Self::initialize) and are joined by
/// [`shutdown`](Self::shutdown), which also runs on drop.
pub struct TransportManager {
   shared: Arc<Shared>,
   workers: Mutex<Workers>,
}

impl TransportManager {
   pub fn new(config: Config) -> Self {
      let (queue, messages) = MessageQueue::new(config.message_queue_capacity);
      let (events_tx, events) = channel::unbounded();
      let shared = Arc::new(Shared {
         config,
         adapters: RwLock::new(BTreeMap::new()),
         next_adapter: AtomicU32::new(1),
         registry: ConnectionRegistry::new(),
         listeners: ListenerSet::default(),
         queue,
         sink: EventSink::new(events_tx),
         running: AtomicBool::new(true),
      });
      Self {
         shared,
         workers: Mutex::new(Workers::Idle { messages, events }),
      }
   }

   /// Starts the queue worker and the event dispatcher.
   pub fn initialize(&self) -> Result<()> {
      let mut workers = self.workers.lock();
      let (messages, events) = match mem::replace(&mut *workers, Workers::Stopped) {
         Workers::Idle { messages, events } => (messages, events),
         running @ Workers::Running { .. } => {
            *workers = running;
            return Err(TransportError::AlreadyRunning);
         },
         Workers::Stopped => return Err(TransportError::ManagerShutdown),
      };

      let (shutdown, shutdown_rx) = channel::bounded::<()>(0);
      let dispatcher = thread::Builder::new().name("tm-events".into()).spawn({
         let shared = self.shared.clone();
         let shutdown_rx = shutdown_rx.clone();
         move || dispatch::run_dispatcher(shared, events, shutdown_rx)
      });
      let dispatcher = match dispatcher {
         Ok(dispatcher) => dispatcher,
         Err(e) => {
            error!("Failed to start event dispatcher: {e}");
            self.shared.running.store(false, Ordering::Release);
            return Err(e.into());
         },
      };
      let queue = thread::Builder::new().name("tm-queue".into()).spawn({
         let shared = self.shared.clone();
         move || queue::run_queue_worker(shared, messages, shutdown_rx)
      });
      let queue = match queue {
         Ok(queue) => queue,
         Err(e) => {
            error!("Failed to start message queue worker: {e}");
            drop(shutdown);
            let _ = dispatcher.join();
            self.shared.running.store(false, Ordering::Release);
            return Err(e.into());
         },
      };

      *workers = Workers::Running {
         shutdown,
         queue,
         dispatcher,
      };
      info!("Transport manager started");
      Ok(())
   }

   fn ensure_running(&self) -> Result<()> {
      if self.shared.is_running() {
         Ok(())
      } else {
         Err(TransportError::ManagerShutdown)
      }
   }

   fn adapter(&self, id: AdapterId) -> Result<DeviceAdapterRef> {
      self
         .shared
         .adapter(id)
         .ok_or(TransportError::AdapterNotFound(id))
   }

   /// Registers a transport and initializes it with the manager's sink.
   ///
   /// An adapter instance is initialized at most once; registering the same
   /// `Arc` again fails with `AdapterAlreadyRegistered`.
   pub fn add_device_adapter(&self, adapter: DeviceAdapterRef) -> Result<AdapterId> {
      self.ensure_running()?;
      if let Some(existing) = Shared::registered_id(&self.shared.adapters.read(), &adapter) {
         return Err(TransportError::AdapterAlreadyRegistered(existing));
      }
      let device_type = adapter.device_type();
      let settings = self.shared.config.adapter_settings(&device_type);
      if !settings.enabled {
         info!("Adapter type {device_type} is disabled, not registering");
         return Err(TransportError::AdapterDisabled(device_type));
      }

      let id = AdapterId(self.shared.next_adapter.fetch_add(1, Ordering::Relaxed));
      let sink = Arc::new(self.shared.sink.clone());
      if adapter.init(id, sink, &settings).is_err() {
         warn!("Adapter {device_type} is not available on this host");
         return Err(TransportError::NotSupported(id));
      }

      let mut adapters = self.shared.adapters.write();
      if !self.shared.is_running() {
         drop(adapters);
         warn!("Manager stopped while {id} was initializing, terminating it");
         adapter.terminate();
         return Err(TransportError::ManagerShutdown);
      }
      if let Some(existing) = Shared::registered_id(&adapters, &adapter) {
         warn!("{device_type} was registered as {existing} concurrently, dropping {id}");
         return Err(TransportError::AdapterAlreadyRegistered(existing));
      }
      adapters.insert(id, adapter);
      drop(adapters);

      info!("Registered {device_type} as {id}");
      Ok(id)
   }

   /// Unregisters a transport. Its sessions and devices are forgotten and
   /// listeners see a disconnect failure for every session it carried.
   pub fn remove_device_adapter(&self, id: AdapterId) -> Result<()> {
      let adapter = self
         .shared
         .adapters
         .write()
         .remove(&id)
         .ok_or(TransportError::AdapterNotFound(id))?;
      adapter.terminate();

      for session in self.shared.registry.remove_adapter(id) {
         self.shared.report(TransportEvent::DeviceDisconnectFailed {
            adapter: id,
            error: DeviceAdapterError::disconnect_device(session, "adapter removed"),
         });
      }
      info!("Removed {id} ({})", adapter.device_type());
      Ok(())
   }

   pub fn adapters(&self) -> Vec<(AdapterId, DeviceType)> {
      self
         .shared
         .adapters
         .read()
         .iter()
         .map(|(id, a)| (*id, a.device_type()))
         .collect()
   }

   /// Registers an upper-layer listener.
   ///
   /// Only a weak reference is kept: the caller must hold on to `listener`
   /// for as long as it wants events.
   pub fn add_device_adapter_listener<L>(&self, listener: &Arc<L>) -> ListenerId
   where
      L: DeviceAdapterListener + 'static,
   {
      let weak: Weak<dyn DeviceAdapterListener> = Arc::downgrade(listener) as _;
      self.shared.listeners.add(weak)
   }

   pub fn remove_device_adapter_listener(&self, id: ListenerId) -> bool {
      self.shared.listeners.remove(id)
   }

   /// Starts discovery on every adapter that supports it.
   ///
   /// Returns the number of adapters that accepted the request; results
   /// arrive through listeners.
   pub fn search_devices(&self) -> Result<usize> {
      self.ensure_running()?;
      let adapters: Vec<_> = self
         .shared
         .adapters
         .read()
         .iter()
         .filter(|(_, a)| a.is_search_devices_supported())
         .map(|(id, a)| (*id, a.clone()))
         .collect();

      let mut started = 0;
      for (id, adapter) in adapters {
         match adapter.search_devices() {
            Ok(()) => started += 1,
            Err(e) => warn!("Search on {id} rejected: {e}"),
         }
      }
      debug!("Search started on {started} adapter(s)");
      Ok(started)
   }

   /// Opens a session to `app` on `device`, routed to the adapter that most
   /// recently reported `device`.
   pub fn connect_device(&self, device: DeviceHandle, app: ApplicationHandle) -> Result<SessionId> {
      let owner = self
         .shared
         .registry
         .owner_of(device)
         .ok_or(TransportError::DeviceNotFound(device))?;
      self.connect_device_via(owner, device, app)
   }

   /// Opens a session through an explicitly chosen adapter.
   ///
   /// The session is registered as pending before the adapter is asked to
   /// connect, so an immediate completion can never race the registration.
   pub fn connect_device_via(
      &self,
      adapter_id: AdapterId,
      device: DeviceHandle,
      app: ApplicationHandle,
   ) -> Result<SessionId> {
      self.ensure_running()?;
      let adapter = self.adapter(adapter_id)?;
      if !adapter.is_server_originated_connect_supported() {
         return Err(TransportError::NotSupported(adapter_id));
      }

      let session = self
         .shared
         .registry
         .reserve(adapter_id, adapter.clone(), device, app)
         .ok_or(TransportError::SessionsExhausted)?;
      if adapter.connect(device, app, session).is_err() {
         self.shared.registry.release(session, adapter_id);
         return Err(TransportError::NotSupported(adapter_id));
      }
      info!("Connecting {app} on {device} via {adapter_id} as {session}");
      Ok(session)
   }

   /// Asks the owning adapter to close `session`.
   ///
   /// The entry stays registered until the adapter reports the outcome.
   pub fn disconnect_device(&self, session: SessionId) -> Result<()> {
      self.ensure_running()?;
      let entry = self
         .shared
         .registry
         .begin_disconnect(session)
         .map_err(|refusal| match refusal {
            DisconnectRefusal::Unknown => TransportError::SessionNotFound(session),
            DisconnectRefusal::InProgress => TransportError::DisconnectInProgress(session),
         })?;
      debug!("Disconnecting {session} via {}", entry.adapter_id);
      entry.adapter.disconnect(session);
      Ok(())
   }

   /// Starts a disconnect for every session not already disconnecting.
   pub fn disconnect_all(&self) -> usize {
      self
         .sessions()
         .into_iter()
         .filter(|(_, state)| *state != ConnectionState::Disconnecting)
         .filter(|(session, _)| self.disconnect_device(*session).is_ok())
         .count()
   }

   /// Queues `payload` for `session` and returns its serial number.
   ///
   /// Never waits for transmission; the outcome is reported through
   /// listeners.
   pub fn post_message(
      &self,
      session: SessionId,
      payload: impl Into<DataContainer>,
   ) -> Result<u64> {
      self.ensure_running()?;
      self.shared.queue.push(session, payload.into())
   }

   pub fn connection(&self, session: SessionId) -> Option<ConnectionEntry> {
      self.shared.registry.get(session)
   }

   pub fn sessions(&self) -> Vec<(SessionId, ConnectionState)> {
      self.shared.registry.sessions()
   }

   /// Devices known from discovery, with their owning adapter.
   pub fn device_list(&self) -> Vec<(DeviceHandle, AdapterId)> {
      self.shared.registry.devices()
   }

   pub fn application_list(&self, device: DeviceHandle) -> Result<ApplicationList> {
      let owner = self
         .shared
         .registry
         .owner_of(device)
         .ok_or(TransportError::DeviceNotFound(device))?;
      Ok(self.adapter(owner)?.application_list(device))
   }

   pub fn pending_messages(&self) -> usize {
      self.shared.queue.len()
   }

   /// Stops both workers, terminates every adapter and clears the registry.
   ///
   /// Queued messages and undispatched events are discarded. Idempotent.
   pub fn shutdown(&self) {
      self.shared.running.store(false, Ordering::Release);
      let workers = mem::replace(&mut *self.workers.lock(), Workers::Stopped);
      match workers {
         Workers::Running {
            shutdown,
            queue,
            dispatcher,
         } => {
            drop(shutdown);
            let current = thread::current().id();
            for worker in [queue, dispatcher] {
               if worker.thread().id() == current {
                  warn!("Shutdown requested from a manager worker, not joining it");
                  continue;
               }
               if worker.join().is_err() {
                  error!("Manager worker panicked");
               }
            }
         },
         Workers::Idle { .. } => {},
         Workers::Stopped => return,
      }

      let adapters = mem::take(&mut *self.shared.adapters.write());
      for (id, adapter) in adapters {
         debug!("Terminating {id}");
         adapter.terminate();
      }
      let dropped = self.shared.registry.clear();
      if !dropped.is_empty() {
         info!("Dropped {} open session(s)", dropped.len());
      }
      info!("Transport manager stopped");
   }
}

impl Drop for TransportManager {
   fn drop(&mut self) {
      self.shutdown();
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use crossbeam::channel::{Receiver, Sender, unbounded};

   use super::*;
   use crate::{
      adapter::{
         AdapterResult, DeviceAdapter, NotSupported, error::ErrorKind, loopback::LoopbackAdapter,
      },
      config::AdapterSettings,
      event::ListenerRef,
      types::DeviceList,
   };

   const TIMEOUT: Duration = Duration::from_secs(5);

   struct Recorder(Sender<TransportEvent>);

   impl DeviceAdapterListener for Recorder {
      fn on_event(&self, event: &TransportEvent) {
         let _ = self.0.send(event.clone());
      }
   }

   struct Harness {
      manager: TransportManager,
      events: Receiver<TransportEvent>,
      _recorder: Arc<Recorder>,
   }

   impl Harness {
      fn new(config: Config) -> Self {
         let manager = TransportManager::new(config);
         let (tx, events) = unbounded();
         let recorder = Arc::new(Recorder(tx));
         manager.add_device_adapter_listener(&recorder);
         manager.initialize().unwrap();
         Self {
            manager,
            events,
            _recorder: recorder,
         }
      }

      fn wait_for(&self, mut pred: impl FnMut(&TransportEvent) -> bool) -> TransportEvent {
         loop {
            let event = self
               .events
               .recv_timeout(TIMEOUT)
               .expect("timed out waiting for event");
            if pred(&event) {
               return event;
            }
         }
      }

      fn search(&self) {
         self.manager.search_devices().unwrap();
         self.wait_for(|e| matches!(e, TransportEvent::SearchDeviceDone { .. }));
      }

      fn connect(&self, device: DeviceHandle, app: ApplicationHandle) -> SessionId {
         let session = self.manager.connect_device(device, app).unwrap();
         self.wait_for(
            |e| matches!(e, TransportEvent::DeviceConnectDone { session: s, .. } if *s == session),
         );
         session
      }
   }

   #[derive(Clone, Copy, PartialEq, Eq)]
   enum SendMode {
      Accept,
      Refuse,
      Panic,
   }

   /// Adapter whose connects and disconnects only complete when the test
   /// says so.
   struct Scripted {
      accept_init: bool,
      send: SendMode,
      panic_on_list: bool,
      on_init: Mutex<Option<Box<dyn FnOnce() + Send>>>,
      listener: Mutex<Option<(AdapterId, ListenerRef)>>,
      sent: Mutex<Vec<SessionId>>,
      terminated: AtomicBool,
   }

   impl Scripted {
      fn new() -> Self {
         Self {
            accept_init: true,
            send: SendMode::Accept,
            panic_on_list: false,
            on_init: Mutex::new(None),
            listener: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
         }
      }

      fn listener(&self) -> (AdapterId, ListenerRef) {
         self.listener.lock().clone().expect("adapter not initialized")
      }

      fn complete_connect(&self, device: DeviceHandle, session: SessionId) {
         let (id, listener) = self.listener();
         listener.on_device_connect_done(id, device, session);
      }
   }

   impl DeviceAdapter for Scripted {
      fn device_type(&self) -> DeviceType {
         DeviceType::new_static("scripted")
      }

      fn init(&self, id: AdapterId, listener: ListenerRef, _: &AdapterSettings) -> AdapterResult {
         if let Some(hook) = self.on_init.lock().take() {
            hook();
         }
         if !self.accept_init {
            return Err(NotSupported);
         }
         *self.listener.lock() = Some((id, listener));
         Ok(())
      }

      fn is_search_devices_supported(&self) -> bool {
         true
      }

      fn search_devices(&self) -> AdapterResult {
         let (id, listener) = self.listener();
         listener.on_search_device_done(id);
         Ok(())
      }

      fn is_server_originated_connect_supported(&self) -> bool {
         true
      }

      fn connect(&self, _: DeviceHandle, _: ApplicationHandle, _: SessionId) -> AdapterResult {
         Ok(())
      }

      fn is_client_originated_connect_supported(&self) -> bool {
         false
      }

      fn disconnect(&self, _: SessionId) {}

      fn send_data(&self, session: SessionId, data: DataContainer) -> AdapterResult {
         match self.send {
            SendMode::Accept => {
               self.sent.lock().push(session);
               let (id, listener) = self.listener();
               listener.on_data_send_done(id, session, &data);
               Ok(())
            },
            SendMode::Refuse => Err(NotSupported),
            SendMode::Panic => panic!("scripted send failure"),
         }
      }

      fn device_list(&self) -> DeviceList {
         if self.panic_on_list {
            panic!("scripted device list failure");
         }
         vec![DeviceHandle(7)]
      }

      fn application_list(&self, _: DeviceHandle) -> ApplicationList {
         vec![ApplicationHandle(1)]
      }

      fn terminate(&self) {
         self.terminated.store(true, Ordering::Release);
      }
   }

   /// Registers `adapter` and opens a connected session on device 7.
   fn scripted_session(h: &Harness, adapter: &Arc<Scripted>) -> (AdapterId, SessionId) {
      let id = h.manager.add_device_adapter(adapter.clone()).unwrap();
      let session = h
         .manager
         .connect_device_via(id, DeviceHandle(7), ApplicationHandle(1))
         .unwrap();
      adapter.complete_connect(DeviceHandle(7), session);
      h.wait_for(
         |e| matches!(e, TransportEvent::DeviceConnectDone { session: s, .. } if *s == session),
      );
      (id, session)
   }

   fn two_device_adapter() -> Arc<LoopbackAdapter> {
      Arc::new(
         LoopbackAdapter::new()
            .with_device(DeviceHandle(1), &[ApplicationHandle(10)])
            .with_device(DeviceHandle(2), &[ApplicationHandle(20), ApplicationHandle(21)]),
      )
   }

   #[test]
   fn test_connect_routes_to_reporting_adapter() {
      let h = Harness::new(Config::default());
      let adapter = two_device_adapter();
      let id = h.manager.add_device_adapter(adapter.clone()).unwrap();
      h.search();

      assert_eq!(
         h.manager.device_list(),
         vec![(DeviceHandle(1), id), (DeviceHandle(2), id)]
      );

      let session = h.connect(DeviceHandle(2), ApplicationHandle(21));
      let sessions = h.manager.sessions();
      assert_eq!(sessions, vec![(session, ConnectionState::Connected)]);

      let entry = h.manager.connection(session).unwrap();
      assert_eq!(entry.adapter_id, id);
      assert_eq!(entry.device, DeviceHandle(2));
      assert!(adapter.is_connected(session));
   }

   #[test]
   fn test_post_without_connection_reports_send_failure() {
      let h = Harness::new(Config::default());
      h.manager.post_message(SessionId(99), b"lost").unwrap();

      let event = h.wait_for(|e| matches!(e, TransportEvent::DataSendFailed { .. }));
      let TransportEvent::DataSendFailed { adapter, error } = event else {
         unreachable!()
      };
      assert_eq!(adapter, None);
      assert_eq!(error.kind(), ErrorKind::DataSend);
      assert_eq!(error.session(), Some(SessionId(99)));

      // the worker is still alive
      h.manager.post_message(SessionId(98), b"again").unwrap();
      h.wait_for(|e| e.session() == Some(SessionId(98)));
   }

   #[test]
   fn test_per_session_order_with_interleaving() {
      let h = Harness::new(Config::default());
      let adapter = two_device_adapter();
      h.manager.add_device_adapter(adapter.clone()).unwrap();
      h.search();
      let s = h.connect(DeviceHandle(1), ApplicationHandle(10));
      let t = h.connect(DeviceHandle(2), ApplicationHandle(20));

      for (session, payload) in [
         (s, &b"A"[..]),
         (t, &b"x"[..]),
         (s, &b"B"[..]),
         (t, &b"y"[..]),
         (t, &b"z"[..]),
         (s, &b"C"[..]),
      ] {
         h.manager.post_message(session, payload).unwrap();
      }

      let mut done = 0;
      h.wait_for(|e| {
         if matches!(e, TransportEvent::DataSendDone { .. }) {
            done += 1;
         }
         done == 6
      });

      let received: Vec<_> = adapter.sent(s).iter().map(|d| d.to_vec()).collect();
      assert_eq!(received, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
      let received: Vec<_> = adapter.sent(t).iter().map(|d| d.to_vec()).collect();
      assert_eq!(received, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
   }

   #[test]
   fn test_communication_error_reaches_all_listeners() {
      let h = Harness::new(Config::default());
      let (tx, second_events) = unbounded();
      let second = Arc::new(Recorder(tx));
      h.manager.add_device_adapter_listener(&second);

      let adapter = two_device_adapter();
      h.manager.add_device_adapter(adapter.clone()).unwrap();
      h.search();
      let session = h.connect(DeviceHandle(1), ApplicationHandle(10));
      let before = h.manager.sessions();

      adapter.inject_communication_error("link dropped").unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::CommunicationError { .. }));
      assert_eq!(event.session(), None);
      loop {
         let event = second_events.recv_timeout(TIMEOUT).unwrap();
         if matches!(event, TransportEvent::CommunicationError { .. }) {
            break;
         }
      }

      assert_eq!(h.manager.sessions(), before);
      assert!(h.manager.connection(session).is_some());
   }

   #[test]
   fn test_no_send_after_disconnect() {
      let h = Harness::new(Config::default());
      let adapter = two_device_adapter();
      h.manager.add_device_adapter(adapter.clone()).unwrap();
      h.search();
      let session = h.connect(DeviceHandle(1), ApplicationHandle(10));

      h.manager.disconnect_device(session).unwrap();
      h.wait_for(|e| matches!(e, TransportEvent::DeviceDisconnectDone { .. }));
      assert!(h.manager.connection(session).is_none());

      h.manager.post_message(session, b"late").unwrap();
      let event = h.wait_for(|e| {
         matches!(
            e,
            TransportEvent::DataSendFailed { .. } | TransportEvent::DataSendDone { .. }
         )
      });
      assert!(matches!(event, TransportEvent::DataSendFailed { adapter: None, .. }));
      assert!(adapter.sent(session).is_empty());
   }

   #[test]
   fn test_second_disconnect_fails_cleanly() {
      let h = Harness::new(Config::default());
      h.manager.add_device_adapter(two_device_adapter()).unwrap();
      h.search();
      let session = h.connect(DeviceHandle(1), ApplicationHandle(10));

      h.manager.disconnect_device(session).unwrap();
      assert!(matches!(
         h.manager.disconnect_device(session),
         Err(TransportError::DisconnectInProgress(_))
      ));
      h.wait_for(|e| matches!(e, TransportEvent::DeviceDisconnectDone { .. }));
      assert!(matches!(
         h.manager.disconnect_device(session),
         Err(TransportError::SessionNotFound(_))
      ));
   }

   #[test]
   fn test_connect_failure_releases_session() {
      let h = Harness::new(Config::default());
      h.manager.add_device_adapter(two_device_adapter()).unwrap();
      h.search();

      let session = h
         .manager
         .connect_device(DeviceHandle(1), ApplicationHandle(77))
         .unwrap();
      h.wait_for(|e| matches!(e, TransportEvent::DeviceConnectFailed { .. }));
      assert!(h.manager.connection(session).is_none());
      assert!(h.manager.sessions().is_empty());
   }

   #[test]
   fn test_connect_unknown_device() {
      let h = Harness::new(Config::default());
      h.manager.add_device_adapter(two_device_adapter()).unwrap();
      assert!(matches!(
         h.manager.connect_device(DeviceHandle(1), ApplicationHandle(10)),
         Err(TransportError::DeviceNotFound(_))
      ));
   }

   #[test]
   fn test_most_recent_reporter_wins() {
      let h = Harness::new(Config::default());
      let first = two_device_adapter();
      let second = Arc::new(
         LoopbackAdapter::new()
            .with_device_type(DeviceType::new("usb"))
            .with_device(DeviceHandle(2), &[ApplicationHandle(20)]),
      );
      let first_id = h.manager.add_device_adapter(first.clone()).unwrap();
      h.search();
      let second_id = h.manager.add_device_adapter(second.clone()).unwrap();

      // only the new adapter searches this time
      second.search_devices().unwrap();
      h.wait_for(
         |e| matches!(e, TransportEvent::SearchDeviceDone { adapter } if *adapter == second_id),
      );
      assert_eq!(
         h.manager.device_list(),
         vec![(DeviceHandle(1), first_id), (DeviceHandle(2), second_id)]
      );

      let session = h.connect(DeviceHandle(2), ApplicationHandle(20));
      assert_eq!(h.manager.connection(session).unwrap().adapter_id, second_id);
      assert!(second.is_connected(session));
      assert!(!first.is_connected(session));

      let explicit = h
         .manager
         .connect_device_via(first_id, DeviceHandle(2), ApplicationHandle(20))
         .unwrap();
      assert_ne!(explicit, session);
   }

   #[test]
   fn test_disabled_adapter_rejected() {
      let config = Config::from_toml_str("[adapters.loopback]\nenabled = false\n").unwrap();
      let h = Harness::new(config);
      assert!(matches!(
         h.manager.add_device_adapter(two_device_adapter()),
         Err(TransportError::AdapterDisabled(_))
      ));
      assert!(h.manager.adapters().is_empty());
   }

   #[test]
   fn test_search_skips_unsupported_adapters() {
      let h = Harness::new(Config::default());
      h.manager
         .add_device_adapter(Arc::new(LoopbackAdapter::new().without_search()))
         .unwrap();
      h.manager.add_device_adapter(two_device_adapter()).unwrap();
      assert_eq!(h.manager.search_devices().unwrap(), 1);
   }

   #[test]
   fn test_remove_adapter_drops_sessions() {
      let h = Harness::new(Config::default());
      let adapter = two_device_adapter();
      let id = h.manager.add_device_adapter(adapter.clone()).unwrap();
      h.search();
      let session = h.connect(DeviceHandle(1), ApplicationHandle(10));

      h.manager.remove_device_adapter(id).unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::DeviceDisconnectFailed { .. }));
      assert_eq!(event.session(), Some(session));
      assert!(h.manager.connection(session).is_none());
      assert!(h.manager.device_list().is_empty());
      assert!(matches!(
         h.manager.remove_device_adapter(id),
         Err(TransportError::AdapterNotFound(_))
      ));
   }

   #[test]
   fn test_disconnect_all() {
      let h = Harness::new(Config::default());
      h.manager.add_device_adapter(two_device_adapter()).unwrap();
      h.search();
      h.connect(DeviceHandle(1), ApplicationHandle(10));
      h.connect(DeviceHandle(2), ApplicationHandle(20));

      assert_eq!(h.manager.disconnect_all(), 2);
      let mut done = 0;
      h.wait_for(|e| {
         if matches!(e, TransportEvent::DeviceDisconnectDone { .. }) {
            done += 1;
         }
         done == 2
      });
      assert!(h.manager.sessions().is_empty());
   }

   #[test]
   fn test_received_data_is_shared() {
      let h = Harness::new(Config::default());
      h.manager.add_device_adapter(two_device_adapter()).unwrap();
      h.search();
      let session = h.connect(DeviceHandle(1), ApplicationHandle(10));
      assert_eq!(
         h.manager.application_list(DeviceHandle(2)).unwrap(),
         vec![ApplicationHandle(20), ApplicationHandle(21)]
      );

      h.manager.post_message(session, b"hello").unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::DataReceiveDone { .. }));
      let TransportEvent::DataReceiveDone { data, .. } = event else {
         unreachable!()
      };
      assert_eq!(data.as_slice(), b"hello");
   }

   #[test]
   fn test_shutdown_is_idempotent_and_final() {
      let h = Harness::new(Config::default());
      let adapter = two_device_adapter();
      h.manager.add_device_adapter(adapter.clone()).unwrap();
      h.search();
      h.connect(DeviceHandle(1), ApplicationHandle(10));

      h.manager.shutdown();
      h.manager.shutdown();
      assert!(h.manager.sessions().is_empty());
      assert!(h.manager.adapters().is_empty());
      assert!(matches!(
         h.manager.post_message(SessionId(1), b"x"),
         Err(TransportError::ManagerShutdown)
      ));
      assert!(matches!(
         h.manager.initialize(),
         Err(TransportError::ManagerShutdown)
      ));
      // adapter was terminated
      assert_eq!(adapter.search_devices(), Err(NotSupported));
   }

   #[test]
   fn test_initialize_twice() {
      let h = Harness::new(Config::default());
      assert!(matches!(
         h.manager.initialize(),
         Err(TransportError::AlreadyRunning)
      ));
   }

   #[test]
   fn test_messages_posted_before_initialize_are_processed() {
      let manager = TransportManager::new(Config::default());
      let (tx, events) = unbounded();
      let recorder = Arc::new(Recorder(tx));
      manager.add_device_adapter_listener(&recorder);

      manager.post_message(SessionId(5), b"early").unwrap();
      assert_eq!(manager.pending_messages(), 1);
      manager.initialize().unwrap();

      let event = events.recv_timeout(TIMEOUT).unwrap();
      assert!(matches!(event, TransportEvent::DataSendFailed { .. }));
   }

   #[test]
   fn test_panicking_send_is_reported_and_worker_survives() {
      let h = Harness::new(Config::default());
      let adapter = Arc::new(Scripted {
         send: SendMode::Panic,
         ..Scripted::new()
      });
      let (id, session) = scripted_session(&h, &adapter);

      h.manager.post_message(session, b"boom").unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::DataSendFailed { .. }));
      assert!(matches!(event, TransportEvent::DataSendFailed { adapter: Some(a), .. } if a == id));

      h.manager.post_message(SessionId(999), b"after").unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::DataSendFailed { .. }));
      assert_eq!(event.session(), Some(SessionId(999)));
   }

   #[test]
   fn test_panicking_device_list_keeps_dispatcher_alive() {
      let h = Harness::new(Config::default());
      let adapter = Arc::new(Scripted {
         panic_on_list: true,
         ..Scripted::new()
      });
      h.manager.add_device_adapter(adapter).unwrap();
      h.search();
      assert!(h.manager.device_list().is_empty());

      h.manager.post_message(SessionId(5), b"still alive").unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::DataSendFailed { .. }));
      assert_eq!(event.session(), Some(SessionId(5)));
   }

   #[test]
   fn test_refused_send_reports_adapter_failure() {
      let h = Harness::new(Config::default());
      let adapter = Arc::new(Scripted {
         send: SendMode::Refuse,
         ..Scripted::new()
      });
      let (id, session) = scripted_session(&h, &adapter);

      h.manager.post_message(session, b"nope").unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::DataSendFailed { .. }));
      let TransportEvent::DataSendFailed { adapter, error } = event else {
         unreachable!()
      };
      assert_eq!(adapter, Some(id));
      assert_eq!(error.kind(), ErrorKind::DataSend);
      assert_eq!(error.session(), Some(session));
      assert_eq!(error.device(), Some(DeviceHandle(7)));
   }

   #[test]
   fn test_pending_and_disconnecting_sessions_do_not_route() {
      let h = Harness::new(Config::default());
      let adapter = Arc::new(Scripted::new());
      let id = h.manager.add_device_adapter(adapter.clone()).unwrap();

      let session = h
         .manager
         .connect_device_via(id, DeviceHandle(7), ApplicationHandle(1))
         .unwrap();
      assert_eq!(h.manager.sessions(), vec![(session, ConnectionState::Pending)]);
      h.manager.post_message(session, b"early").unwrap();
      let event = h.wait_for(|e| matches!(e, TransportEvent::DataSendFailed { .. }));
      assert!(matches!(event, TransportEvent::DataSendFailed { adapter: None, .. }));

      adapter.complete_connect(DeviceHandle(7), session);
      h.wait_for(|e| matches!(e, TransportEvent::DeviceConnectDone { .. }));
      h.manager.post_message(session, b"routed").unwrap();
      h.wait_for(|e| matches!(e, TransportEvent::DataSendDone { .. }));

      h.manager.disconnect_device(session).unwrap();
      assert_eq!(
         h.manager.sessions(),
         vec![(session, ConnectionState::Disconnecting)]
      );
      h.manager.post_message(session, b"late").unwrap();
      let event = h.wait_for(|e| {
         matches!(
            e,
            TransportEvent::DataSendFailed { .. } | TransportEvent::DataSendDone { .. }
         )
      });
      assert!(matches!(event, TransportEvent::DataSendFailed { adapter: None, .. }));
      assert_eq!(*adapter.sent.lock(), vec![session]);
   }

   #[test]
   fn test_adapter_rejecting_init_is_not_registered() {
      let h = Harness::new(Config::default());
      let adapter = Arc::new(Scripted {
         accept_init: false,
         ..Scripted::new()
      });
      assert!(matches!(
         h.manager.add_device_adapter(adapter),
         Err(TransportError::NotSupported(_))
      ));
      assert!(h.manager.adapters().is_empty());
   }

   #[test]
   fn test_same_adapter_registered_once() {
      let h = Harness::new(Config::default());
      let adapter = two_device_adapter();
      let id = h.manager.add_device_adapter(adapter.clone()).unwrap();
      assert!(matches!(
         h.manager.add_device_adapter(adapter),
         Err(TransportError::AdapterAlreadyRegistered(existing)) if existing == id
      ));
      assert_eq!(h.manager.adapters().len(), 1);
   }

   #[test]
   fn test_shutdown_during_adapter_init_terminates_it() {
      let manager = Arc::new(TransportManager::new(Config::default()));
      manager.initialize().unwrap();

      let adapter = Arc::new(Scripted::new());
      let weak = Arc::downgrade(&manager);
      *adapter.on_init.lock() = Some(Box::new(move || {
         if let Some(manager) = weak.upgrade() {
            manager.shutdown();
         }
      }));

      assert!(matches!(
         manager.add_device_adapter(adapter.clone()),
         Err(TransportError::ManagerShutdown)
      ));
      assert!(adapter.terminated.load(Ordering::Acquire));
      assert!(manager.adapters().is_empty());
   }

   #[test]
   fn test_small_event_batches_keep_order() {
      let config = Config {
         event_batch_limit: 1,
         ..Config::default()
      };
      let h = Harness::new(config);
      h.manager.add_device_adapter(two_device_adapter()).unwrap();
      h.search();
      let session = h.connect(DeviceHandle(1), ApplicationHandle(10));

      for i in 0..20u8 {
         h.manager.post_message(session, [i].as_slice()).unwrap();
      }
      let mut received = Vec::new();
      h.wait_for(|e| {
         if let TransportEvent::DataReceiveDone { data, .. } = e {
            received.push(data[0]);
         }
         received.len() == 20
      });
      assert_eq!(received, (0..20).collect::<Vec<u8>>());
   }
}
