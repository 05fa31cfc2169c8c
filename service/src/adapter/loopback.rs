//! In-process loopback transport.
//!
//! Devices are declared up front and become visible on `search_devices`.
//! Outbound data is recorded and, unless the `echo` option is disabled,
//! handed straight back as received data. All work runs on the adapter's own
//! I/O thread and is reported through the listener, like a real transport.

use std::{
   collections::{BTreeMap, HashMap},
   sync::Arc,
   thread::{self, JoinHandle},
   time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;

use crate::{
   adapter::{AdapterId, AdapterResult, DeviceAdapter, NotSupported, error::DeviceAdapterError},
   config::AdapterSettings,
   event::ListenerRef,
   types::{
      ApplicationHandle, ApplicationList, DataContainer, DeviceHandle, DeviceList, DeviceType,
      SessionId,
   },
};

pub const LOOPBACK: DeviceType = DeviceType::new_static("loopback");

#[derive(Debug)]
enum Command {
   Search,
   Connect {
      device: DeviceHandle,
      app: ApplicationHandle,
      session: SessionId,
   },
   Disconnect(SessionId),
   Send {
      session: SessionId,
      data: DataContainer,
   },
   Fault(SmolStr),
}

#[derive(Default)]
struct LinkState {
   /// Devices in range, with the applications they expose.
   catalog: RwLock<BTreeMap<DeviceHandle, ApplicationList>>,
   /// Result of the last completed search.
   discovered: RwLock<DeviceList>,
   sessions: Mutex<HashMap<SessionId, DeviceHandle>>,
   sent: Mutex<Vec<(SessionId, DataContainer)>>,
}

struct Binding {
   tx: Sender<Command>,
   worker: JoinHandle<()>,
}

/// Reference adapter that keeps all traffic in-process.
pub struct LoopbackAdapter {
   device_type: DeviceType,
   search_supported: bool,
   connect_supported: bool,
   state: Arc<LinkState>,
   binding: Mutex<Option<Binding>>,
}

impl Default for LoopbackAdapter {
   fn default() -> Self {
      Self::new()
   }
}

impl LoopbackAdapter {
   pub fn new() -> Self {
      Self {
         device_type: LOOPBACK,
         search_supported: true,
         connect_supported: true,
         state: Arc::default(),
         binding: Mutex::new(None),
      }
   }

   #[must_use]
   pub fn with_device(self, device: DeviceHandle, apps: &[ApplicationHandle]) -> Self {
      self.add_device(device, apps);
      self
   }

   #[must_use]
   pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
      self.device_type = device_type;
      self
   }

   #[must_use]
   pub fn without_search(mut self) -> Self {
      self.search_supported = false;
      self
   }

   #[must_use]
   pub fn without_connect(mut self) -> Self {
      self.connect_supported = false;
      self
   }

   /// Brings a device into range. It is reported by the next search.
   pub fn add_device(&self, device: DeviceHandle, apps: &[ApplicationHandle]) {
      self.state.catalog.write().insert(device, apps.to_vec());
   }

   /// Takes a device out of range. Open sessions are not affected.
   pub fn remove_device(&self, device: DeviceHandle) {
      self.state.catalog.write().remove(&device);
   }

   /// Payloads accepted for `session`, in transmission order.
   pub fn sent(&self, session: SessionId) -> Vec<DataContainer> {
      self
         .state
         .sent
         .lock()
         .iter()
         .filter(|(s, _)| *s == session)
         .map(|(_, data)| data.clone())
         .collect()
   }

   /// Every accepted payload, in transmission order.
   pub fn sent_log(&self) -> Vec<(SessionId, DataContainer)> {
      self.state.sent.lock().clone()
   }

   pub fn is_connected(&self, session: SessionId) -> bool {
      self.state.sessions.lock().contains_key(&session)
   }

   /// Simulates a link-level fault not tied to any operation.
   pub fn inject_communication_error(&self, reason: &str) -> AdapterResult {
      self.submit(Command::Fault(SmolStr::new(reason)))
   }

   fn submit(&self, cmd: Command) -> AdapterResult {
      let binding = self.binding.lock();
      let Some(binding) = binding.as_ref() else {
         warn!("{}: adapter used before init", self.device_type);
         return Err(NotSupported);
      };
      binding.tx.send(cmd).map_err(|_| NotSupported)
   }
}

impl DeviceAdapter for LoopbackAdapter {
   fn device_type(&self) -> DeviceType {
      self.device_type.clone()
   }

   fn init(
      &self,
      id: AdapterId,
      listener: ListenerRef,
      settings: &AdapterSettings,
   ) -> AdapterResult {
      let mut binding = self.binding.lock();
      if binding.is_some() {
         warn!("{id}: loopback adapter initialized twice");
         return Err(NotSupported);
      }

      let link = Link {
         id,
         listener,
         state: self.state.clone(),
         echo: settings.option_bool("echo").unwrap_or(true),
         latency: Duration::from_millis(settings.option_u64("latency_ms").unwrap_or(0)),
      };
      let (tx, rx) = channel::unbounded();
      let worker = thread::Builder::new()
         .name(format!("loopback-{}", id.0))
         .spawn(move || link.run(rx))
         .map_err(|e| {
            error!("{id}: failed to start loopback I/O thread: {e}");
            NotSupported
         })?;

      info!("{id}: loopback adapter '{}' ready", self.device_type);
      *binding = Some(Binding { tx, worker });
      Ok(())
   }

   fn is_search_devices_supported(&self) -> bool {
      self.search_supported
   }

   fn search_devices(&self) -> AdapterResult {
      if !self.search_supported {
         return Err(NotSupported);
      }
      self.submit(Command::Search)
   }

   fn is_server_originated_connect_supported(&self) -> bool {
      self.connect_supported
   }

   fn connect(
      &self,
      device: DeviceHandle,
      app: ApplicationHandle,
      session: SessionId,
   ) -> AdapterResult {
      if !self.connect_supported {
         return Err(NotSupported);
      }
      self.submit(Command::Connect {
         device,
         app,
         session,
      })
   }

   fn is_client_originated_connect_supported(&self) -> bool {
      false
   }

   fn disconnect(&self, session: SessionId) {
      if self.submit(Command::Disconnect(session)).is_err() {
         debug!("{}: dropping disconnect for {session}", self.device_type);
      }
   }

   fn send_data(&self, session: SessionId, data: DataContainer) -> AdapterResult {
      self.submit(Command::Send { session, data })
   }

   fn device_list(&self) -> DeviceList {
      self.state.discovered.read().clone()
   }

   fn application_list(&self, device: DeviceHandle) -> ApplicationList {
      if !self.state.discovered.read().contains(&device) {
         return ApplicationList::new();
      }
      self
         .state
         .catalog
         .read()
         .get(&device)
         .cloned()
         .unwrap_or_default()
   }

   fn terminate(&self) {
      let Some(Binding { tx, worker }) = self.binding.lock().take() else {
         return;
      };
      drop(tx);
      if worker.join().is_err() {
         error!("{}: loopback I/O thread panicked", self.device_type);
      }
      self.state.sessions.lock().clear();
   }
}

impl Drop for LoopbackAdapter {
   fn drop(&mut self) {
      self.terminate();
   }
}

/// State owned by the I/O thread.
struct Link {
   id: AdapterId,
   listener: ListenerRef,
   state: Arc<LinkState>,
   echo: bool,
   latency: Duration,
}

impl Link {
   fn run(self, rx: Receiver<Command>) {
      debug!("{}: loopback I/O thread started", self.id);
      for cmd in rx {
         if !self.latency.is_zero() {
            thread::sleep(self.latency);
         }
         self.handle(cmd);
      }
      debug!("{}: loopback I/O thread stopped", self.id);
   }

   fn handle(&self, cmd: Command) {
      let id = self.id;
      match cmd {
         Command::Search => {
            let found: DeviceList = self.state.catalog.read().keys().copied().collect();
            debug!("{id}: search found {} device(s)", found.len());
            *self.state.discovered.write() = found;
            self.listener.on_search_device_done(id);
         },
         Command::Connect {
            device,
            app,
            session,
         } => match self.check_reachable(device, app) {
            Ok(()) => {
               self.state.sessions.lock().insert(session, device);
               self.listener.on_device_connect_done(id, device, session);
            },
            Err(reason) => {
               let err = DeviceAdapterError::connect_device(device, session, reason);
               self.listener.on_device_connect_failed(id, &err);
            },
         },
         Command::Disconnect(session) => {
            let removed = self.state.sessions.lock().remove(&session);
            if let Some(device) = removed {
               self.listener.on_device_disconnect_done(id, device, session);
            } else {
               let err = DeviceAdapterError::disconnect_device(session, "not connected");
               self.listener.on_device_disconnect_failed(id, &err);
            }
         },
         Command::Send { session, data } => {
            let device = self.state.sessions.lock().get(&session).copied();
            let Some(device) = device else {
               let err = DeviceAdapterError::data_send(session, "not connected");
               self.listener.on_data_send_failed(Some(id), &err);
               return;
            };
            debug!("→ {id} {device} {session}: {}", hex::encode(&data));
            self.state.sent.lock().push((session, data.clone()));
            self.listener.on_data_send_done(id, session, &data);
            if self.echo {
               self.listener.on_data_receive_done(id, session, &data);
            }
         },
         Command::Fault(reason) => {
            let err = DeviceAdapterError::communication(None, reason);
            self.listener.on_communication_error(id, &err);
         },
      }
   }

   fn check_reachable(
      &self,
      device: DeviceHandle,
      app: ApplicationHandle,
   ) -> Result<(), &'static str> {
      if !self.state.discovered.read().contains(&device) {
         return Err("device not discovered");
      }
      let catalog = self.state.catalog.read();
      match catalog.get(&device) {
         None => Err("device out of range"),
         Some(apps) if !apps.contains(&app) => Err("application not found on device"),
         Some(_) => Ok(()),
      }
   }
}
