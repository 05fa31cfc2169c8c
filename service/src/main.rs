//! Transport manager daemon.
//!
//! Starts the transport manager with the in-process loopback adapter,
//! runs a connect/echo self-test against it and keeps serving until
//! interrupted.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{signal, sync::Notify, task, time};

use transportd::{
   ApplicationHandle, Config, DeviceAdapterListener, DeviceHandle, Result, TransportEvent,
   TransportManager, adapter::loopback::LoopbackAdapter,
};

const SELF_TEST_DEVICE: DeviceHandle = DeviceHandle(1);
const SELF_TEST_APP: ApplicationHandle = ApplicationHandle(1);
const SELF_TEST_PAYLOAD: &[u8] = b"transportd self-test";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting transportd...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} adapter section(s)",
      config.adapters.len()
   );

   let manager = Arc::new(TransportManager::new(config));

   // Listener must outlive the manager's weak reference
   let events = EventProcessor::new();
   manager.add_device_adapter_listener(&events);

   let loopback = LoopbackAdapter::new().with_device(SELF_TEST_DEVICE, &[SELF_TEST_APP]);
   match manager.add_device_adapter(Arc::new(loopback)) {
      Ok(id) => info!("Loopback adapter registered as {id}"),
      Err(e) => warn!("Loopback adapter unavailable: {e}"),
   }

   manager.initialize()?;
   let dispatcher = events.clone().spawn_dispatcher(manager.clone());

   let started = manager.search_devices()?;
   info!("transportd running, discovery started on {started} adapter(s)");

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down transportd...");

   dispatcher.abort();
   task::block_in_place(|| manager.shutdown());

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<TransportEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<TransportEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn dispatch(&self, manager: &TransportManager, event: TransportEvent) -> Result<()> {
      match event {
         TransportEvent::SearchDeviceDone { adapter } => {
            for (device, owner) in manager.device_list() {
               if owner != adapter {
                  continue;
               }
               if let Some(app) = manager.application_list(device)?.first() {
                  let session = manager.connect_device_via(adapter, device, *app)?;
                  info!("Self-test: opening {session} to {app} on {device}");
               }
            }
         },
         TransportEvent::DeviceConnectDone { session, .. } => {
            manager.post_message(session, SELF_TEST_PAYLOAD)?;
         },
         TransportEvent::DataReceiveDone { session, data, .. } => {
            if data.as_slice() == SELF_TEST_PAYLOAD {
               info!("Self-test: {session} echoed {} bytes", data.len());
            } else {
               info!("{session} received {} bytes: {}", data.len(), hex::encode(&data));
            }
         },
         TransportEvent::DeviceConnectFailed { error, .. }
         | TransportEvent::DeviceDisconnectFailed { error, .. }
         | TransportEvent::DataReceiveFailed { error, .. }
         | TransportEvent::DataSendFailed { error, .. }
         | TransportEvent::SearchDeviceFailed { error, .. }
         | TransportEvent::CommunicationError { error, .. } => {
            warn!("Transport error: {error}");
         },
         other => debug!("{}: {:?}", other.name(), other.session()),
      }
      Ok(())
   }

   fn spawn_dispatcher(self: Arc<Self>, manager: Arc<TransportManager>) -> task::JoinHandle<()> {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&manager, event) {
               warn!("Error dispatching event: {e}");
            }
         }
      })
   }
}

impl DeviceAdapterListener for EventProcessor {
   fn on_event(&self, event: &TransportEvent) {
      self.queue.push(event.clone());
      self.notifier.notify_waiters();
   }
}
