//! Test harness for DMS core functionality.
//!
//! Helpers shared by unit tests, integration tests and the demo binary:
//! listeners that forward outcomes to a channel, a launcher that records
//! what it was asked to start, and a simulated device on a
//! [`LoopbackNetwork`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dms_transport::LoopbackNetwork;

use crate::ability::AbilityLauncher;
use crate::config::DmsConfig;
use crate::errors::{DmsError, DmsResult};
use crate::registry::{BundleInfo, InMemoryRegistry, RegistryEndpoints};
use crate::service::DmsService;
use crate::session::CompletionListener;

/// Completion listener that forwards every outcome to a channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<DmsResult<()>>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DmsResult<()>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl CompletionListener for ChannelListener {
    fn on_complete(&self, result: DmsResult<()>) {
        let _ = self.tx.send(result);
    }
}

/// Launcher that records requests, optionally refusing them.
#[derive(Default)]
pub struct RecordingLauncher {
    started: Mutex<Vec<(String, String)>>,
    refuse: AtomicBool,
}

impl RecordingLauncher {
    /// `(bundle, ability)` pairs started so far.
    pub fn started(&self) -> Vec<(String, String)> {
        self.started.lock().clone()
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl AbilityLauncher for RecordingLauncher {
    fn start_ability_from_remote(&self, bundle_name: &str, ability_name: &str) -> DmsResult<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DmsError::failure("launcher refused"));
        }
        self.started
            .lock()
            .push((bundle_name.to_string(), ability_name.to_string()));
        Ok(())
    }
}

/// Install a signed bundle into `registry`.
pub fn install_app(registry: &InMemoryRegistry, bundle_name: &str, uid: u32, signature: &str) {
    registry.install(BundleInfo::new(bundle_name, uid, signature));
}

/// One simulated device: a DMS endpoint attached to a loopback network.
pub struct TestDevice {
    pub device_id: String,
    pub registry: Arc<InMemoryRegistry>,
    pub launcher: Arc<RecordingLauncher>,
    pub service: DmsService,
    task: JoinHandle<()>,
}

impl TestDevice {
    /// Attach a device to `network` and start its dispatcher. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        network: &Arc<LoopbackNetwork>,
        device_id: &str,
        config: DmsConfig,
    ) -> DmsResult<Self> {
        let registry = Arc::new(InMemoryRegistry::new());
        let launcher = Arc::new(RecordingLauncher::default());
        let transport = Arc::new(network.attach(device_id));
        let (service, task) = DmsService::spawn(
            config,
            transport,
            RegistryEndpoints::shared(registry.clone()),
            launcher.clone(),
        )?;
        Ok(Self {
            device_id: device_id.to_string(),
            registry,
            launcher,
            service,
            task,
        })
    }

    /// Stop the endpoint and wait for its dispatcher to exit.
    pub async fn stop(self) -> DmsResult<()> {
        self.service.shutdown()?;
        self.task
            .await
            .map_err(|e| DmsError::failure(format!("dispatcher task failed: {e}")))
    }
}
