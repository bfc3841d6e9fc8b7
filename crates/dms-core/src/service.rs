//! Assembly of one DMS endpoint.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use dms_transport::SessionTransport;

use crate::ability::{AbilityLauncher, AbilityManager, Want};
use crate::config::DmsConfig;
use crate::dispatch::{self, DispatchHandle, DispatchStatsSnapshot, Dispatcher};
use crate::errors::{DmsError, DmsResult};
use crate::permission::{CallerInfo, PermissionVerifier};
use crate::registry::RegistryEndpoints;
use crate::session::{CompletionListener, SessionManager};

/// A running endpoint: session manager, verifier and dispatch queue wired to
/// one transport.
pub struct DmsService {
    config: DmsConfig,
    session: Arc<SessionManager>,
    verifier: Arc<PermissionVerifier>,
    abilities: AbilityManager,
    handle: DispatchHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl DmsService {
    /// Wire the endpoint and register its session server. The returned
    /// [`Dispatcher`] must be driven by the caller.
    pub fn build(
        config: DmsConfig,
        transport: Arc<dyn SessionTransport>,
        endpoints: RegistryEndpoints,
        launcher: Arc<dyn AbilityLauncher>,
    ) -> DmsResult<(Self, Dispatcher)> {
        config
            .validate()
            .map_err(|e| DmsError::invalid(e.to_string()))?;

        let (handle, rx) = dispatch::channel(config.dispatch.queue_depth);
        let session = Arc::new(SessionManager::new(
            transport,
            handle.clone(),
            config.session.clone(),
        ));
        session.initialize()?;

        let verifier = Arc::new(PermissionVerifier::new(&config.permission, endpoints));
        let dispatcher = Dispatcher::new(
            rx,
            &handle,
            Arc::clone(&session),
            Arc::clone(&verifier),
            launcher,
        );
        let (shutdown_tx, _) = watch::channel(false);

        let service = Self {
            config,
            session,
            verifier,
            abilities: AbilityManager::new(handle.clone()),
            handle,
            shutdown_tx,
        };
        Ok((service, dispatcher))
    }

    /// Build the endpoint and run its dispatcher on the current tokio runtime.
    pub fn spawn(
        config: DmsConfig,
        transport: Arc<dyn SessionTransport>,
        endpoints: RegistryEndpoints,
        launcher: Arc<dyn AbilityLauncher>,
    ) -> DmsResult<(Self, JoinHandle<()>)> {
        let (service, dispatcher) = Self::build(config, transport, endpoints, launcher)?;
        let task = tokio::spawn(dispatcher.run(service.shutdown_tx.subscribe()));
        info!(
            access_mode = ?service.config.permission.access_mode,
            "dms service started"
        );
        Ok((service, task))
    }

    /// Stop the dispatcher and remove the session server.
    pub fn shutdown(&self) -> DmsResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.session.shutdown()?;
        info!("dms service stopped");
        Ok(())
    }

    /// Receiver that turns `true` when [`DmsService::shutdown`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn start_remote_ability(
        &self,
        want: Want,
        caller: CallerInfo,
        listener: Arc<dyn CompletionListener>,
    ) -> DmsResult<()> {
        self.abilities.start_remote_ability(want, caller, listener)
    }

    pub fn config(&self) -> &DmsConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn verifier(&self) -> &Arc<PermissionVerifier> {
        &self.verifier
    }

    pub fn abilities(&self) -> &AbilityManager {
        &self.abilities
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.handle.stats().snapshot()
    }
}
