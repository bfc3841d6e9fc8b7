//! Ability start entry points.

use std::sync::Arc;

use tracing::{debug, info};

use crate::dispatch::{DispatchHandle, Request};
use crate::errors::{DmsError, DmsResult};
use crate::permission::CallerInfo;
use crate::session::CompletionListener;

/// Target of a start-ability call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Want {
    pub device_id: String,
    pub bundle_name: String,
    pub ability_name: String,
}

impl Want {
    pub fn new(
        device_id: impl Into<String>,
        bundle_name: impl Into<String>,
        ability_name: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            bundle_name: bundle_name.into(),
            ability_name: ability_name.into(),
        }
    }

    fn validate(&self) -> DmsResult<()> {
        if self.device_id.is_empty() {
            return Err(DmsError::invalid("want has no device id"));
        }
        if self.bundle_name.is_empty() || self.ability_name.is_empty() {
            return Err(DmsError::invalid("want has no element name"));
        }
        Ok(())
    }
}

/// Starts an ability once a remote request has been authorized.
pub trait AbilityLauncher: Send + Sync {
    fn start_ability_from_remote(&self, bundle_name: &str, ability_name: &str) -> DmsResult<()>;
}

/// Launcher that accepts every request and only logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLauncher;

impl AbilityLauncher for LoggingLauncher {
    fn start_ability_from_remote(&self, bundle_name: &str, ability_name: &str) -> DmsResult<()> {
        info!(bundle = bundle_name, ability = ability_name, "starting ability for remote caller");
        Ok(())
    }
}

/// Caller-facing API for starting abilities on other devices.
#[derive(Clone)]
pub struct AbilityManager {
    dispatcher: DispatchHandle,
}

impl AbilityManager {
    pub fn new(dispatcher: DispatchHandle) -> Self {
        Self { dispatcher }
    }

    /// Ask `want.device_id` to start `want`'s ability on behalf of `caller`.
    ///
    /// The request is queued; `listener` receives the peer's answer, or the
    /// local failure if the request could not be sent.
    pub fn start_remote_ability(
        &self,
        want: Want,
        caller: CallerInfo,
        listener: Arc<dyn CompletionListener>,
    ) -> DmsResult<()> {
        want.validate()?;
        debug!(
            device = %want.device_id,
            bundle = %want.bundle_name,
            ability = %want.ability_name,
            uid = caller.uid,
            "queueing remote ability start"
        );
        if !self.dispatcher.submit(Request::StartRemoteAbility {
            want,
            caller,
            listener,
        }) {
            return Err(DmsError::failure("dispatcher queue full"));
        }
        Ok(())
    }
}
