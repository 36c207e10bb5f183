#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::{
    device_service_client::DeviceService,
    events::{EventLatch, RESTART_REQUESTED},
    identity::{DeviceIdentity, IdentityProvider},
    services::{
        reporting::DeploymentReporter,
        session::{AuthDecision, AuthRetryGuard, ImageConfirmationGate},
    },
    update_client::DeploymentStatus,
};
use anyhow::{Result, bail};
use log::{debug, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::sync::{Arc, Mutex};
use trait_variant::make;

/// The seven callback operations the update client invokes on the agent.
///
/// One capability set instead of a record of function pointers; the update
/// client holds a single sink and the agent supplies one implementation per
/// deployment target.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait UpdateEvents {
    async fn network_connect(&self) -> Result<()>;
    async fn network_release(&self) -> Result<()>;
    async fn authentication_success(&self) -> Result<()>;
    async fn authentication_failure(&self) -> Result<()>;
    async fn deployment_status(&self, status: DeploymentStatus, description: &str) -> Result<()>;
    async fn restart(&self) -> Result<()>;
    fn get_identity(&self) -> Result<Arc<DeviceIdentity>>;
}

/// Production event sink wiring the callbacks to the session components.
///
/// The update client guarantees callbacks are never invoked concurrently
/// with each other; the retry guard mutex only exists so the sink can be
/// shared behind an `Arc`.
pub struct AgentEventSink<D> {
    device: Arc<D>,
    identity: Arc<IdentityProvider>,
    latch: EventLatch,
    reporter: DeploymentReporter,
    guard: Mutex<AuthRetryGuard>,
}

impl<D> AgentEventSink<D>
where
    D: DeviceService + Send + Sync,
{
    pub fn new(
        device: Arc<D>,
        identity: Arc<IdentityProvider>,
        latch: EventLatch,
        reporter: DeploymentReporter,
        guard: AuthRetryGuard,
    ) -> Self {
        Self {
            device,
            identity,
            latch,
            reporter,
            guard: Mutex::new(guard),
        }
    }
}

impl<D> UpdateEvents for AgentEventSink<D>
where
    D: DeviceService + Send + Sync,
{
    async fn network_connect(&self) -> Result<()> {
        // connectivity is owned by the host network stack
        debug!("network connect requested");
        Ok(())
    }

    async fn network_release(&self) -> Result<()> {
        debug!("network release requested");
        Ok(())
    }

    async fn authentication_success(&self) -> Result<()> {
        ImageConfirmationGate::confirm_current(&*self.device).await
    }

    async fn authentication_failure(&self) -> Result<()> {
        let confirmed = match self.device.is_image_confirmed().await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                // unknown confirmation state counts towards the retry budget
                warn!("failed to query image confirmation state: {e:#}");
                false
            }
        };

        match self.guard.lock().unwrap().on_failure(confirmed) {
            AuthDecision::Continue => Ok(()),
            AuthDecision::Fatal => {
                bail!("authentication retry limit reached while image unconfirmed")
            }
        }
    }

    async fn deployment_status(&self, status: DeploymentStatus, description: &str) -> Result<()> {
        self.reporter.report(status, description);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        // must return promptly: only raises the flag, the orchestration
        // task performs the actual shutdown sequence
        debug!("restart requested");
        self.latch.raise(RESTART_REQUESTED);
        Ok(())
    }

    fn get_identity(&self) -> Result<Arc<DeviceIdentity>> {
        self.identity.get()
    }
}
