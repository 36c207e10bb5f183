//! Update-session orchestration
//!
//! The single task that sequences network readiness, client bring-up and the
//! restart handshake. All other components run on their own tasks and talk
//! to this loop exclusively through the event latch or callback results.

use crate::{
    config::AgentConfig,
    device_service_client::DeviceService,
    events::{EventLatch, NETWORK_READY, RESTART_REQUESTED},
    identity::{DeviceIdentity, IdentityProvider},
    services::{CredentialService, NetworkReadinessGate},
    update_client::UpdateClient,
};
use anyhow::{Context, Result, ensure};
use log::{debug, error, info, warn};
use std::{sync::Arc, time::Duration};

const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AgentState {
    Boot,
    NetworkWait,
    ClientInit,
    Active,
    ShuttingDown,
    Reboot,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShutdownReason {
    /// Restart requested or a fatal session failure: reboot the device
    Restart,
    /// Supervisor stop: tear down the client but leave the device running
    Terminated,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Restart => write!(f, "restarting device"),
            ShutdownReason::Terminated => write!(f, "shutting down"),
        }
    }
}

pub struct Orchestrator<D, U> {
    device: Arc<D>,
    client: U,
    latch: EventLatch,
    identity: Arc<IdentityProvider>,
    config: AgentConfig,
    state: AgentState,
}

impl<D, U> Orchestrator<D, U>
where
    D: DeviceService + Send + Sync + 'static,
    U: UpdateClient,
{
    pub fn new(
        device: Arc<D>,
        client: U,
        latch: EventLatch,
        identity: Arc<IdentityProvider>,
        config: AgentConfig,
    ) -> Self {
        Self {
            device,
            client,
            latch,
            identity,
            config,
            state: AgentState::Boot,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Drive one update session from boot to shutdown.
    ///
    /// `stop` is the supervisor stop signal (SIGTERM in production); when it
    /// resolves the client is torn down without rebooting. Every other exit
    /// goes through the full deactivate, release, reboot sequence.
    pub async fn run(&mut self, stop: impl Future<Output = ()>) -> Result<ShutdownReason> {
        tokio::pin!(stop);

        info!("starting update session");
        self.enter(AgentState::NetworkWait);

        if let Err(e) = NetworkReadinessGate::request_interface_configuration(&*self.device).await
        {
            // the watcher below keeps observing; the stack may come up on its own
            warn!("failed to request interface configuration: {e:#}");
        }

        let watcher = tokio::spawn(NetworkReadinessGate::watch(
            self.device.clone(),
            self.latch.clone(),
            NETWORK_POLL_INTERVAL,
        ));

        let timeout = self.config.watchdog.wait_timeout;
        let latch = self.latch.clone();
        let ready = tokio::select! {
            res = latch.wait_all(NETWORK_READY, timeout) => Some(res),
            _ = &mut stop => None,
        };
        watcher.abort();

        let ready = match ready {
            Some(res) => res,
            None => return self.shutdown(ShutdownReason::Terminated).await,
        };
        if let Err(e) = ready {
            error!("network readiness wait failed: {e:#}");
            return self.shutdown(ShutdownReason::Restart).await;
        }

        self.enter(AgentState::ClientInit);
        if let Err(e) = self.client_init().await {
            error!("failed to bring up update client: {e:#}");
            return self.shutdown(ShutdownReason::Restart).await;
        }

        self.enter(AgentState::Active);
        let restart = tokio::select! {
            res = latch.wait_all(RESTART_REQUESTED, timeout) => Some(res),
            _ = &mut stop => None,
        };

        match restart {
            Some(Ok(())) => {}
            Some(Err(e)) => error!("restart wait failed: {e:#}"),
            None => return self.shutdown(ShutdownReason::Terminated).await,
        }

        self.shutdown(ShutdownReason::Restart).await
    }

    /// Identity, credentials, version gate, then client init and activation.
    /// Any failure here is fatal for the session.
    async fn client_init(&mut self) -> Result<()> {
        let version = self
            .device
            .version_info()
            .await
            .context("failed to query device service version")?;
        ensure!(
            !version.mismatch,
            "device service version mismatch: required {} but running {}",
            version.required,
            version.current
        );

        let status = self
            .device
            .status()
            .await
            .context("failed to query status for identity population")?;
        let mac = NetworkReadinessGate::hardware_address(&status)?;
        self.identity.populate(DeviceIdentity::from_hardware_address(
            &mac,
            &self.config.client.device_type,
        ));

        CredentialService::validate(&self.config.credentials)
            .context("failed to validate client credentials")?;

        self.client
            .initialize(&self.config.client)
            .await
            .context("failed to initialize update client")?;

        self.client
            .activate()
            .await
            .context("failed to activate update client")?;

        info!("update client active");
        Ok(())
    }

    /// Ordered teardown: deactivate, release, then (unless terminated)
    /// reboot. A failing step is logged but never reorders or skips the
    /// remaining steps, otherwise the client could corrupt persisted
    /// session data across the reboot.
    async fn shutdown(&mut self, reason: ShutdownReason) -> Result<ShutdownReason> {
        self.enter(AgentState::ShuttingDown);
        info!("{reason}");

        if let Err(e) = self.client.deactivate().await {
            error!("failed to deactivate update client: {e:#}");
        }

        if let Err(e) = self.client.release().await {
            error!("failed to release update client: {e:#}");
        }

        if let ShutdownReason::Restart = reason {
            self.enter(AgentState::Reboot);
            self.device
                .reboot()
                .await
                .context("failed to reboot device")?;
        }

        Ok(reason)
    }

    fn enter(&mut self, state: AgentState) {
        debug!("state transition: {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}
