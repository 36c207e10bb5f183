#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::{
    config::{ClientConfig, UpdateServiceConfig},
    http_client::{handle_http_response, unix_socket_client},
    identity::IdentityEntry,
    sink::UpdateEvents,
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use trait_variant::make;

/// Deployment progression as reported by the update service.
#[derive(Clone, Copy, Debug, Deserialize_repr, PartialEq, Serialize_repr)]
#[repr(u8)]
pub enum DeploymentStatus {
    Downloading = 1,
    Installing = 2,
    Rebooting = 3,
    Success = 4,
    Failure = 5,
    AlreadyInstalled = 6,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Downloading => "downloading",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Rebooting => "rebooting",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failure => "failure",
            DeploymentStatus::AlreadyInstalled => "already installed",
        };
        write!(f, "{s}")
    }
}

/// One callback event drained from the update service event queue.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    NetworkConnect,
    NetworkRelease,
    AuthenticationSucceeded,
    AuthenticationFailed,
    #[serde(rename = "deployment_status")]
    Deployment {
        status: DeploymentStatus,
        description: String,
    },
    RestartRequired,
}

#[derive(Serialize)]
struct InitRequest<'a> {
    #[serde(flatten)]
    config: &'a ClientConfig,
    identity: &'a [IdentityEntry],
}

/// Lifecycle surface of the external update-client library.
///
/// `initialize` hands over configuration and identity, `activate` starts the
/// library's own polling, `deactivate` stops it, `release` tears the client
/// down. The orchestrator drives these strictly in that order.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait UpdateClient {
    async fn initialize(&mut self, config: &ClientConfig) -> Result<()>;
    async fn activate(&mut self) -> Result<()>;
    async fn deactivate(&mut self) -> Result<()>;
    async fn release(&mut self) -> Result<()>;
}

/// Update client backed by the local update service.
///
/// Lifecycle calls map onto the service API; callback events are drained
/// from the service's event queue by a background task while the client is
/// active and dispatched to the event sink.
pub struct UpdateServiceClient<S> {
    client: Client,
    sink: Arc<S>,
    event_poll_interval: Duration,
    dispatcher: Option<JoinHandle<()>>,
}

impl<S> UpdateServiceClient<S>
where
    S: UpdateEvents + Send + Sync + 'static,
{
    // API endpoint constants
    const INIT_ENDPOINT: &str = "/client/init/v1";
    const ACTIVATE_ENDPOINT: &str = "/client/activate/v1";
    const DEACTIVATE_ENDPOINT: &str = "/client/deactivate/v1";
    const EXIT_ENDPOINT: &str = "/client/exit/v1";
    const EVENTS_ENDPOINT: &str = "/client/events/v1";

    pub fn new(config: &UpdateServiceConfig, sink: Arc<S>) -> Result<Self> {
        let client = unix_socket_client(&config.socket_path.to_string_lossy())?;

        Ok(UpdateServiceClient {
            client,
            sink,
            event_poll_interval: config.event_poll_interval,
            dispatcher: None,
        })
    }

    fn build_url(path: &str) -> String {
        let normalized_path = path.trim_start_matches('/');
        format!("http://localhost/{normalized_path}")
    }

    async fn post_with_json_body(&self, path: &str, body: impl Serialize) -> Result<String> {
        let url = Self::build_url(path);
        info!("POST {url}");

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }

    async fn post_with_empty_body(&self, path: &str) -> Result<String> {
        let url = Self::build_url(path);
        info!("POST {url}");

        let res = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }

    async fn poll_events(client: &Client) -> Result<Vec<ClientEvent>> {
        let url = Self::build_url(Self::EVENTS_ENDPOINT);

        let res = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to send GET request to {url}"))?;

        serde_json::from_str(&handle_http_response(res, &format!("GET {url}")).await?)
            .context("failed to parse client events")
    }

    fn spawn_dispatcher(&mut self) {
        let client = self.client.clone();
        let sink = self.sink.clone();
        let poll_interval = self.event_poll_interval;

        self.dispatcher = Some(tokio::spawn(async move {
            loop {
                match Self::poll_events(&client).await {
                    Ok(events) => {
                        for event in events {
                            dispatch_event(&*sink, event).await;
                        }
                    }
                    Err(e) => warn!("failed to poll client events: {e:#}"),
                }
                sleep(poll_interval).await;
            }
        }));
    }

    fn stop_dispatcher(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

impl<S> UpdateClient for UpdateServiceClient<S>
where
    S: UpdateEvents + Send + Sync + 'static,
{
    async fn initialize(&mut self, config: &ClientConfig) -> Result<()> {
        let identity = self
            .sink
            .get_identity()
            .context("failed to resolve device identity for client init")?;

        self.post_with_json_body(
            Self::INIT_ENDPOINT,
            InitRequest {
                config,
                identity: &identity.entries,
            },
        )
        .await
        .map(|_| ())
    }

    async fn activate(&mut self) -> Result<()> {
        self.post_with_empty_body(Self::ACTIVATE_ENDPOINT).await?;
        self.spawn_dispatcher();

        Ok(())
    }

    async fn deactivate(&mut self) -> Result<()> {
        self.stop_dispatcher();
        self.post_with_empty_body(Self::DEACTIVATE_ENDPOINT)
            .await
            .map(|_| ())
    }

    async fn release(&mut self) -> Result<()> {
        self.post_with_empty_body(Self::EXIT_ENDPOINT)
            .await
            .map(|_| ())
    }
}

impl<S> Drop for UpdateServiceClient<S> {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Route one callback event to the sink.
///
/// A failed authentication-path callback is the library contract for a fatal
/// session outcome: the dispatcher then invokes the sink's restart operation,
/// which only raises the restart flag and never blocks.
pub(crate) async fn dispatch_event<S: UpdateEvents + Sync>(sink: &S, event: ClientEvent) {
    debug!("dispatching client event: {event:?}");

    match event {
        ClientEvent::NetworkConnect => {
            if let Err(e) = sink.network_connect().await {
                error!("network connect handling failed: {e:#}");
            }
        }
        ClientEvent::NetworkRelease => {
            if let Err(e) = sink.network_release().await {
                error!("network release handling failed: {e:#}");
            }
        }
        ClientEvent::AuthenticationSucceeded => {
            if let Err(e) = sink.authentication_success().await {
                error!("authentication success handling failed: {e:#}");
                request_restart(sink).await;
            }
        }
        ClientEvent::AuthenticationFailed => {
            if let Err(e) = sink.authentication_failure().await {
                error!("authentication failure is fatal: {e:#}");
                request_restart(sink).await;
            }
        }
        ClientEvent::Deployment {
            status,
            description,
        } => {
            if let Err(e) = sink.deployment_status(status, &description).await {
                error!("deployment status handling failed: {e:#}");
            }
        }
        ClientEvent::RestartRequired => request_restart(sink).await,
    }
}

async fn request_restart<S: UpdateEvents + Sync>(sink: &S) {
    if let Err(e) = sink.restart().await {
        error!("restart request handling failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MockUpdateEvents;

    #[test]
    fn client_events_parse() {
        let payload = r#"[
            {"event": "authentication_failed"},
            {"event": "deployment_status", "status": 1, "description": "fetching artifact"},
            {"event": "restart_required"}
        ]"#;

        let events: Vec<ClientEvent> = serde_json::from_str(payload).expect("should parse events");
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ClientEvent::AuthenticationFailed));
        assert!(matches!(
            events[1],
            ClientEvent::Deployment {
                status: DeploymentStatus::Downloading,
                ..
            }
        ));
        assert!(matches!(events[2], ClientEvent::RestartRequired));
    }

    #[tokio::test]
    async fn restart_event_invokes_restart_callback() {
        let mut sink = MockUpdateEvents::new();
        sink.expect_restart()
            .times(1)
            .returning(|| Box::pin(async { Ok(()) }));

        dispatch_event(&sink, ClientEvent::RestartRequired).await;
    }

    #[tokio::test]
    async fn fatal_authentication_failure_requests_restart() {
        let mut sink = MockUpdateEvents::new();
        sink.expect_authentication_failure()
            .times(1)
            .returning(|| Box::pin(async { anyhow::bail!("retry limit reached") }));
        sink.expect_restart()
            .times(1)
            .returning(|| Box::pin(async { Ok(()) }));

        dispatch_event(&sink, ClientEvent::AuthenticationFailed).await;
    }

    #[tokio::test]
    async fn tolerated_authentication_failure_does_not_restart() {
        let mut sink = MockUpdateEvents::new();
        sink.expect_authentication_failure()
            .times(1)
            .returning(|| Box::pin(async { Ok(()) }));
        sink.expect_restart().never();

        dispatch_event(&sink, ClientEvent::AuthenticationFailed).await;
    }

    #[tokio::test]
    async fn failed_image_confirmation_requests_restart() {
        let mut sink = MockUpdateEvents::new();
        sink.expect_authentication_success()
            .times(1)
            .returning(|| Box::pin(async { anyhow::bail!("confirm failed") }));
        sink.expect_restart()
            .times(1)
            .returning(|| Box::pin(async { Ok(()) }));

        dispatch_event(&sink, ClientEvent::AuthenticationSucceeded).await;
    }

    #[tokio::test]
    async fn deployment_status_is_forwarded() {
        let mut sink = MockUpdateEvents::new();
        sink.expect_deployment_status()
            .withf(|status, description| {
                *status == DeploymentStatus::Installing && description == "writing image"
            })
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(()) }));

        dispatch_event(
            &sink,
            ClientEvent::Deployment {
                status: DeploymentStatus::Installing,
                description: "writing image".to_string(),
            },
        )
        .await;
    }
}
