use anyhow::{Context, Result};
use serde::Serialize;
use std::{env, path::PathBuf, time::Duration};

/// Agent configuration loaded and validated at startup.
///
/// Loaded once from environment variables and passed by value into the
/// orchestrator, so independent instances (and tests) never share state.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Update client session configuration, handed to the client at init
    pub client: ClientConfig,

    /// Authentication retry policy
    pub retry: RetryConfig,

    /// Device service endpoint (network, image state, reboot)
    pub device_service: DeviceServiceConfig,

    /// Update service endpoint (client lifecycle and events)
    pub update_service: UpdateServiceConfig,

    /// TLS client credential files handed to the update client
    pub credentials: CredentialConfig,

    /// Optional watchdog timeout for the orchestrator's top-level waits
    pub watchdog: WatchdogConfig,
}

/// Immutable update-client session parameters.
///
/// Serialized as-is into the client init request. A `host` of `None` leaves
/// endpoint selection to the update service; poll intervals of 0 select the
/// service defaults.
#[derive(Clone, Debug, Serialize)]
pub struct ClientConfig {
    pub artifact_name: String,
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_token: Option<String>,
    pub authentication_poll_interval: u64,
    pub update_poll_interval: u64,
    pub recommissioning: bool,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Consecutive authentication failures tolerated while the running
    /// image is unconfirmed, before the session is declared fatal
    pub max_tries: u32,
}

#[derive(Clone, Debug)]
pub struct DeviceServiceConfig {
    pub socket_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct UpdateServiceConfig {
    pub socket_path: PathBuf,
    pub event_poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct CredentialConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    /// `None` (the default) waits forever on the top-level latch waits
    pub wait_timeout: Option<Duration>,
}

impl AgentConfig {
    /// Load and validate all configuration from environment variables.
    pub fn load() -> Result<Self> {
        Ok(Self {
            client: ClientConfig::load()?,
            retry: RetryConfig::load()?,
            device_service: DeviceServiceConfig::load()?,
            update_service: UpdateServiceConfig::load()?,
            credentials: CredentialConfig::load()?,
            watchdog: WatchdogConfig::load()?,
        })
    }
}

impl ClientConfig {
    fn load() -> Result<Self> {
        let artifact_name = env::var("ARTIFACT_NAME").unwrap_or_else(|_| "unknown".to_string());
        let device_type = env::var("DEVICE_TYPE").unwrap_or_else(|_| "qemu-x86".to_string());
        let host = env::var("SERVER_HOST").ok();
        let tenant_token = env::var("TENANT_TOKEN").ok();

        let authentication_poll_interval = env::var("AUTH_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u64>()
            .context("failed to parse AUTH_POLL_INTERVAL_SECS: invalid format")?;

        let update_poll_interval = env::var("UPDATE_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u64>()
            .context("failed to parse UPDATE_POLL_INTERVAL_SECS: invalid format")?;

        let recommissioning = env::var("RECOMMISSIONING")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .context("failed to parse RECOMMISSIONING: invalid format")?;

        Ok(Self {
            artifact_name,
            device_type,
            host,
            tenant_token,
            authentication_poll_interval,
            update_poll_interval,
            recommissioning,
        })
    }
}

impl RetryConfig {
    fn load() -> Result<Self> {
        let max_tries = env::var("MAX_AUTH_TRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<u32>()
            .context("failed to parse MAX_AUTH_TRIES: invalid format")?;

        anyhow::ensure!(max_tries > 0, "MAX_AUTH_TRIES must be at least 1");

        Ok(Self { max_tries })
    }
}

impl DeviceServiceConfig {
    fn load() -> Result<Self> {
        let socket_path = env::var("DEVICE_SOCKET_PATH")
            .unwrap_or_else(|_| "/run/device-service/api.sock".to_string())
            .into();

        Ok(Self { socket_path })
    }
}

impl UpdateServiceConfig {
    fn load() -> Result<Self> {
        let socket_path = env::var("UPDATE_SOCKET_PATH")
            .unwrap_or_else(|_| "/run/update-service/api.sock".to_string())
            .into();

        let event_poll_interval = env::var("EVENT_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("failed to parse EVENT_POLL_INTERVAL_SECS: invalid format")?;

        Ok(Self {
            socket_path,
            event_poll_interval,
        })
    }
}

impl CredentialConfig {
    fn load() -> Result<Self> {
        let cert_path = env::var("CERT_PATH")
            .unwrap_or_else(|_| "/cert/cert.pem".to_string())
            .into();

        let key_path = env::var("KEY_PATH")
            .unwrap_or_else(|_| "/cert/key.pem".to_string())
            .into();

        Ok(Self {
            cert_path,
            key_path,
        })
    }
}

impl WatchdogConfig {
    fn load() -> Result<Self> {
        let wait_timeout = match env::var("WATCHDOG_TIMEOUT_SECS") {
            Ok(secs) => Some(
                secs.parse::<u64>()
                    .map(Duration::from_secs)
                    .context("failed to parse WATCHDOG_TIMEOUT_SECS: invalid format")?,
            ),
            Err(_) => None,
        };

        Ok(Self { wait_timeout })
    }
}
