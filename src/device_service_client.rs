#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::{
    config::DeviceServiceConfig,
    http_client::{handle_http_response, unix_socket_client},
};
use anyhow::{Context, Result, anyhow};
use log::info;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::Client;
use semver::{Version, VersionReq};
use serde::Deserialize;
use trait_variant::make;

#[derive(Debug, Deserialize)]
pub struct Status {
    pub network_status: NetworkStatus,
    pub system_info: SystemInfo,
}

#[derive(Debug, Deserialize)]
pub struct SystemInfo {
    pub device_service_version: String,
}

#[derive(Debug, Deserialize)]
pub struct NetworkStatus {
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub online: bool,
    pub mac: Option<String>,
    pub ipv4: Ipv4Info,
}

#[derive(Debug, Deserialize)]
pub struct Ipv4Info {
    pub addrs: Vec<Ipv4AddrInfo>,
}

/// One assigned IPv4 address with its provenance. `dhcp` marks addresses the
/// host obtained through dynamic configuration; only those count towards
/// network readiness.
#[derive(Debug, Deserialize)]
pub struct Ipv4AddrInfo {
    pub addr: String,
    pub prefix_len: u8,
    #[serde(default)]
    pub dhcp: bool,
    pub gateway: Option<String>,
    pub lease_duration_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct VersionInfo {
    pub required: String,
    pub current: String,
    pub mismatch: bool,
}

#[derive(Debug, Deserialize)]
struct ImageState {
    confirmed: bool,
}

/// Collaborator owning the network stack, the A/B image state and reboot.
///
/// The orchestration core only ever reaches these concerns through this
/// trait, so every decision path is testable against the automock.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DeviceService {
    async fn status(&self) -> Result<Status>;
    async fn reload_network(&self) -> Result<()>;
    async fn is_image_confirmed(&self) -> Result<bool>;
    async fn confirm_image(&self) -> Result<()>;
    async fn reboot(&self) -> Result<()>;
    async fn version_info(&self) -> Result<VersionInfo>;
}

#[derive(Clone)]
pub struct DeviceServiceClient {
    client: Client,
}

impl DeviceServiceClient {
    const REQUIRED_SERVICE_VERSION: &str = ">=0.5.0";

    // API endpoint constants
    const STATUS_ENDPOINT: &str = "/status/v1";
    const RELOAD_NETWORK_ENDPOINT: &str = "/reload-network/v1";
    const IMAGE_CONFIRMED_ENDPOINT: &str = "/fwupdate/confirmed/v1";
    const CONFIRM_IMAGE_ENDPOINT: &str = "/fwupdate/confirm/v1";
    const REBOOT_ENDPOINT: &str = "/reboot/v1";

    pub fn new(config: &DeviceServiceConfig) -> Result<Self> {
        let client = unix_socket_client(&config.socket_path.to_string_lossy())?;

        Ok(DeviceServiceClient { client })
    }

    fn evaluate_version(current: &str) -> Result<VersionInfo> {
        let required = VersionReq::parse(Self::REQUIRED_SERVICE_VERSION)
            .map_err(|e| anyhow!("failed to parse required version: {e}"))?;
        let current = Version::parse(current)
            .map_err(|e| anyhow!("failed to parse current version: {e}"))?;

        Ok(VersionInfo {
            required: required.to_string(),
            current: current.to_string(),
            mismatch: !required.matches(&current),
        })
    }

    fn build_url(&self, path: &str) -> String {
        // Normalize path to always start with a single "/"
        let normalized_path = path.trim_start_matches('/');
        format!("http://localhost/{normalized_path}")
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = self.build_url(path);
        info!("GET {url}");

        let res = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to send GET request to {url}"))?;

        handle_http_response(res, &format!("GET {url}")).await
    }

    async fn post(&self, path: &str) -> Result<String> {
        let url = self.build_url(path);
        info!("POST {url}");

        let res = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }
}

impl DeviceService for DeviceServiceClient {
    async fn status(&self) -> Result<Status> {
        serde_json::from_str(&self.get(Self::STATUS_ENDPOINT).await?)
            .context("failed to parse status")
    }

    async fn reload_network(&self) -> Result<()> {
        self.post(Self::RELOAD_NETWORK_ENDPOINT).await.map(|_| ())
    }

    async fn is_image_confirmed(&self) -> Result<bool> {
        let state: ImageState =
            serde_json::from_str(&self.get(Self::IMAGE_CONFIRMED_ENDPOINT).await?)
                .context("failed to parse image confirmation state")?;

        Ok(state.confirmed)
    }

    async fn confirm_image(&self) -> Result<()> {
        self.post(Self::CONFIRM_IMAGE_ENDPOINT).await.map(|_| ())
    }

    async fn reboot(&self) -> Result<()> {
        self.post(Self::REBOOT_ENDPOINT).await.map(|_| ())
    }

    async fn version_info(&self) -> Result<VersionInfo> {
        let current = self.status().await?.system_info.device_service_version;

        Self::evaluate_version(&current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate_accepts_current_service() {
        let info =
            DeviceServiceClient::evaluate_version("0.6.1").expect("should evaluate version");
        assert!(!info.mismatch);
    }

    #[test]
    fn version_gate_flags_outdated_service() {
        let info =
            DeviceServiceClient::evaluate_version("0.4.9").expect("should evaluate version");
        assert!(info.mismatch);
    }

    #[test]
    fn version_gate_rejects_garbage() {
        assert!(DeviceServiceClient::evaluate_version("not-a-version").is_err());
    }

    #[test]
    fn status_payload_parses() {
        let payload = r#"{
            "network_status": {
                "network_interfaces": [{
                    "name": "eth0",
                    "online": true,
                    "mac": "02:42:ac:11:00:02",
                    "ipv4": {
                        "addrs": [{
                            "addr": "192.168.1.20",
                            "prefix_len": 24,
                            "dhcp": true,
                            "gateway": "192.168.1.1",
                            "lease_duration_secs": 3600
                        }]
                    }
                }]
            },
            "system_info": { "device_service_version": "0.6.0" }
        }"#;

        let status: Status = serde_json::from_str(payload).expect("should parse status");
        let iface = &status.network_status.network_interfaces[0];

        assert!(iface.online);
        assert!(iface.ipv4.addrs[0].dhcp);
        assert_eq!(iface.ipv4.addrs[0].prefix_len, 24);
        assert_eq!(status.system_info.device_service_version, "0.6.0");
    }

    #[test]
    fn address_without_provenance_marker_is_static() {
        // addresses without provenance marker must not count as dynamic
        let payload = r#"{"addr": "10.0.0.5", "prefix_len": 8}"#;
        let addr: Ipv4AddrInfo = serde_json::from_str(payload).expect("should parse addr");
        assert!(!addr.dhcp);
    }
}
