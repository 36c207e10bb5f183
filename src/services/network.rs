//! Network readiness gate
//!
//! Watches interface address state and raises `NETWORK_READY` once at least
//! one interface holds a dynamically assigned address. Interface
//! configuration itself stays with the host network stack; the gate only
//! requests dynamic configuration and observes the outcome.

use crate::{
    device_service_client::{DeviceService, Status},
    events::{EventLatch, NETWORK_READY},
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

pub struct NetworkReadinessGate;

impl NetworkReadinessGate {
    /// Request dynamic address configuration for the discovered interfaces.
    ///
    /// Invoked once at boot. The reload applies to the whole network stack
    /// at once; interfaces that are already configured simply renew.
    pub async fn request_interface_configuration<D>(device: &D) -> Result<()>
    where
        D: DeviceService + Sync,
    {
        let status = device
            .status()
            .await
            .context("failed to query interfaces for network bring-up")?;

        let interfaces: Vec<&str> = status
            .network_status
            .network_interfaces
            .iter()
            .map(|iface| iface.name.as_str())
            .collect();
        debug!("requesting dynamic configuration for {interfaces:?}");

        device
            .reload_network()
            .await
            .context("failed to request network configuration")
    }

    /// Poll address state until a dynamic assignment appears, then raise
    /// `NETWORK_READY` and stop.
    ///
    /// The latch's sticky bit makes repeated raises harmless, but polling
    /// ends after the first assignment to avoid pointless work.
    pub async fn watch<D>(device: Arc<D>, latch: EventLatch, poll_interval: Duration)
    where
        D: DeviceService + Send + Sync,
    {
        loop {
            match device.status().await {
                Ok(status) => {
                    if Self::scan_for_dynamic_address(&status) {
                        latch.raise(NETWORK_READY);
                        return;
                    }
                }
                Err(e) => warn!("failed to query network status: {e:#}"),
            }

            sleep(poll_interval).await;
        }
    }

    /// Log every dynamically assigned address; true if at least one exists
    /// on an online interface.
    fn scan_for_dynamic_address(status: &Status) -> bool {
        let mut found = false;

        for iface in &status.network_status.network_interfaces {
            if !iface.online {
                continue;
            }

            for addr in iface.ipv4.addrs.iter().filter(|a| a.dhcp) {
                info!(
                    "{}: dynamic address {}/{} (gateway {}, lease {}s)",
                    iface.name,
                    addr.addr,
                    addr.prefix_len,
                    addr.gateway.as_deref().unwrap_or("none"),
                    addr.lease_duration_secs
                        .map_or_else(|| "?".to_string(), |l| l.to_string()),
                );
                found = true;
            }
        }

        found
    }

    /// Hardware address of the first online interface, for the identity
    /// record.
    pub fn hardware_address(status: &Status) -> Result<String> {
        status
            .network_status
            .network_interfaces
            .iter()
            .filter(|iface| iface.online)
            .filter_map(|iface| iface.mac.clone())
            .next()
            .context("failed to find hardware address of an online interface")
    }
}
