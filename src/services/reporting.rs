//! Deployment status reporting
//!
//! Forwards deployment-status transitions from the update client to
//! observers. No decision logic lives here; the reporter cannot fail.

use crate::update_client::DeploymentStatus;
use log::info;
use tokio::sync::broadcast;

const OBSERVER_CHANNEL_CAPACITY: usize = 16;

/// One observed deployment transition.
#[derive(Clone, Debug)]
pub struct DeploymentEvent {
    pub status: DeploymentStatus,
    pub description: String,
}

/// Fans deployment transitions out to telemetry observers.
///
/// `subscribe` is the attachment point for an external telemetry exporter;
/// the daemon itself only logs transitions, so running without subscribers
/// is the normal case.
#[derive(Clone)]
pub struct DeploymentReporter {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl DeploymentReporter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(OBSERVER_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }

    pub fn report(&self, status: DeploymentStatus, description: &str) {
        info!("deployment status: {status} ({description})");

        // running without observers is normal
        let _ = self.tx.send(DeploymentEvent {
            status,
            description: description.to_string(),
        });
    }
}

impl Default for DeploymentReporter {
    fn default() -> Self {
        Self::new()
    }
}
