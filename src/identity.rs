use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// One (name, value) pair of the identity record presented to the server.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IdentityEntry {
    pub name: String,
    pub value: String,
}

/// Device identity presented by the update client at authentication time.
///
/// Ordered set of (name, value) pairs. The hardware-address entry can only
/// be filled in after network bring-up, which is why the record lives behind
/// the provider below instead of being part of the static configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DeviceIdentity {
    pub entries: Vec<IdentityEntry>,
}

impl DeviceIdentity {
    pub fn from_hardware_address(mac: &str, device_type: &str) -> Self {
        Self {
            entries: vec![
                IdentityEntry {
                    name: "mac".to_string(),
                    value: mac.to_string(),
                },
                IdentityEntry {
                    name: "device_type".to_string(),
                    value: device_type.to_string(),
                },
            ],
        }
    }
}

/// Owner of the device identity record.
///
/// The orchestrator populates it once between network readiness and client
/// activation; the update client borrows it on demand. Calling `get` before
/// population is a sequencing bug and reported as an error.
pub struct IdentityProvider {
    identity: Mutex<Option<Arc<DeviceIdentity>>>,
}

impl IdentityProvider {
    pub fn new() -> Self {
        Self {
            identity: Mutex::new(None),
        }
    }

    pub fn populate(&self, identity: DeviceIdentity) {
        *self.identity.lock().unwrap() = Some(Arc::new(identity));
    }

    pub fn get(&self) -> Result<Arc<DeviceIdentity>> {
        self.identity
            .lock()
            .unwrap()
            .clone()
            .context("failed to get device identity: not populated yet")
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_before_populate_fails() {
        let provider = IdentityProvider::new();
        let result = provider.get();

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("not populated yet")
        );
    }

    #[test]
    fn get_after_populate_returns_entries() {
        let provider = IdentityProvider::new();
        provider.populate(DeviceIdentity::from_hardware_address(
            "02:42:ac:11:00:02",
            "qemu-x86",
        ));

        let identity = provider.get().expect("should be populated");
        assert_eq!(identity.entries[0].name, "mac");
        assert_eq!(identity.entries[0].value, "02:42:ac:11:00:02");
        assert_eq!(identity.entries[1].name, "device_type");
    }

    #[test]
    fn identity_serializes_as_entry_list() {
        let identity = DeviceIdentity::from_hardware_address("02:42:ac:11:00:02", "qemu-x86");
        let json = serde_json::to_value(&identity).expect("should serialize");

        assert!(json.is_array());
        assert_eq!(json[0]["name"], "mac");
    }
}
