//! Monitored entities and the topic scheme
//!
//! Every configured check becomes one Home Assistant binary sensor. Topics
//! and unique ids are deterministic functions of `(client_id, name)`; the
//! availability topic is shared by all entities of the device.

use crate::config::CheckConfig;
use std::collections::BTreeMap;

pub const DISCOVERY_PREFIX: &str = "homeassistant";
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";
pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Device class reported when the configuration leaves it unset. The
/// consumer's schema requires a value, absence is not an option.
pub const FALLBACK_DEVICE_CLASS: &str = "problem";

const ALIVENESS_NAME: &str = "aliveness";
const ALIVENESS_DISPLAY_NAME: &str = "Aliveness";
const ALIVENESS_DEVICE_CLASS: &str = "connectivity";

/// One monitored liveness check. Built from configuration at startup,
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    pub display_name: String,
    pub command: Option<String>,
    device_class: Option<String>,
}

impl Entity {
    /// The built-in entity reporting that the daemon itself is up. It has
    /// no command and therefore always reads alive.
    pub fn aliveness() -> Self {
        Entity {
            name: ALIVENESS_NAME.to_string(),
            display_name: ALIVENESS_DISPLAY_NAME.to_string(),
            command: None,
            device_class: Some(ALIVENESS_DEVICE_CLASS.to_string()),
        }
    }

    /// Build the full entity set: the aliveness entity first, then one
    /// entity per configured check.
    pub fn from_checks(checks: &BTreeMap<String, CheckConfig>) -> Vec<Entity> {
        let mut entities = vec![Self::aliveness()];
        for (name, check) in checks {
            entities.push(Entity {
                name: name.clone(),
                display_name: name.clone(),
                command: check.command.clone(),
                device_class: check.device_class.clone(),
            });
        }
        entities
    }

    pub fn device_class(&self) -> &str {
        self.device_class.as_deref().unwrap_or(FALLBACK_DEVICE_CLASS)
    }

    pub fn unique_id(&self, client_id: &str) -> String {
        format!("{client_id}_{}", self.name)
    }

    pub fn config_topic(&self, client_id: &str) -> String {
        format!(
            "{DISCOVERY_PREFIX}/binary_sensor/{}/config",
            self.unique_id(client_id)
        )
    }

    pub fn state_topic(&self, client_id: &str) -> String {
        format!(
            "{DISCOVERY_PREFIX}/binary_sensor/{}/state",
            self.unique_id(client_id)
        )
    }
}

/// Availability topic shared by every entity of this device; also the
/// broker-side last-will target.
pub fn availability_topic(client_id: &str) -> String {
    format!("{DISCOVERY_PREFIX}/binary_sensor/{client_id}/availability")
}
