//! Home Assistant auto-discovery
//!
//! One retained config message per entity plus one retained availability
//! message, emitted on every successful (re)connection. Retained messages
//! are last-write-wins on the broker, so re-announcing identical content
//! is safe.

use crate::bus::MessageBus;
use crate::entity::{self, Entity};
use crate::identity::DeviceIdentity;
use anyhow::{Context, Result};
use rumqttc::QoS;
use serde::Serialize;
use tracing::{debug, info};

const MANUFACTURER: &str = "MQTT Alive Agent";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Discovery record for one binary sensor. Field names are fixed by the
/// consumer's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub payload_on: String,
    pub payload_off: String,
    pub device_class: String,
    pub availability_topic: String,
    pub device: DeviceDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

pub struct DiscoveryPublisher {
    client_id: String,
    device_name: String,
}

impl DiscoveryPublisher {
    pub fn new(identity: &DeviceIdentity, device_name: String) -> Self {
        Self {
            client_id: identity.client_id.clone(),
            device_name,
        }
    }

    /// Announce every entity, then flip availability to online. Config
    /// messages are retained so the hub re-registers sensors after its own
    /// restarts; the payload for a given entity set is byte-identical on
    /// every call.
    pub async fn announce<B: MessageBus>(&self, bus: &B, entities: &[Entity]) -> Result<()> {
        for entity in entities {
            let payload = self.payload_for(entity);
            let body = serde_json::to_vec(&payload)
                .with_context(|| format!("could not encode discovery payload for {}", entity.name))?;
            let topic = entity.config_topic(&self.client_id);
            bus.publish(&topic, QoS::AtMostOnce, true, body)
                .await
                .with_context(|| format!("discovery publish failed for {}", entity.name))?;
            debug!(entity = %entity.name, topic = %topic, "announced discovery config");
        }

        self.publish_availability(bus, entity::AVAILABILITY_ONLINE)
            .await?;
        info!(entities = entities.len(), "device announced, availability online");
        Ok(())
    }

    /// Flip availability to offline. Best effort on the shutdown path.
    pub async fn offline<B: MessageBus>(&self, bus: &B) -> Result<()> {
        self.publish_availability(bus, entity::AVAILABILITY_OFFLINE)
            .await
    }

    async fn publish_availability<B: MessageBus>(&self, bus: &B, payload: &str) -> Result<()> {
        bus.publish(
            &entity::availability_topic(&self.client_id),
            QoS::AtLeastOnce,
            true,
            payload.as_bytes().to_vec(),
        )
        .await
        .context("availability publish failed")?;
        Ok(())
    }

    fn payload_for(&self, entity: &Entity) -> DiscoveryPayload {
        DiscoveryPayload {
            name: entity.display_name.clone(),
            unique_id: entity.unique_id(&self.client_id),
            state_topic: entity.state_topic(&self.client_id),
            payload_on: entity::PAYLOAD_ON.to_string(),
            payload_off: entity::PAYLOAD_OFF.to_string(),
            device_class: entity.device_class().to_string(),
            availability_topic: entity::availability_topic(&self.client_id),
            device: DeviceDescriptor {
                identifiers: vec![self.client_id.clone()],
                name: self.device_name.clone(),
                manufacturer: MANUFACTURER.to_string(),
                model: format!(
                    "v{VERSION} ({}/{})",
                    std::env::consts::OS,
                    std::env::consts::ARCH
                ),
                sw_version: VERSION.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::config::CheckConfig;
    use std::collections::BTreeMap;

    fn publisher() -> DiscoveryPublisher {
        let identity = DeviceIdentity {
            client_id: "abc123".to_string(),
        };
        DiscoveryPublisher::new(&identity, "test-device".to_string())
    }

    fn entities(names: &[&str]) -> Vec<Entity> {
        let mut checks = BTreeMap::new();
        for name in names {
            checks.insert(
                name.to_string(),
                CheckConfig {
                    command: Some("true".to_string()),
                    device_class: None,
                },
            );
        }
        Entity::from_checks(&checks)
    }

    #[tokio::test]
    async fn test_announce_emits_one_config_per_entity_plus_availability() {
        let bus = MockBus::connected();
        let entities = entities(&["disk", "net"]);

        publisher().announce(&bus, &entities).await.unwrap();

        let messages = bus.published();
        // aliveness + disk + net configs, then one availability message
        assert_eq!(messages.len(), 4);
        assert!(messages[..3].iter().all(|m| m.topic.ends_with("/config") && m.retain));
        let avail = &messages[3];
        assert_eq!(avail.topic, "homeassistant/binary_sensor/abc123/availability");
        assert_eq!(avail.payload, b"online");
        assert!(avail.retain);
    }

    #[tokio::test]
    async fn test_announce_is_idempotent() {
        let bus = MockBus::connected();
        let entities = entities(&["disk"]);
        let publisher = publisher();

        publisher.announce(&bus, &entities).await.unwrap();
        let first = bus.published();
        bus.clear();
        publisher.announce(&bus, &entities).await.unwrap();
        let second = bus.published();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.topic, b.topic);
            assert_eq!(a.payload, b.payload);
        }
    }

    #[tokio::test]
    async fn test_payload_fields() {
        let entities = entities(&["disk"]);
        let disk = entities.iter().find(|e| e.name == "disk").unwrap();
        let payload = publisher().payload_for(disk);

        assert_eq!(payload.unique_id, "abc123_disk");
        assert_eq!(payload.state_topic, "homeassistant/binary_sensor/abc123_disk/state");
        assert_eq!(payload.payload_on, "ON");
        assert_eq!(payload.payload_off, "OFF");
        assert_eq!(payload.device_class, "problem");
        assert_eq!(payload.device.identifiers, vec!["abc123".to_string()]);
        assert_eq!(payload.device.name, "test-device");

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("availability_topic").is_some());
        assert!(json["device"].get("sw_version").is_some());
    }

    #[tokio::test]
    async fn test_offline_publishes_retained_offline() {
        let bus = MockBus::connected();
        publisher().offline(&bus).await.unwrap();

        let messages = bus.by_topic("homeassistant/binary_sensor/abc123/availability");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"offline");
        assert!(messages[0].retain);
    }
}
