//! Per-entity state publication

use crate::bus::MessageBus;
use crate::entity::{self, Entity};
use anyhow::{Context, Result};
use rumqttc::QoS;
use tracing::debug;

/// Emits the boolean state of one entity as a transient message. Calls are
/// independent; nothing is batched or deduplicated, the next tick's publish
/// supersedes this one.
pub struct StatePublisher {
    client_id: String,
}

impl StatePublisher {
    pub fn new(client_id: String) -> Self {
        Self { client_id }
    }

    pub async fn publish<B: MessageBus>(&self, bus: &B, entity: &Entity, alive: bool) -> Result<()> {
        let payload = if alive {
            entity::PAYLOAD_ON
        } else {
            entity::PAYLOAD_OFF
        };
        let topic = entity.state_topic(&self.client_id);
        bus.publish(&topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("state publish failed for {}", entity.name))?;
        debug!(topic = %topic, payload, "published state");
        Ok(())
    }
}
