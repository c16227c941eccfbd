//! Broker transport seam
//!
//! `MqttBus` wraps a rumqttc client plus its event loop, which runs as a
//! background task and owns reconnection. The task reports link health
//! through a watch channel; the session layer only ever probes that state,
//! it never receives a disconnect callback.

use crate::config::DaemonConfig;
use crate::entity;
use crate::identity::DeviceIdentity;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Pause between reconnect attempts after a connection error, so a dead
/// broker is not hammered.
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Ceiling on the wait for the first handshake outcome; covers hosts that
/// neither accept nor refuse.
const STARTUP_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no broker session within {0:?}")]
    Timeout(Duration),
    #[error("broker handshake failed: {0}")]
    Handshake(String),
    #[error("transport event loop terminated")]
    Closed,
    #[error("transport is not connected")]
    Disconnected,
    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),
}

/// Publish-only view of the broker session used by every component above
/// the transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Transport health as last observed by the event loop.
    fn is_connected(&self) -> bool;

    /// Monotonic count of successful handshakes in this process. A change
    /// between two probes means the session was re-established in between.
    fn session_epoch(&self) -> u64;

    /// Outcome of the very first handshake. An error is returned as-is
    /// and never retried; a broken initial configuration must surface.
    async fn await_startup(&self) -> Result<u64, BusError>;

    /// Wait until a live session is available, bounded by `wait`.
    async fn await_session(&self, wait: Duration) -> Result<u64, BusError>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Close the session. At most one close is ever issued, and it is the
    /// last operation performed on the transport.
    async fn close(&self) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Default)]
struct LinkState {
    connected: bool,
    epoch: u64,
    failures: u64,
    last_error: Option<String>,
}

pub struct MqttBus {
    client: AsyncClient,
    link: watch::Receiver<LinkState>,
}

impl MqttBus {
    /// Build the client and spawn its event-loop task. The last-will is
    /// registered here so the broker flips availability to offline by
    /// itself if the process dies without a clean close.
    pub fn connect(config: &DaemonConfig, identity: &DeviceIdentity) -> Self {
        let (host, port) = config.broker_addr();
        let mut options = MqttOptions::new(identity.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options.set_last_will(LastWill::new(
            entity::availability_topic(&identity.client_id),
            entity::AVAILABILITY_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (tx, rx) = watch::channel(LinkState::default());

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("broker session established");
                        tx.send_modify(|s| {
                            s.connected = true;
                            s.epoch += 1;
                        });
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        tx.send_modify(|s| s.connected = false);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("broker session closed");
                        tx.send_modify(|s| s.connected = false);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt connection error: {e}");
                        tx.send_modify(|s| {
                            s.connected = false;
                            s.failures += 1;
                            s.last_error = Some(e.to_string());
                        });
                        if tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
        });

        Self { client, link: rx }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    fn is_connected(&self) -> bool {
        self.link.borrow().connected
    }

    fn session_epoch(&self) -> u64 {
        self.link.borrow().epoch
    }

    async fn await_startup(&self) -> Result<u64, BusError> {
        let mut link = self.link.clone();
        let state = tokio::time::timeout(
            STARTUP_WAIT,
            link.wait_for(|s| s.connected || s.failures > 0),
        )
        .await
        .map_err(|_| BusError::Timeout(STARTUP_WAIT))?
        .map_err(|_| BusError::Closed)?
        .clone();

        if state.connected {
            Ok(state.epoch)
        } else {
            Err(BusError::Handshake(
                state.last_error.unwrap_or_else(|| "connection refused".to_string()),
            ))
        }
    }

    async fn await_session(&self, wait: Duration) -> Result<u64, BusError> {
        let mut link = self.link.clone();
        let state = tokio::time::timeout(wait, link.wait_for(|s| s.connected))
            .await
            .map_err(|_| BusError::Timeout(wait))?
            .map_err(|_| BusError::Closed)?;
        Ok(state.epoch)
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        // rumqttc queues publishes while disconnected; a queued state
        // message would arrive stale after reconnect.
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.client.disconnect().await?;
        Ok(())
    }
}
