//! Broker session lifecycle and the poll loop
//!
//! Exactly one logical session per entity set. The manager never receives
//! a disconnect callback; it probes transport health at the start of each
//! tick, re-announces discovery whenever the session epoch has advanced,
//! and runs every health check before sleeping until the next tick.
//! Shutdown is a cancellation signal observed between ticks.

use crate::bus::MessageBus;
use crate::config::DaemonConfig;
use crate::discovery::DiscoveryPublisher;
use crate::entity::Entity;
use crate::health::{self, HealthCheck};
use crate::identity::DeviceIdentity;
use crate::state::StatePublisher;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bound on the pre-tick wait for the event loop to repair a lost session.
/// A failed wait defers to the next tick, so reconnect attempts stay
/// rate-limited to one per poll interval.
const SESSION_WAIT: Duration = Duration::from_secs(10);

/// Grace period for the final close.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

pub struct SessionManager<B: MessageBus> {
    bus: B,
    discovery: DiscoveryPublisher,
    states: StatePublisher,
    entities: Vec<Entity>,
    checks: Vec<Box<dyn HealthCheck>>,
    poll_interval: Duration,
    state: SessionState,
    announced_epoch: u64,
    closed: bool,
}

impl<B: MessageBus> SessionManager<B> {
    pub fn new(
        bus: B,
        config: &DaemonConfig,
        identity: &DeviceIdentity,
        entities: Vec<Entity>,
    ) -> Self {
        let command_timeout = Duration::from_secs(config.command_timeout_secs);
        let checks = entities
            .iter()
            .map(|entity| health::for_entity(entity, command_timeout))
            .collect();

        Self {
            bus,
            discovery: DiscoveryPublisher::new(identity, config.device_display_name()),
            states: StatePublisher::new(identity.client_id.clone()),
            entities,
            checks,
            poll_interval: Duration::from_secs(config.interval_secs),
            state: SessionState::default(),
            announced_epoch: 0,
            closed: false,
        }
    }

    /// Block until the first session is up. A failed first handshake is
    /// fatal: a broken initial configuration must surface immediately, so
    /// there is no retry here.
    pub async fn start(&mut self) -> Result<()> {
        self.state = SessionState::Connecting;
        let epoch = self
            .bus
            .await_startup()
            .await
            .context("initial broker connection failed")?;
        self.state = SessionState::Connected;
        info!(epoch, "connected to broker");
        Ok(())
    }

    /// Tick loop until cancelled, then shut down. Cancellation is observed
    /// between ticks or concurrently with the sleep; an in-progress tick
    /// always completes first.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.ensure_session().await {
                        continue;
                    }
                    self.poll_tick().await;
                }
                _ = cancel.cancelled() => {
                    info!("termination requested, leaving poll loop");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Pre-tick health probe. Repairs a lost session if the event loop has
    /// one to offer, and runs the on-connect protocol whenever the session
    /// epoch advanced; the announce must complete before any state
    /// publication of that session.
    async fn ensure_session(&mut self) -> bool {
        if !self.bus.is_connected() {
            self.state = SessionState::Connecting;
            warn!("broker session lost, waiting for reconnect");
            match self.bus.await_session(SESSION_WAIT).await {
                Ok(epoch) => info!(epoch, "broker session repaired"),
                Err(e) => {
                    self.state = SessionState::Disconnected;
                    error!("reconnect failed, retrying next tick: {e}");
                    return false;
                }
            }
        }
        self.state = SessionState::Connected;

        let epoch = self.bus.session_epoch();
        if epoch != self.announced_epoch {
            if let Err(e) = self.discovery.announce(&self.bus, &self.entities).await {
                error!("announce failed, deferring tick: {e}");
                return false;
            }
            self.announced_epoch = epoch;
        }
        true
    }

    /// One synchronous round over all entities. Entities are evaluated
    /// independently: a failing or slow command maps to OFF for its own
    /// entity and never blocks the others.
    async fn poll_tick(&self) {
        for (entity, check) in self.entities.iter().zip(self.checks.iter()) {
            let alive = check.check().await;
            if let Err(e) = self.states.publish(&self.bus, entity, alive).await {
                error!("{e}");
            }
        }
    }

    /// Idempotent teardown: one offline publish, one close, nothing after.
    /// Both are best effort so shutdown completes even with the broker
    /// unreachable.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = SessionState::Disconnected;

        info!("shutting down, flipping availability offline");
        if let Err(e) = self.discovery.offline(&self.bus).await {
            warn!("offline publish failed: {e}");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.bus.close()).await {
            Ok(Ok(())) => info!("broker session closed"),
            Ok(Err(e)) => warn!("session close failed: {e}"),
            Err(_) => warn!("session close timed out after {SHUTDOWN_GRACE:?}"),
        }
    }
}
