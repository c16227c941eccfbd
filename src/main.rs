//! mqtt-alive-agent - liveness checks as Home Assistant binary sensors
//!
//! A small daemon that periodically runs configured shell health checks and
//! republishes their state over MQTT:
//! - Auto-discovery announcement per check on every (re)connection
//! - ON/OFF state publication on a fixed cadence
//! - Retained availability with a broker-side last-will fallback
//! - Graceful shutdown on SIGINT/SIGTERM

mod bus;
mod config;
mod discovery;
mod entity;
mod health;
mod identity;
mod session;
mod state;

use anyhow::{Context, Result};
use bus::MqttBus;
use config::DaemonConfig;
use entity::Entity;
use identity::DeviceIdentity;
use session::SessionManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting mqtt-alive-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load()
        .await
        .context("configuration error")?;
    let store_dirs = config::search_dirs();
    let identity = DeviceIdentity::resolve(&store_dirs)
        .await
        .context("device identity error")?;
    let entities = Entity::from_checks(&config.checks);
    info!(
        client_id = %identity.client_id,
        entities = entities.len(),
        broker = %config.mqtt_broker,
        "agent identity ready"
    );

    let bus = MqttBus::connect(&config, &identity);
    let mut session = SessionManager::new(bus, &config, &identity, entities);
    session
        .start()
        .await
        .context("could not reach the MQTT broker")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(signal) => info!("received {signal}, shutting down"),
                Err(e) => {
                    // Without signal delivery the daemon can still be
                    // stopped externally; keep running.
                    error!("could not install signal handlers: {e}");
                    return;
                }
            }
            cancel.cancel();
        });
    }

    session.run(cancel).await
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(received)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
