//! Stable device identity
//!
//! The client id is derived once from the primary network interface MAC
//! (Ethernet preferred over WiFi, WiFi over anything else), hashed and
//! truncated, then persisted next to the configuration. Every later start
//! reads the persisted value back, so the id survives hardware changes
//! made after first run.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const IDENTITY_FILE: &str = "device_identity.json";

const CLIENT_ID_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityRecord {
    client_id: String,
}

impl DeviceIdentity {
    /// Resolve the device identity: reuse a persisted record from the first
    /// directory that has one, otherwise generate a fresh id and persist it.
    /// Failure to persist a fresh id is fatal: nothing else in the system
    /// has a stable identity without it.
    pub async fn resolve(dirs: &[PathBuf]) -> Result<Self> {
        for dir in dirs {
            let path = dir.join(IDENTITY_FILE);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            match serde_json::from_slice::<IdentityRecord>(&data) {
                Ok(record) if !record.client_id.is_empty() => {
                    debug!("loaded device identity from {}", path.display());
                    return Ok(Self {
                        client_id: record.client_id,
                    });
                }
                Ok(_) => warn!("ignoring empty identity record at {}", path.display()),
                Err(e) => warn!("ignoring unreadable identity record at {}: {e}", path.display()),
            }
        }

        let client_id = generate_client_id();
        let record = IdentityRecord {
            client_id: client_id.clone(),
        };
        let data = serde_json::to_vec(&record).context("could not encode identity record")?;

        let mut last_err = None;
        for dir in dirs {
            match persist(dir, &data).await {
                Ok(()) => {
                    info!(client_id = %client_id, "generated new device identity at {}", dir.display());
                    return Ok(Self { client_id });
                }
                Err(e) => {
                    debug!("could not persist identity in {}: {e}", dir.display());
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(anyhow::Error::new(e)
                .context("could not persist freshly generated device identity")),
            None => Err(anyhow!("no identity storage directories configured")),
        }
    }
}

async fn persist(dir: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(IDENTITY_FILE), data).await
}

/// Hash the hardware seed down to a fixed-length hex client id.
fn generate_client_id() -> String {
    let seed = match primary_hardware_id() {
        Some(id) => id,
        None => {
            warn!("no network interface with a usable MAC, deriving identity from a random seed");
            uuid::Uuid::new_v4().to_string()
        }
    };
    let mut id = hex::encode(Sha256::digest(seed.as_bytes()));
    id.truncate(CLIENT_ID_LEN);
    id
}

/// MAC of the highest-priority non-loopback interface.
fn primary_hardware_id() -> Option<String> {
    let if_addrs = if_addrs::get_if_addrs().ok()?;

    let mut candidates: Vec<(String, String)> = Vec::new();
    for if_addr in if_addrs {
        if if_addr.is_loopback() || candidates.iter().any(|(name, _)| name == &if_addr.name) {
            continue;
        }
        match mac_address::mac_address_by_name(&if_addr.name) {
            Ok(Some(mac)) => candidates.push((if_addr.name.clone(), hex::encode(mac.bytes()))),
            Ok(None) => debug!("no MAC found for interface: {}", if_addr.name),
            Err(e) => debug!("error getting MAC for {}: {e}", if_addr.name),
        }
    }

    // Stable sort keeps enumeration order within a priority class.
    candidates.sort_by_key(|(name, _)| interface_rank(name));
    candidates.into_iter().next().map(|(name, mac)| {
        debug!("selected primary interface: {name}");
        mac
    })
}

/// Priority class for interface selection: Ethernet > WiFi > other.
fn interface_rank(name: &str) -> u8 {
    let name = name.to_lowercase();
    if name.starts_with("wl") || name.contains("wifi") {
        1
    } else if name.starts_with("eth") || name.starts_with("en") {
        0
    } else {
        2
    }
}
