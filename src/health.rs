//! Pluggable liveness checks
//!
//! A `HealthCheck` reduces to a single boolean per tick. The shell-command
//! implementation is the one the daemon ships; a TCP or HTTP probe would
//! slot in behind the same trait without touching the session loop.

use crate::entity::Entity;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Evaluate the check once. Never errors: any failure reads as not alive.
    async fn check(&self) -> bool;
}

/// Runs a shell command; exit status zero means alive. Execution is bounded
/// by a timeout so one wedged command cannot stall the whole poll tick.
pub struct ShellCheck {
    command: String,
    timeout: Duration,
}

impl ShellCheck {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl HealthCheck for ShellCheck {
    async fn check(&self) -> bool {
        let mut command = shell_command(&self.command);
        command.stdout(Stdio::null()).stderr(Stdio::null());

        match tokio::time::timeout(self.timeout, command.status()).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                debug!(command = %self.command, code = ?status.code(), "check command exited non-zero");
                false
            }
            Ok(Err(e)) => {
                warn!(command = %self.command, "check command could not run: {e}");
                false
            }
            Err(_) => {
                warn!(command = %self.command, timeout = ?self.timeout, "check command timed out");
                false
            }
        }
    }
}

/// Check for entities with no configured command.
pub struct AlwaysAlive;

#[async_trait]
impl HealthCheck for AlwaysAlive {
    async fn check(&self) -> bool {
        true
    }
}

/// Select the check implementation for an entity.
pub fn for_entity(entity: &Entity, timeout: Duration) -> Box<dyn HealthCheck> {
    match &entity.command {
        Some(command) => Box::new(ShellCheck::new(command.clone(), timeout)),
        None => Box::new(AlwaysAlive),
    }
}

fn shell_command(command: &str) -> AsyncCommand {
    if cfg!(target_os = "windows") {
        let mut cmd = AsyncCommand::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = AsyncCommand::new("bash");
        cmd.args(["-c", command]);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_exit_is_alive() {
        let check = ShellCheck::new("exit 0".to_string(), Duration::from_secs(5));
        assert!(check.check().await);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_alive() {
        let check = ShellCheck::new("exit 3".to_string(), Duration::from_secs(5));
        assert!(!check.check().await);
    }

    #[tokio::test]
    async fn test_timeout_is_not_alive() {
        let command = if cfg!(target_os = "windows") {
            "ping -n 30 127.0.0.1"
        } else {
            "sleep 30"
        };
        let check = ShellCheck::new(command.to_string(), Duration::from_millis(100));
        assert!(!check.check().await);
    }

    #[tokio::test]
    async fn test_entity_without_command_is_always_alive() {
        let entity = Entity::aliveness();
        let check = for_entity(&entity, Duration::from_secs(1));
        assert!(check.check().await);
    }
}
