//! Device gateway: registration, connectivity and timed command dispatch.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::device::{DeviceCommand, DeviceTransport};
use crate::error::DeviceError;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://)?[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::\d{1,5})?/?$")
        .expect("address pattern is valid")
});

/// Connectivity as seen by observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub connected: bool,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug)]
struct Registration {
    base_url: String,
    generation: u64,
}

#[derive(Debug, Default)]
struct GatewayState {
    registration: Option<Registration>,
    generation: u64,
}

/// Single entry point for talking to the arm controller.
///
/// Knows nothing about warehouse semantics. Does not retry.
pub struct DeviceGateway {
    transport: Arc<dyn DeviceTransport>,
    timeout: Duration,
    state: Mutex<GatewayState>,
    status: watch::Sender<DeviceStatus>,
}

/// Turn a user-supplied `host[:port]` into a base URL.
pub fn normalize_address(address: &str) -> Result<String, DeviceError> {
    let trimmed = address.trim();
    if !ADDRESS_RE.is_match(trimmed) {
        return Err(DeviceError::InvalidAddress(address.to_string()));
    }
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("http://{trimmed}"))
    }
}

impl DeviceGateway {
    pub fn new(transport: Arc<dyn DeviceTransport>, timeout: Duration) -> Self {
        let (status, _) = watch::channel(DeviceStatus::default());
        Self {
            transport,
            timeout,
            state: Mutex::new(GatewayState::default()),
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the target address and mark the device connected. Last call wins.
    pub fn register(&self, address: &str) -> Result<DeviceStatus, DeviceError> {
        let base_url = normalize_address(address)?;
        {
            let mut state = self.lock();
            state.generation += 1;
            state.registration = Some(Registration {
                base_url: base_url.clone(),
                generation: state.generation,
            });
        }
        let status = DeviceStatus {
            connected: true,
            address: Some(base_url),
        };
        self.status.send_replace(status.clone());
        info!(address = ?status.address, "Device registered");
        Ok(status)
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    /// Receive every connectivity change.
    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    /// Send one command and wait (bounded by the timeout) for the reply.
    pub async fn send_command(&self, command: &DeviceCommand) -> Result<String, DeviceError> {
        let (base_url, generation) = {
            let state = self.lock();
            match &state.registration {
                Some(reg) => (reg.base_url.clone(), reg.generation),
                None => return Err(DeviceError::Unregistered),
            }
        };

        let text = command.to_string();
        debug!(command = %text, target = %base_url, "Dispatching device command");

        let outcome = tokio::time::timeout(self.timeout, self.transport.send(&base_url, &text)).await;
        let reason = match outcome {
            Ok(Ok(response)) => {
                self.set_connected(generation, true);
                return Ok(response);
            }
            Ok(Err(reason)) => reason,
            Err(_) => format!("timed out after {}ms", self.timeout.as_millis()),
        };

        warn!(command = %text, target = %base_url, reason = %reason, "Device command failed");
        self.set_connected(generation, false);
        Err(DeviceError::CommFailure { reason })
    }

    /// Update connectivity, unless a newer registration replaced the one the
    /// command was sent to.
    fn set_connected(&self, generation: u64, connected: bool) {
        if self.lock().generation != generation {
            return;
        }
        self.status.send_if_modified(|status| {
            if status.connected == connected {
                false
            } else {
                status.connected = connected;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::ScriptedTransport;

    #[test]
    fn address_normalization() {
        assert_eq!(normalize_address("192.168.1.50").unwrap(), "http://192.168.1.50");
        assert_eq!(
            normalize_address(" esp32.local:8080/ ").unwrap(),
            "http://esp32.local:8080"
        );
        assert_eq!(
            normalize_address("https://arm.example").unwrap(),
            "https://arm.example"
        );
        assert!(normalize_address("").is_err());
        assert!(normalize_address("bad host").is_err());
        assert!(normalize_address("ftp://x").is_err());
    }

    #[tokio::test]
    async fn unregistered_gateway_rejects_commands() {
        let transport = Arc::new(ScriptedTransport::new());
        let gw = DeviceGateway::new(transport.clone(), Duration::from_secs(1));
        let err = gw.send_command(&DeviceCommand::Home).await.unwrap_err();
        assert_eq!(err, DeviceError::Unregistered);
        assert!(transport.sent().is_empty());
        assert!(!gw.status().connected);
    }

    #[tokio::test]
    async fn failure_flips_connectivity_and_reregistration_restores_it() {
        let transport = Arc::new(ScriptedTransport::new());
        let gw = DeviceGateway::new(transport.clone(), Duration::from_secs(1));
        gw.register("10.0.0.1").unwrap();

        transport.fail_next(1, "connection refused");
        let err = gw.send_command(&DeviceCommand::Pick).await.unwrap_err();
        assert!(matches!(err, DeviceError::CommFailure { ref reason } if reason.contains("refused")));
        assert!(!gw.status().connected);

        gw.register("10.0.0.2:81").unwrap();
        assert!(gw.status().connected);

        gw.send_command(&DeviceCommand::Home).await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, "http://10.0.0.2:81");
        assert_eq!(sent[1].1, "HOME");
    }

    #[tokio::test]
    async fn timeout_is_a_comm_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.hold();
        let gw = DeviceGateway::new(transport.clone(), Duration::from_millis(30));
        gw.register("10.0.0.1").unwrap();

        let err = gw.send_command(&DeviceCommand::Home).await.unwrap_err();
        assert!(matches!(err, DeviceError::CommFailure { ref reason } if reason.contains("timed out")));
        assert!(!gw.status().connected);
    }

    #[tokio::test]
    async fn stale_failure_does_not_disconnect_new_registration() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.hold();
        transport.fail_next(1, "reset by peer");
        let gw = Arc::new(DeviceGateway::new(transport.clone(), Duration::from_secs(2)));
        gw.register("10.0.0.1").unwrap();

        let pending = {
            let gw = Arc::clone(&gw);
            tokio::spawn(async move { gw.send_command(&DeviceCommand::Pick).await })
        };
        transport.wait_entered().await;

        gw.register("10.0.0.9").unwrap();
        transport.release();

        assert!(pending.await.unwrap().is_err());
        let status = gw.status();
        assert!(status.connected);
        assert_eq!(status.address.as_deref(), Some("http://10.0.0.9"));
    }

    #[tokio::test]
    async fn subscribers_see_connectivity_changes() {
        let transport = Arc::new(ScriptedTransport::new());
        let gw = DeviceGateway::new(transport.clone(), Duration::from_secs(1));
        let mut rx = gw.subscribe();

        gw.register("10.0.0.1").unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().connected);

        transport.fail_next(1, "boom");
        let _ = gw.send_command(&DeviceCommand::Home).await;
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().connected);
    }
}
