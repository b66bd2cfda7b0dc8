//! Wire transport to the arm controller.

use async_trait::async_trait;

/// Moves one opaque command string to the device and returns its reply.
///
/// Failures are plain reason strings; the gateway classifies them.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn send(&self, base_url: &str, command: &str) -> Result<String, String>;
}

/// HTTP transport: `GET {base_url}/cmd?c=<command>`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    async fn send(&self, base_url: &str, command: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(format!("{base_url}/cmd"))
            .query(&[("c", command)])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!("device HTTP {status}: {}", body.trim()));
        }
        Ok(body)
    }
}
