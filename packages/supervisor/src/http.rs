// ABOUTME: HTTP client for the Metro dev server endpoints
// ABOUTME: Status probe, app reload and bundler cache reset with short timeouts

use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const DEFAULT_HOST: &str = "localhost";

/// Client for `/status`, `/reload` and `/reset-cache` on a local dev server.
///
/// Every call is best-effort: transport failures come back as `Err` for the
/// caller to log, never as panics.
#[derive(Debug, Clone)]
pub struct DevServerClient {
    client: Client,
    host: String,
}

impl DevServerClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_host(DEFAULT_HOST, timeout)
    }

    pub fn with_host(host: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                debug!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            client,
            host: host.into(),
        }
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }

    /// `GET /status`; true when the server answers with a 2xx
    pub async fn status(&self, port: u16) -> Result<bool, reqwest::Error> {
        let response = self.client.get(self.url(port, "/status")).send().await?;
        Ok(response.status().is_success())
    }

    /// Liveness as seen over HTTP. Transport errors count as dead.
    pub async fn is_alive(&self, port: u16) -> bool {
        match self.status(port).await {
            Ok(alive) => alive,
            Err(e) => {
                debug!("Status probe on port {} failed: {}", port, e);
                false
            }
        }
    }

    /// `POST /reload`; asks connected apps to reload their bundle
    pub async fn reload(&self, port: u16) -> Result<bool, reqwest::Error> {
        self.post(port, "/reload").await
    }

    /// `POST /reset-cache`; clears the bundler's transform cache
    pub async fn reset_cache(&self, port: u16) -> Result<bool, reqwest::Error> {
        self.post(port, "/reset-cache").await
    }

    async fn post(&self, port: u16, path: &str) -> Result<bool, reqwest::Error> {
        let response = self.client.post(self.url(port, path)).send().await?;
        Ok(response.status().is_success())
    }
}
