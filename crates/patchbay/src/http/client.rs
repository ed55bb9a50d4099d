//! Outbound HTTP delivery
//!
//! Plugins reached over HTTP expose a callback endpoint under their base URL.
//! Each delivery is a fire-and-forget POST; the outcome is only logged.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use patchbay_core::{Transport, TransportAddress, TransportError, TransportKind, TransportResult};

/// Delivers payloads with `POST {base_url}{callback_path}`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    callback_path: String,
}

impl HttpTransport {
    pub fn new(callback_path: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self::with_client(client, callback_path))
    }

    pub fn with_client(client: reqwest::Client, callback_path: impl Into<String>) -> Self {
        Self {
            client,
            callback_path: callback_path.into(),
        }
    }

    /// Callback URL for a plugin's base URL
    pub fn callback_url(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.callback_path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn deliver(&self, address: &TransportAddress, payload: Value) -> TransportResult<()> {
        let TransportAddress::Http { base_url } = address else {
            return Err(TransportError::WrongAddress(address.to_string()));
        };

        let url = self.callback_url(base_url);
        let request = self.client.post(&url).json(&payload);

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Delivered to {}", url);
                }
                Ok(response) => {
                    tracing::warn!("HTTP delivery to {} failed: {}", url, response.status());
                }
                Err(e) => {
                    tracing::warn!("HTTP delivery to {} failed: {}", url, e);
                }
            }
        });

        Ok(())
    }
}
