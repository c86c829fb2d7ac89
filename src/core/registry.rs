// src/core/registry.rs

//! The master-registry collaborator. The sequencer only produces the
//! heartbeat roster text; pushing it to the registry endpoint is this
//! module's job and failures here never touch a client session.

use crate::core::RelayError;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Interval between heartbeat pushes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A registry the server advertises itself to.
#[async_trait]
pub trait Registry: Send + Sync {
    /// The challenge token the registry expects as the first heartbeat line.
    fn challenge(&self) -> String;

    /// Pushes one heartbeat payload.
    async fn advertise(&self, heartbeat: &str) -> Result<(), RelayError>;

    /// Removes this server from the registry on shutdown.
    async fn unregister(&self) -> Result<(), RelayError>;
}

/// Registry client speaking HTTP to the configured API endpoint.
pub struct HttpRegistry {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    challenge: String,
}

impl HttpRegistry {
    pub fn new(endpoint: String, api_key: String) -> Self {
        // Out-of-band traffic only; a short timeout keeps a stuck registry
        // from delaying the notifier loop.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let challenge: String = rand::thread_rng()
            .sample_iter(rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self {
            client,
            endpoint,
            api_key,
            challenge,
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    fn challenge(&self) -> String {
        self.challenge.clone()
    }

    async fn advertise(&self, heartbeat: &str) -> Result<(), RelayError> {
        let url = format!("{}/heartbeat", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("X-Api-Key", &self.api_key)
            .body(heartbeat.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::Registry(format!(
                "heartbeat rejected with status {}",
                response.status()
            )));
        }
        debug!("heartbeat accepted by registry");
        Ok(())
    }

    async fn unregister(&self) -> Result<(), RelayError> {
        let url = format!("{}/unregister", self.endpoint.trim_end_matches('/'));
        self.client
            .post(url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()
            .map_err(RelayError::from)?;
        Ok(())
    }
}
