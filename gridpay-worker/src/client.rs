use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::executor::AttemptSink;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Api(String),
}

/// Response envelope used by every gridpay-server endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

/// One pending breaker command as served by the server's worker feed.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingCommand {
    pub command_id: String,
    pub device_id: String,
    pub device_address: String,
    pub unit_id: u8,
    pub coil: u16,
    pub target_state: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// HTTP client for the server's command lifecycle endpoints.
#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn pending_commands(&self) -> Result<Vec<PendingCommand>, ClientError> {
        let envelope: Envelope<Vec<PendingCommand>> = self
            .http
            .get(format!("{}/api/commands/pending", self.base_url))
            .send()
            .await?
            .json()
            .await?;

        if !envelope.success {
            return Err(ClientError::Api(
                envelope.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(envelope.data.unwrap_or_default())
    }

    pub async fn report_result(
        &self,
        command_id: &str,
        result: &str,
        error_message: Option<String>,
    ) -> Result<(), ClientError> {
        let body = serde_json::json!({
            "result": result,
            "error_message": error_message,
        });
        let envelope: Envelope<serde_json::Value> = self
            .http
            .post(format!(
                "{}/api/commands/{}/result",
                self.base_url, command_id
            ))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if !envelope.success {
            return Err(ClientError::Api(
                envelope.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AttemptSink for ServerClient {
    async fn note_attempt(&self, command_id: &str) {
        // Attempt accounting is best-effort; a missed increment must not
        // stop the physical write.
        let url = format!("{}/api/commands/{}/attempt", self.base_url, command_id);
        match self.http.post(&url).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(command_id, status = %response.status(), "attempt accounting rejected");
            }
            Err(e) => {
                warn!(command_id, error = %e, "attempt accounting failed");
            }
        }
    }
}
