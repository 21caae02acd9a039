//! Startup handshake with the APIToolkit API.
//!
//! The client metadata tells the SDK which project it reports for and which
//! Pub/Sub topic to publish to. Only an invalid API key stops the host
//! application from starting; any other failure leaves telemetry disabled.

use crate::config::ApitoolkitConfig;
use crate::error::BootstrapError;
use crate::sink::topic_name;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Timeout for the metadata request.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Project and topic details returned by `/api/client_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// APIToolkit project the events belong to
    pub project_id: String,
    /// GCP project hosting the ingestion topic
    pub pubsub_project_id: String,
    /// Ingestion topic id
    pub topic_id: String,
    /// Service account credentials for the topic
    pub pubsub_push_service_account: Value,
}

impl ClientMetadata {
    /// Full topic name, `projects/{pubsub_project_id}/topics/{topic_id}`.
    pub fn topic(&self) -> String {
        topic_name(&self.pubsub_project_id, &self.topic_id)
    }
}

/// Outcome of the startup handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryState {
    /// Metadata fetched; events will be published.
    Ready(ClientMetadata),
    /// Metadata unavailable; traffic passes through uninstrumented.
    Degraded {
        /// Why telemetry is off
        reason: String,
    },
}

impl TelemetryState {
    /// Whether telemetry is active.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The fetched metadata, when ready.
    pub fn metadata(&self) -> Option<&ClientMetadata> {
        match self {
            Self::Ready(metadata) => Some(metadata),
            Self::Degraded { .. } => None,
        }
    }
}

/// Fetch client metadata from `{root_url}/api/client_metadata`.
pub async fn fetch_client_metadata(
    client: &reqwest::Client,
    root_url: &str,
    api_key: &str,
) -> Result<ClientMetadata, BootstrapError> {
    let url = format!("{}/api/client_metadata", root_url.trim_end_matches('/'));

    let response = client.get(&url).bearer_auth(api_key).send().await?;
    let status = response.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(BootstrapError::Unauthorized);
    }
    if !status.is_success() {
        return Err(BootstrapError::Status(status.as_u16()));
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| BootstrapError::Metadata(e.to_string()))
}

/// Run the handshake for a configuration.
///
/// Returns an error only for failures that must abort startup; everything
/// else is logged and mapped to [`TelemetryState::Degraded`].
pub async fn bootstrap(
    client: &reqwest::Client,
    config: &ApitoolkitConfig,
) -> Result<TelemetryState, BootstrapError> {
    match fetch_client_metadata(client, &config.root_url, &config.api_key).await {
        Ok(metadata) => {
            if config.debug {
                tracing::info!(
                    project_id = %metadata.project_id,
                    topic = %metadata.topic(),
                    "APIToolkit: client initialized"
                );
            }
            Ok(TelemetryState::Ready(metadata))
        }
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "APIToolkit: bootstrap rejected");
            Err(e)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                root_url = %config.root_url,
                "APIToolkit: telemetry disabled, traffic will not be recorded"
            );
            Ok(TelemetryState::Degraded {
                reason: e.to_string(),
            })
        }
    }
}

/// HTTP client used for the handshake.
pub fn http_client() -> Result<reqwest::Client, BootstrapError> {
    Ok(reqwest::Client::builder()
        .timeout(BOOTSTRAP_TIMEOUT)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_topic() {
        let metadata: ClientMetadata = serde_json::from_value(json!({
            "project_id": "00000000-0000-0000-0000-000000000000",
            "pubsub_project_id": "past-3",
            "topic_id": "apitoolkit-go-client",
            "pubsub_push_service_account": {"type": "service_account"}
        }))
        .unwrap();

        assert_eq!(metadata.topic(), "projects/past-3/topics/apitoolkit-go-client");
    }

    #[test]
    fn test_metadata_missing_field_rejected() {
        let result = serde_json::from_value::<ClientMetadata>(json!({"project_id": "p"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_state_accessors() {
        let degraded = TelemetryState::Degraded {
            reason: "status 500".into(),
        };
        assert!(!degraded.is_ready());
        assert!(degraded.metadata().is_none());
    }
}
