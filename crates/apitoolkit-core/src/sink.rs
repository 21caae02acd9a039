//! Destinations for serialized events.
//!
//! [`PubSubSink`] talks to the Google Pub/Sub REST API. [`MemorySink`] keeps
//! everything in memory for tests.

use crate::error::PublishError;
use crate::event::TelemetryEvent;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timeout applied to every publish call.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Full Pub/Sub topic name for a project and topic id.
pub fn topic_name(project: &str, topic: &str) -> String {
    format!("projects/{}/topics/{}", project, topic)
}

/// A publish primitive for serialized events.
///
/// Implementations own delivery guarantees; the publisher calls `publish`
/// once per event and never retries.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Publish one message to `topic`, returning the id the sink assigned.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, PublishError>;
}

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<PubSubMessage>,
}

#[derive(Serialize)]
struct PubSubMessage {
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Publishes through the Pub/Sub REST API.
///
/// Each event becomes one message posted to
/// `{endpoint}/v1/{topic}:publish`, its data the base64 of the event JSON.
#[derive(Clone)]
pub struct PubSubSink {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl PubSubSink {
    /// Create a sink for a Pub/Sub endpoint.
    pub fn new(
        endpoint: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, endpoint, access_token))
    }

    /// Create a sink that reuses an existing HTTP client.
    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn publish_url(&self, topic: &str) -> String {
        format!("{}/v1/{}:publish", self.endpoint, topic)
    }
}

#[async_trait]
impl EventSink for PubSubSink {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, PublishError> {
        let body = PublishRequest {
            messages: vec![PubSubMessage {
                data: STANDARD.encode(data),
            }],
        };

        let mut request = self.client.post(self.publish_url(topic)).json(&body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let published: PublishResponse = response.json().await?;
        Ok(published.message_ids.into_iter().next().unwrap_or_default())
    }
}

impl std::fmt::Debug for PubSubSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSink")
            .field("endpoint", &self.endpoint)
            .field("access_token", &self.access_token.is_some())
            .finish()
    }
}

/// A message captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkMessage {
    /// Topic the message was published to
    pub topic: String,
    /// Raw message payload
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: Vec<SinkMessage>,
    attempts: usize,
}

/// In-memory sink for tests.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    failing: bool,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink that rejects every message (but still counts attempts).
    pub fn failing() -> Self {
        Self {
            state: Arc::default(),
            failing: true,
        }
    }

    /// Messages accepted so far.
    pub fn messages(&self) -> Vec<SinkMessage> {
        self.lock().messages.clone()
    }

    /// Accepted messages decoded as events. Undecodable payloads are skipped.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock()
            .messages
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.data).ok())
            .collect()
    }

    /// Number of publish calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, PublishError> {
        let mut state = self.lock();
        state.attempts += 1;
        if self.failing {
            return Err(PublishError::Rejected {
                status: 503,
                body: "memory sink is failing".to_string(),
            });
        }
        state.messages.push(SinkMessage {
            topic: topic.to_string(),
            data,
        });
        Ok(state.messages.len().to_string())
    }
}
