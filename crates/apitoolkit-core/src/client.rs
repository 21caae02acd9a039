//! The shared APIToolkit client.
//!
//! One [`Client`] is built at startup and shared by every clone of the
//! middleware. It owns the compiled redaction rules, the bootstrap outcome
//! and the publisher.

use crate::bootstrap::{self, ClientMetadata, TelemetryState};
use crate::capture::{CapturedRequest, CapturedResponse};
use crate::config::ApitoolkitConfig;
use crate::error::Result;
use crate::event::{Correlation, EventAssembler, TelemetryEvent, Timing};
use crate::publisher::AsyncPublisher;
use crate::redact::RedactionRules;
use crate::sink::{EventSink, PubSubSink};
use serde::Serialize;
use std::sync::Arc;

/// Identity of a running client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Project events are attributed to, when bootstrapped
    pub project_id: Option<String>,
    /// Configured service version
    pub service_version: Option<String>,
    /// Configured tags
    pub tags: Vec<String>,
}

/// Bootstrapped APIToolkit client.
#[derive(Debug)]
pub struct Client {
    config: ApitoolkitConfig,
    state: TelemetryState,
    assembler: Option<EventAssembler>,
    publisher: AsyncPublisher,
}

impl Client {
    /// Validate `config`, fetch client metadata and connect to Pub/Sub.
    ///
    /// Fails on invalid redaction paths and on a rejected API key. Any other
    /// bootstrap failure yields a degraded client that records nothing.
    pub async fn new(config: ApitoolkitConfig) -> Result<Self> {
        let rules = RedactionRules::from_config(&config)?;
        let http = bootstrap::http_client()?;

        match bootstrap::bootstrap(&http, &config).await? {
            TelemetryState::Ready(metadata) => {
                let sink = PubSubSink::new(
                    config.pubsub_endpoint.clone(),
                    config.pubsub_access_token.clone(),
                )?;
                Ok(Self::ready(config, rules, metadata, Arc::new(sink)))
            }
            TelemetryState::Degraded { reason } => Ok(Self::build_degraded(config, reason)),
        }
    }

    /// Build a ready client around an existing sink, skipping the handshake.
    pub fn with_sink(
        config: ApitoolkitConfig,
        metadata: ClientMetadata,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let rules = RedactionRules::from_config(&config)?;
        Ok(Self::ready(config, rules, metadata, sink))
    }

    /// Build a client that passes traffic through without recording it.
    pub fn degraded(config: ApitoolkitConfig, reason: impl Into<String>) -> Result<Self> {
        RedactionRules::from_config(&config)?;
        Ok(Self::build_degraded(config, reason.into()))
    }

    fn ready(
        config: ApitoolkitConfig,
        rules: RedactionRules,
        metadata: ClientMetadata,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let assembler = EventAssembler::new(rules, metadata.project_id.clone())
            .with_service_version(config.service_version.clone())
            .with_tags(config.tags.clone());
        let publisher = AsyncPublisher::new(sink, metadata.topic(), config.delivery, config.debug);

        Self {
            config,
            state: TelemetryState::Ready(metadata),
            assembler: Some(assembler),
            publisher,
        }
    }

    fn build_degraded(config: ApitoolkitConfig, reason: String) -> Self {
        let publisher = AsyncPublisher::disabled(config.debug);
        Self {
            config,
            state: TelemetryState::Degraded { reason },
            assembler: None,
            publisher,
        }
    }

    /// Whether events are being recorded.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Bootstrap outcome.
    pub fn state(&self) -> &TelemetryState {
        &self.state
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ApitoolkitConfig {
        &self.config
    }

    /// The event assembler, when ready.
    pub fn assembler(&self) -> Option<&EventAssembler> {
        self.assembler.as_ref()
    }

    /// Identity reported with every event.
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            project_id: self.state.metadata().map(|m| m.project_id.clone()),
            service_version: self.config.service_version.clone(),
            tags: self.config.tags.clone(),
        }
    }

    /// Assemble and publish the event for one exchange.
    ///
    /// Does nothing on a degraded client. Never fails.
    pub async fn record(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
        timing: Timing,
        correlation: Correlation,
    ) {
        let Some(assembler) = &self.assembler else {
            return;
        };
        let event = assembler.assemble(request, response, timing, correlation);
        self.publish(event).await;
    }

    /// Like [`record`](Self::record), for callers that cannot await.
    ///
    /// Used once a streamed response body has ended.
    pub fn record_detached(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
        timing: Timing,
        correlation: Correlation,
    ) {
        let Some(assembler) = &self.assembler else {
            return;
        };
        let event = assembler.assemble(request, response, timing, correlation);
        self.publisher.publish_detached(event);
    }

    /// Publish an already assembled event.
    pub async fn publish(&self, event: TelemetryEvent) {
        self.publisher.publish(event).await;
    }

    /// Flush queued events and stop the publisher.
    pub async fn shutdown(&self) {
        self.publisher.shutdown().await;
    }
}
