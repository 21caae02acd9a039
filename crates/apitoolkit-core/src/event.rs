//! The telemetry event and how it is assembled.

use crate::capture::{CapturedRequest, CapturedResponse, MultiMap};
use crate::context::{ErrorReport, RequestContext};
use crate::redact::RedactionRules;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use http::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Value of `sdk_type` on every event produced by this crate.
pub const SDK_TYPE: &str = "RustTower";

/// One request/response exchange, as sent to APIToolkit.
///
/// Optional fields are serialized as `null` rather than skipped; the ingestion
/// side expects every key to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Decoded query string
    pub query_params: MultiMap,
    /// Router path parameters
    pub path_params: BTreeMap<String, String>,
    /// Redacted request headers
    pub request_headers: BTreeMap<String, String>,
    /// Redacted response headers
    pub response_headers: BTreeMap<String, String>,
    /// HTTP major version
    pub proto_major: u8,
    /// HTTP minor version
    pub proto_minor: u8,
    /// HTTP method
    pub method: String,
    /// Route template, or the request path when no route was reported
    pub url_path: String,
    /// Path and query as received
    pub raw_url: String,
    /// Base64 of the redacted request body.
    pub request_body: String,
    /// Base64 of the redacted response body.
    pub response_body: String,
    /// `Host` header
    pub host: String,
    /// `Referer` header, empty if absent
    pub referer: String,
    /// Always [`SDK_TYPE`]
    pub sdk_type: String,
    /// APIToolkit project id
    pub project_id: String,
    /// Response status
    pub status_code: u16,
    /// Time spent in the downstream service, in nanoseconds.
    pub duration: u64,
    /// Assembly time, RFC 3339 UTC with microseconds
    pub timestamp: String,
    /// Id of this message
    pub msg_id: Option<Uuid>,
    /// Id of the message that caused this one
    pub parent_id: Option<String>,
    /// Errors reported by the handler
    pub errors: Vec<ErrorReport>,
    /// Version of the instrumented service
    pub service_version: Option<String>,
    /// Tags of the instrumented service
    pub tags: Vec<String>,
}

impl TelemetryEvent {
    /// Decode the redacted request body.
    pub fn decoded_request_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.request_body)
    }

    /// Decode the redacted response body.
    pub fn decoded_response_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.response_body)
    }
}

/// Instants taken around the downstream call.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Just before the downstream call
    pub start: Instant,
    /// Just after the downstream call resolved
    pub end: Instant,
}

impl Timing {
    /// Start timing now.
    pub fn start() -> Self {
        let now = Instant::now();
        Self { start: now, end: now }
    }

    /// Stop timing now.
    pub fn finish(mut self) -> Self {
        self.end = Instant::now();
        self
    }

    /// Elapsed time; zero if the instants are out of order.
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    /// Elapsed time in nanoseconds, saturating at `u64::MAX`.
    pub fn duration_nanos(&self) -> u64 {
        u64::try_from(self.duration().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Per-request identifiers and reported errors.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    /// Message id of the request
    pub msg_id: Option<Uuid>,
    /// Parent message id
    pub parent_id: Option<String>,
    /// Errors reported while handling the request
    pub errors: Vec<ErrorReport>,
}

impl From<&RequestContext> for Correlation {
    fn from(context: &RequestContext) -> Self {
        Self {
            msg_id: Some(context.msg_id()),
            parent_id: context.parent_id().map(str::to_string),
            errors: context.errors(),
        }
    }
}

/// Builds [`TelemetryEvent`]s for one project.
#[derive(Debug, Clone)]
pub struct EventAssembler {
    rules: RedactionRules,
    project_id: String,
    service_version: Option<String>,
    tags: Vec<String>,
}

impl EventAssembler {
    /// Create an assembler for a project.
    pub fn new(rules: RedactionRules, project_id: impl Into<String>) -> Self {
        Self {
            rules,
            project_id: project_id.into(),
            service_version: None,
            tags: Vec::new(),
        }
    }

    /// Report a service version with every event.
    pub fn with_service_version(mut self, version: Option<String>) -> Self {
        self.service_version = version;
        self
    }

    /// Report tags with every event.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// The redaction rules applied to every event.
    pub fn rules(&self) -> &RedactionRules {
        &self.rules
    }

    /// The project every event is attributed to.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Build the event for one exchange.
    ///
    /// Headers and bodies are redacted here; nothing unredacted is copied
    /// into the event.
    pub fn assemble(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
        timing: Timing,
        correlation: Correlation,
    ) -> TelemetryEvent {
        let headers = self.rules.headers();
        let request_body = self
            .rules
            .redact_request_body(&request.body.to_canonical_bytes());
        let response_body = self.rules.redact_response_body(&response.body);
        let (proto_major, proto_minor) = proto_version(request.version);

        TelemetryEvent {
            query_params: request.query_params.clone(),
            path_params: request.path_params.clone(),
            request_headers: headers.redact(&request.headers),
            response_headers: headers.redact(&response.headers),
            proto_major,
            proto_minor,
            method: request.method.clone(),
            url_path: request.url_path().to_string(),
            raw_url: request.raw_url.clone(),
            request_body: STANDARD.encode(request_body),
            response_body: STANDARD.encode(response_body),
            host: request.host.clone().unwrap_or_default(),
            referer: request.referer.clone().unwrap_or_default(),
            sdk_type: SDK_TYPE.to_string(),
            project_id: self.project_id.clone(),
            status_code: response.status,
            duration: timing.duration_nanos(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            msg_id: correlation.msg_id,
            parent_id: correlation.parent_id,
            errors: correlation.errors,
            service_version: self.service_version.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Major and minor protocol version numbers.
pub fn proto_version(version: Version) -> (u8, u8) {
    match version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_11 => (1, 1),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}
