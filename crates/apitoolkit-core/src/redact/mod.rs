//! Redaction of sensitive headers and body fields.
//!
//! Redaction runs before anything leaves the process. Header names come from
//! `redact_headers`; body fields are selected with [`FieldPath`] expressions
//! from `redact_request_body` and `redact_response_body`. Matched values are
//! replaced with [`REDACTED`].
//!
//! Bodies that are not JSON are passed through untouched: a malformed body
//! must never stop an event from being recorded.

mod headers;
mod path;

pub use headers::HeaderRedactor;
pub use path::FieldPath;

use crate::config::ApitoolkitConfig;
use crate::error::{ConfigError, RedactError};
use serde_json::Value;

/// Replacement value for redacted headers and fields.
pub const REDACTED: &str = "[CLIENT_REDACTED]";

/// Apply `paths` to a JSON document and re-serialize it.
///
/// Fails if `document` is not JSON.
pub fn try_redact_fields(document: &[u8], paths: &[FieldPath]) -> Result<Vec<u8>, RedactError> {
    let mut value: Value = serde_json::from_slice(document)?;
    for path in paths {
        path.replace(&mut value, REDACTED);
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Apply `paths` to a JSON document, returning the input unchanged if it is
/// not JSON.
pub fn redact_fields(document: &[u8], paths: &[FieldPath]) -> Vec<u8> {
    match try_redact_fields(document, paths) {
        Ok(redacted) => redacted,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping field redaction for non-JSON body");
            document.to_vec()
        }
    }
}

/// The compiled redaction settings of a client.
///
/// Built once from [`ApitoolkitConfig`] and shared read-only by every request.
#[derive(Debug, Clone, Default)]
pub struct RedactionRules {
    headers: HeaderRedactor,
    request_body: Vec<FieldPath>,
    response_body: Vec<FieldPath>,
}

impl RedactionRules {
    /// Create an empty rule set that redacts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the redaction lists of a configuration.
    pub fn from_config(config: &ApitoolkitConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            headers: HeaderRedactor::new(config.redact_headers.iter().cloned()),
            request_body: compile(&config.redact_request_body)?,
            response_body: compile(&config.redact_response_body)?,
        })
    }

    /// Header redactor shared by requests and responses.
    pub fn headers(&self) -> &HeaderRedactor {
        &self.headers
    }

    /// Paths applied to request bodies.
    pub fn request_body(&self) -> &[FieldPath] {
        &self.request_body
    }

    /// Paths applied to response bodies.
    pub fn response_body(&self) -> &[FieldPath] {
        &self.response_body
    }

    /// Redact a canonical request body.
    pub fn redact_request_body(&self, body: &[u8]) -> Vec<u8> {
        redact_fields(body, &self.request_body)
    }

    /// Redact a response body.
    pub fn redact_response_body(&self, body: &[u8]) -> Vec<u8> {
        redact_fields(body, &self.response_body)
    }
}

fn compile(exprs: &[String]) -> Result<Vec<FieldPath>, ConfigError> {
    exprs.iter().map(|expr| FieldPath::parse(expr)).collect()
}
