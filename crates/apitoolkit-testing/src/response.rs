//! Canned responses for the mock backend.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};

/// A canned response
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl MockResponse {
    /// `200 OK` with no headers and an empty body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status code.
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Add a header, replacing any earlier value for the same name.
    ///
    /// Panics on an invalid header name or value.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(
            HeaderName::from_bytes(key.as_bytes()).expect("invalid header name"),
            HeaderValue::from_str(value).expect("invalid header value"),
        );
        self
    }

    /// Set a raw body. Leaves the headers alone.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `body` as the response body and set
    /// `Content-Type: application/json`.
    ///
    /// Panics if `body` cannot be serialized.
    pub fn json(mut self, body: impl serde::Serialize) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = serde_json::to_vec(&body)
            .expect("Failed to serialize mock body")
            .into();
        self
    }

    pub(crate) fn to_response(&self) -> http::Result<http::Response<http_body_util::Full<Bytes>>> {
        let mut builder = http::Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder.body(http_body_util::Full::new(self.body.clone()))
    }
}
