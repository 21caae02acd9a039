//! Normalized views of the request and response being instrumented.
//!
//! The middleware never hands framework types to the event assembler. It
//! copies what it needs into [`CapturedRequest`] and [`CapturedResponse`]
//! first, so the assembler can be driven by any host that can build these.

use crate::context::{MatchedRoute, PathParams};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, REFERER};
use http::{HeaderMap, Version};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Query string or form fields: key to every value it was given.
pub type MultiMap = BTreeMap<String, Vec<String>>;

/// A request body decoded according to its content type.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum RequestBody {
    /// `application/json`
    Json(Value),
    /// `text/plain`, or a JSON body that failed to parse
    Text(String),
    /// `application/x-www-form-urlencoded` and `multipart/form-data`
    Form(MultiMap),
    /// Any other content type, or none
    #[default]
    Absent,
}

impl RequestBody {
    /// Decode a raw body.
    pub fn decode(content_type: Option<&str>, body: &[u8]) -> Self {
        let Some(content_type) = content_type else {
            return Self::Absent;
        };
        let media_type = media_type(content_type);

        match media_type.as_str() {
            "application/json" => match serde_json::from_slice(body) {
                Ok(value) => Self::Json(value),
                Err(e) => {
                    tracing::debug!(error = %e, "APIToolkit: request body is not valid JSON");
                    Self::Text(String::from_utf8_lossy(body).into_owned())
                }
            },
            "text/plain" => Self::Text(String::from_utf8_lossy(body).into_owned()),
            "application/x-www-form-urlencoded" => Self::Form(parse_pairs(body)),
            _ if content_type.to_ascii_lowercase().contains("multipart/form-data") => {
                match extract_boundary(content_type) {
                    Some(boundary) => Self::Form(parse_multipart(body, &boundary)),
                    None => Self::Form(MultiMap::new()),
                }
            }
            _ => Self::Absent,
        }
    }

    /// The JSON encoding of the decoded body. This is what gets redacted and
    /// shipped; an absent body encodes as `null`.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "APIToolkit: failed to encode request body");
                b"null".to_vec()
            }
        }
    }
}

/// Everything recorded about a request before it is handed downstream.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    /// HTTP method
    pub method: String,
    /// Request path without query string
    pub path: String,
    /// Route template, when the router reported one
    pub route: Option<String>,
    /// Path and query as received
    pub raw_url: String,
    /// Decoded query string
    pub query_params: MultiMap,
    /// Router path parameters
    pub path_params: BTreeMap<String, String>,
    /// Request headers, names in canonical form
    pub headers: BTreeMap<String, String>,
    /// Decoded body
    pub body: RequestBody,
    /// `Content-Type` header value
    pub content_type: Option<String>,
    /// HTTP version
    pub version: Version,
    /// `Host` header, or the URI authority
    pub host: Option<String>,
    /// `Referer` header
    pub referer: Option<String>,
}

impl CapturedRequest {
    /// Capture a request from its head and fully buffered body.
    pub fn from_parts(parts: &http::request::Parts, body: &[u8]) -> Self {
        let mut captured = Self::from_head(parts);
        captured.set_body(body);
        captured
    }

    /// Capture a request whose body has not been read yet. The body stays
    /// [`RequestBody::Absent`] until [`set_body`](Self::set_body) is called.
    pub fn from_head(parts: &http::request::Parts) -> Self {
        let content_type = header_str(&parts.headers, CONTENT_TYPE.as_str());
        let raw_url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let host = header_str(&parts.headers, HOST.as_str())
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));

        Self {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            route: parts
                .extensions
                .get::<MatchedRoute>()
                .map(|route| route.0.clone()),
            raw_url,
            query_params: parse_query(parts.uri.query()),
            path_params: parts
                .extensions
                .get::<PathParams>()
                .map(|params| params.0.clone())
                .unwrap_or_default(),
            headers: capture_headers(&parts.headers),
            body: RequestBody::Absent,
            content_type,
            version: parts.version,
            host,
            referer: header_str(&parts.headers, REFERER.as_str()),
        }
    }

    /// Decode `body` according to the captured content type.
    pub fn set_body(&mut self, body: &[u8]) {
        self.body = RequestBody::decode(self.content_type.as_deref(), body);
    }

    /// Pick up routing facts the handler attached to its response.
    pub fn merge_response_extensions(&mut self, extensions: &http::Extensions) {
        if let Some(route) = extensions.get::<MatchedRoute>() {
            self.route = Some(route.0.clone());
        }
        if let Some(params) = extensions.get::<PathParams>() {
            self.path_params = params.0.clone();
        }
    }

    /// Route template, falling back to the concrete path.
    pub fn url_path(&self) -> &str {
        self.route.as_deref().unwrap_or(&self.path)
    }
}

/// Everything recorded about a response.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    /// Status code
    pub status: u16,
    /// Response headers, names in canonical form
    pub headers: BTreeMap<String, String>,
    /// Fully buffered body
    pub body: Bytes,
}

impl CapturedResponse {
    /// Capture a response from its head and buffered body.
    pub fn from_parts(parts: &http::response::Parts, body: Bytes) -> Self {
        Self {
            status: parts.status.as_u16(),
            headers: capture_headers(&parts.headers),
            body,
        }
    }
}

/// Copy a header map into name/value strings.
///
/// `http` stores names lower-cased; they are restored to the canonical
/// `Content-Type` form. Repeated headers are joined with `", "`. Values that
/// are not visible ASCII are decoded lossily instead of dropped.
pub fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut captured = BTreeMap::new();
    for name in headers.keys() {
        let value = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        captured.insert(canonical_header_name(name.as_str()), value);
    }
    captured
}

/// `x-request-id` becomes `X-Request-Id`.
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Decode a query string into a multi-map.
pub fn parse_query(query: Option<&str>) -> MultiMap {
    query
        .map(|q| parse_pairs(q.as_bytes()))
        .unwrap_or_default()
}

fn parse_pairs(raw: &[u8]) -> MultiMap {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(raw).unwrap_or_default();
    let mut map = MultiMap::new();
    for (key, value) in pairs {
        map.entry(key).or_default().push(value);
    }
    map
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Extract boundary from Content-Type header
fn extract_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("boundary=")
            .map(|boundary| boundary.trim_matches('"').to_string())
    })
}

/// Collect the text fields of a multipart body. File parts are skipped.
fn parse_multipart(body: &[u8], boundary: &str) -> MultiMap {
    let mut fields = MultiMap::new();
    let delimiter = format!("--{}", boundary);
    let body_str = String::from_utf8_lossy(body);

    for part in body_str.split(&delimiter).skip(1) {
        let part = part.trim_start_matches("\r\n").trim_start_matches('\n');
        if part.is_empty() || part.starts_with("--") {
            continue;
        }

        let (headers_section, value) = match part.split_once("\r\n\r\n") {
            Some(split) => split,
            None => match part.split_once("\n\n") {
                Some(split) => split,
                None => continue,
            },
        };
        let value = value.trim_end_matches('\n').trim_end_matches('\r');

        let mut name = None;
        let mut is_file = false;
        for line in headers_section.lines() {
            let Some((key, header_value)) = line.split_once(':') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("content-disposition") {
                continue;
            }
            for param in header_value.split(';') {
                let param = param.trim();
                if let Some(n) = param.strip_prefix("name=") {
                    name = Some(n.trim_matches('"').to_string());
                } else if param.starts_with("filename=") {
                    is_file = true;
                }
            }
        }

        if let (Some(name), false) = (name, is_file) {
            fields.entry(name).or_default().push(value.to_string());
        }
    }

    fields
}
