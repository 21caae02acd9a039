//! Configuration for the APIToolkit client.
//!
//! Build an [`ApitoolkitConfig`] in code, or load it from `APITOOLKIT_*`
//! environment variables:
//!
//! ```ignore
//! use apitoolkit_core::ApitoolkitConfig;
//!
//! let config = ApitoolkitConfig::new()
//!     .api_key("my-api-key")
//!     .redact_headers(["Authorization", "Cookie"])
//!     .redact_request_body(["$.password", "$.card.number"])
//!     .redact_response_body(["$..token"])
//!     .service_version("1.4.2")
//!     .tags(["production", "eu-west"]);
//!
//! // APITOOLKIT_KEY=... APITOOLKIT_REDACT_HEADERS=authorization,cookie
//! let from_env = ApitoolkitConfig::from_env()?;
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;

/// Default APIToolkit API root.
pub const DEFAULT_ROOT_URL: &str = "https://app.apitoolkit.io";

/// Default Google Pub/Sub REST endpoint.
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Default capacity of the background publish queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default cap on how much of a body is captured, 1 MiB.
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Prefix of every recognized environment variable.
pub const ENV_PREFIX: &str = "APITOOLKIT_";

/// How events reach the ingestion sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queue events and publish them from a background task.
    ///
    /// When the queue is full new events are dropped.
    Background {
        /// Maximum number of queued events.
        capacity: usize,
    },
    /// Publish before the response is returned. Adds sink latency to every
    /// request; failures are still swallowed.
    Inline,
}

impl Default for Delivery {
    fn default() -> Self {
        Self::Background {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Configuration for the APIToolkit client.
///
/// Immutable once the client is built.
#[derive(Clone)]
pub struct ApitoolkitConfig {
    pub(crate) api_key: String,
    pub(crate) root_url: String,
    pub(crate) redact_headers: Vec<String>,
    pub(crate) redact_request_body: Vec<String>,
    pub(crate) redact_response_body: Vec<String>,
    pub(crate) debug: bool,
    pub(crate) service_version: Option<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) pubsub_endpoint: String,
    pub(crate) pubsub_access_token: Option<String>,
    pub(crate) delivery: Delivery,
    pub(crate) max_body_size: usize,
}

impl Default for ApitoolkitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape of the `APITOOLKIT_*` environment. List values are comma separated.
#[derive(Debug, Deserialize)]
struct EnvConfig {
    key: Option<String>,
    root_url: Option<String>,
    redact_headers: Option<Vec<String>>,
    redact_req_body: Option<Vec<String>>,
    redact_res_body: Option<Vec<String>>,
    debug: Option<bool>,
    service_version: Option<String>,
    tags: Option<Vec<String>>,
    pubsub_endpoint: Option<String>,
    pubsub_access_token: Option<String>,
    max_body_size: Option<usize>,
}

impl ApitoolkitConfig {
    /// Create a configuration with default values.
    ///
    /// Defaults:
    /// - Root URL: `https://app.apitoolkit.io`
    /// - Nothing redacted
    /// - Debug off
    /// - Background delivery with a queue of 1024 events
    /// - Bodies captured up to 1 MiB
    pub fn new() -> Self {
        Self {
            api_key: String::new(),
            root_url: DEFAULT_ROOT_URL.to_string(),
            redact_headers: Vec::new(),
            redact_request_body: Vec::new(),
            redact_response_body: Vec::new(),
            debug: false,
            service_version: None,
            tags: Vec::new(),
            pubsub_endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            pubsub_access_token: None,
            delivery: Delivery::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Load configuration from `APITOOLKIT_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `APITOOLKIT_KEY` | API key |
    /// | `APITOOLKIT_ROOT_URL` | API root |
    /// | `APITOOLKIT_REDACT_HEADERS` | header names |
    /// | `APITOOLKIT_REDACT_REQ_BODY` | request body paths |
    /// | `APITOOLKIT_REDACT_RES_BODY` | response body paths |
    /// | `APITOOLKIT_DEBUG` | `true` / `false` |
    /// | `APITOOLKIT_SERVICE_VERSION` | service version |
    /// | `APITOOLKIT_TAGS` | tags |
    /// | `APITOOLKIT_PUBSUB_ENDPOINT` | Pub/Sub REST endpoint |
    /// | `APITOOLKIT_PUBSUB_ACCESS_TOKEN` | Pub/Sub bearer token |
    /// | `APITOOLKIT_MAX_BODY_SIZE` | body capture cap in bytes |
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env: EnvConfig = envy::prefixed(ENV_PREFIX).from_env()?;
        let mut config = Self::new();

        if let Some(key) = env.key {
            config.api_key = key;
        }
        if let Some(root_url) = env.root_url {
            config.root_url = root_url;
        }
        if let Some(headers) = env.redact_headers {
            config = config.redact_headers(headers);
        }
        if let Some(paths) = env.redact_req_body {
            config = config.redact_request_body(paths);
        }
        if let Some(paths) = env.redact_res_body {
            config = config.redact_response_body(paths);
        }
        if let Some(debug) = env.debug {
            config.debug = debug;
        }
        config.service_version = env.service_version;
        if let Some(tags) = env.tags {
            config = config.tags(tags);
        }
        if let Some(endpoint) = env.pubsub_endpoint {
            config.pubsub_endpoint = endpoint;
        }
        config.pubsub_access_token = env.pubsub_access_token;
        if let Some(size) = env.max_body_size {
            config.max_body_size = size;
        }

        Ok(config)
    }

    /// Load a `.env` file if present, then read the environment.
    ///
    /// Variables already set in the process take precedence over the file.
    pub fn from_dotenv() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Set the API key used to fetch client metadata.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    /// Set the APIToolkit API root.
    pub fn root_url(mut self, url: impl Into<String>) -> Self {
        self.root_url = url.into();
        self
    }

    /// Set the header names whose values are redacted.
    pub fn redact_headers(mut self, headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redact_headers = clean_list(headers);
        self
    }

    /// Set the field paths redacted from request bodies.
    pub fn redact_request_body(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redact_request_body = clean_list(paths);
        self
    }

    /// Set the field paths redacted from response bodies.
    pub fn redact_response_body(
        mut self,
        paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.redact_response_body = clean_list(paths);
        self
    }

    /// Enable debug mode.
    ///
    /// Debug mode logs lifecycle messages and pretty-prints every outgoing
    /// event. It never changes what is sent.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the version reported with every event.
    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    /// Set the tags reported with every event.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = clean_list(tags);
        self
    }

    /// Override the Pub/Sub REST endpoint.
    pub fn pubsub_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.pubsub_endpoint = endpoint.into();
        self
    }

    /// Set the bearer token sent with Pub/Sub publish calls.
    pub fn pubsub_access_token(mut self, token: impl Into<String>) -> Self {
        self.pubsub_access_token = Some(token.into());
        self
    }

    /// Choose how events are delivered.
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Capture at most `size` bytes of each request and response body.
    ///
    /// Bodies are always forwarded in full. A body larger than the cap is
    /// reported as absent rather than truncated, since a cut JSON document
    /// could not be redacted.
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// The API key.
    pub fn get_api_key(&self) -> &str {
        &self.api_key
    }

    /// The APIToolkit API root.
    pub fn get_root_url(&self) -> &str {
        &self.root_url
    }

    /// Whether debug mode is on.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// The configured service version.
    pub fn get_service_version(&self) -> Option<&str> {
        self.service_version.as_deref()
    }

    /// The configured tags.
    pub fn get_tags(&self) -> &[String] {
        &self.tags
    }

    /// The configured delivery mode.
    pub fn get_delivery(&self) -> Delivery {
        self.delivery
    }

    /// The body capture cap in bytes.
    pub fn get_max_body_size(&self) -> usize {
        self.max_body_size
    }
}

/// Trim entries and drop empty ones, so `"a, b,"` from the environment
/// yields `["a", "b"]`.
fn clean_list(items: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.into().trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

impl fmt::Debug for ApitoolkitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApitoolkitConfig")
            .field("api_key", &"[REDACTED]")
            .field("root_url", &self.root_url)
            .field("redact_headers", &self.redact_headers)
            .field("redact_request_body", &self.redact_request_body)
            .field("redact_response_body", &self.redact_response_body)
            .field("debug", &self.debug)
            .field("service_version", &self.service_version)
            .field("tags", &self.tags)
            .field("pubsub_endpoint", &self.pubsub_endpoint)
            .field("pubsub_access_token", &self.pubsub_access_token.is_some())
            .field("delivery", &self.delivery)
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "APITOOLKIT_KEY",
        "APITOOLKIT_ROOT_URL",
        "APITOOLKIT_REDACT_HEADERS",
        "APITOOLKIT_REDACT_REQ_BODY",
        "APITOOLKIT_REDACT_RES_BODY",
        "APITOOLKIT_DEBUG",
        "APITOOLKIT_SERVICE_VERSION",
        "APITOOLKIT_TAGS",
        "APITOOLKIT_PUBSUB_ENDPOINT",
        "APITOOLKIT_PUBSUB_ACCESS_TOKEN",
        "APITOOLKIT_MAX_BODY_SIZE",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = ApitoolkitConfig::new();
        assert_eq!(config.root_url, DEFAULT_ROOT_URL);
        assert_eq!(config.pubsub_endpoint, DEFAULT_PUBSUB_ENDPOINT);
        assert!(config.api_key.is_empty());
        assert!(config.redact_headers.is_empty());
        assert!(!config.debug);
        assert_eq!(config.service_version, None);
        assert_eq!(
            config.delivery,
            Delivery::Background {
                capacity: DEFAULT_QUEUE_CAPACITY
            }
        );
        assert_eq!(config.max_body_size, DEFAULT_MAX_BODY_SIZE);
    }

    #[test]
    fn test_builder() {
        let config = ApitoolkitConfig::new()
            .api_key("key")
            .root_url("http://localhost:8080")
            .redact_headers(["Authorization", " cookie ", ""])
            .redact_request_body(["$.password"])
            .redact_response_body(["$.token"])
            .debug(true)
            .service_version("2.0.0")
            .tags(["prod"])
            .delivery(Delivery::Inline)
            .max_body_size(4096);

        assert_eq!(config.get_api_key(), "key");
        assert_eq!(config.get_root_url(), "http://localhost:8080");
        assert_eq!(config.redact_headers, vec!["Authorization", "cookie"]);
        assert_eq!(config.redact_request_body, vec!["$.password"]);
        assert_eq!(config.redact_response_body, vec!["$.token"]);
        assert!(config.is_debug());
        assert_eq!(config.get_service_version(), Some("2.0.0"));
        assert_eq!(config.get_tags(), ["prod".to_string()]);
        assert_eq!(config.get_delivery(), Delivery::Inline);
        assert_eq!(config.get_max_body_size(), 4096);
    }

    #[test]
    fn test_debug_output_hides_secrets() {
        let config = ApitoolkitConfig::new()
            .api_key("super-secret")
            .pubsub_access_token("ya29.token");
        let output = format!("{:?}", config);
        assert!(!output.contains("super-secret"));
        assert!(!output.contains("ya29.token"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var("APITOOLKIT_KEY", "env-key");
        std::env::set_var("APITOOLKIT_ROOT_URL", "http://127.0.0.1:9000");
        std::env::set_var("APITOOLKIT_REDACT_HEADERS", "authorization,cookie");
        std::env::set_var("APITOOLKIT_REDACT_REQ_BODY", "$.password,$.card.number");
        std::env::set_var("APITOOLKIT_DEBUG", "true");
        std::env::set_var("APITOOLKIT_TAGS", "a,b");
        std::env::set_var("APITOOLKIT_MAX_BODY_SIZE", "2048");

        let config = ApitoolkitConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.api_key, "env-key");
        assert_eq!(config.root_url, "http://127.0.0.1:9000");
        assert_eq!(config.redact_headers, vec!["authorization", "cookie"]);
        assert_eq!(
            config.redact_request_body,
            vec!["$.password", "$.card.number"]
        );
        assert!(config.redact_response_body.is_empty());
        assert!(config.debug);
        assert_eq!(config.tags, vec!["a", "b"]);
        assert_eq!(config.service_version, None);
        assert_eq!(config.max_body_size, 2048);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = ApitoolkitConfig::from_env().unwrap();
        assert_eq!(config.root_url, DEFAULT_ROOT_URL);
        assert!(config.api_key.is_empty());
        assert!(!config.debug);
        assert_eq!(config.max_body_size, DEFAULT_MAX_BODY_SIZE);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_bool() {
        clear_env();
        std::env::set_var("APITOOLKIT_DEBUG", "definitely");
        let result = ApitoolkitConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::Env(_))));
    }
}
