//! # apitoolkit-core
//!
//! APIToolkit observability middleware for tower-based HTTP services.
//!
//! Every request that passes through [`ApitoolkitLayer`] is captured together
//! with its response, stripped of configured secrets and published to
//! APIToolkit in the background. Nothing the middleware does can change or
//! fail the response the application produced.
//!
//! ## Features
//!
//! - Header redaction by name, case-insensitive
//! - JSON body redaction by field path (`$.user.password`, `$..token`,
//!   `items[0:2]`, `$['a','b']`)
//! - Streaming bodies pass straight through; capture is capped by
//!   `max_body_size`
//! - Background delivery through a bounded queue, or inline delivery
//! - Error reporting from handlers with [`report_error`]
//! - Configuration from code or `APITOOLKIT_*` environment variables
//!
//! ## Example
//!
//! ```ignore
//! use apitoolkit_core::{ApitoolkitConfig, ApitoolkitLayer};
//!
//! let config = ApitoolkitConfig::new()
//!     .api_key("my-api-key")
//!     .redact_headers(["Authorization", "Cookie"])
//!     .redact_request_body(["$.password"]);
//!
//! let layer = ApitoolkitLayer::new(config).await?;
//! let service = tower::ServiceBuilder::new().layer(layer).service(app);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod body;
pub mod bootstrap;
pub mod capture;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod layer;
pub mod logging;
pub mod publisher;
pub mod redact;
pub mod sink;

pub use bootstrap::{ClientMetadata, TelemetryState};
pub use capture::{CapturedRequest, CapturedResponse, RequestBody};
pub use client::{Client, ClientInfo};
pub use config::{ApitoolkitConfig, Delivery};
pub use context::{report_error, ErrorReport, MatchedRoute, PathParams, RequestContext};
pub use error::{BootstrapError, ConfigError, Error, PublishError, RedactError, Result};
pub use event::{EventAssembler, TelemetryEvent, Timing};
pub use layer::{ApitoolkitBody, ApitoolkitLayer, ApitoolkitService, BoxError};
pub use logging::init_tracing;
pub use publisher::AsyncPublisher;
pub use redact::{redact_fields, try_redact_fields, FieldPath, HeaderRedactor, RedactionRules, REDACTED};
pub use sink::{EventSink, MemorySink, PubSubSink};
