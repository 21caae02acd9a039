//! Testing utilities for the APIToolkit SDK
//!
//! # Mock backend
//!
//! [`MockBackend`] stands in for both remote services the SDK talks to: the
//! APIToolkit API (`GET /api/client_metadata`) and the Pub/Sub REST endpoint
//! (`POST /v1/{topic}:publish`). Point `root_url` and `pubsub_endpoint` at
//! its base URL and inspect what was published.

#![warn(missing_docs)]

pub mod response;
pub mod server;

pub use response::MockResponse;
pub use server::{default_metadata, MockBackend, PublishedMessage, RecordedRequest};
