//! Request-scoped values shared between the middleware and handlers.
//!
//! The middleware inserts a [`RequestContext`] into every request's
//! extensions. Handlers use it (or [`report_error`]) to attach errors to the
//! event for that request. Routers insert [`MatchedRoute`] and [`PathParams`]
//! so events can be grouped by route template instead of concrete URL.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Route template that matched the request, e.g. `/users/{id}`.
///
/// Insert it into the request extensions (before the middleware runs) or the
/// response extensions (from the handler). The response value wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRoute(pub String);

/// Path parameters extracted by the router, e.g. `{"id": "42"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(pub BTreeMap<String, String>);

impl<K, V> FromIterator<(K, V)> for PathParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// An error reported while handling a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// When the error was reported (RFC 3339, UTC).
    pub when: String,
    /// Type of the reported error.
    pub error_type: String,
    /// Type of the innermost error in the `source()` chain.
    pub root_error_type: String,
    /// Display message of the reported error.
    pub message: String,
    /// Display message of the innermost error.
    pub root_error_message: String,
    /// Captured backtrace, empty unless `RUST_BACKTRACE` is set.
    pub stack_trace: String,
}

impl ErrorReport {
    /// Build a report from an error value.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + 'static,
    {
        let mut root: &(dyn StdError + 'static) = error;
        while let Some(source) = root.source() {
            root = source;
        }

        let error_type = std::any::type_name::<E>().to_string();
        let root_error_type = if error.source().is_none() {
            error_type.clone()
        } else {
            debug_type_name(root)
        };

        let backtrace = std::backtrace::Backtrace::capture();
        let stack_trace = match backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => backtrace.to_string(),
            _ => String::new(),
        };

        Self {
            when: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            error_type,
            root_error_type,
            message: error.to_string(),
            root_error_message: root.to_string(),
            stack_trace,
        }
    }
}

/// Best-effort type name of a type-erased error: the leading identifier of
/// its `Debug` output, e.g. `ParseIntError` or `Custom`.
fn debug_type_name(error: &dyn StdError) -> String {
    let debug = format!("{:?}", error);
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() {
        "Error".to_string()
    } else {
        name
    }
}

/// Per-request correlation state.
///
/// Cheap to clone; clones share the same error list.
#[derive(Debug, Clone)]
pub struct RequestContext {
    msg_id: Uuid,
    parent_id: Option<String>,
    errors: Arc<Mutex<Vec<ErrorReport>>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Create a context with a fresh message id.
    pub fn new() -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            parent_id: None,
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Link this request to a parent message.
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// The message id sent as `msg_id`.
    pub fn msg_id(&self) -> Uuid {
        self.msg_id
    }

    /// The parent message id, if any.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Attach an error to this request's event.
    pub fn report<E>(&self, error: &E)
    where
        E: StdError + 'static,
    {
        self.record(ErrorReport::from_error(error));
    }

    /// Attach a prepared report to this request's event.
    pub fn record(&self, report: ErrorReport) {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(report);
    }

    /// Errors reported so far.
    pub fn errors(&self) -> Vec<ErrorReport> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Attach an error to the event of the request being handled.
///
/// Returns `false` when the request did not pass through the APIToolkit
/// middleware, in which case the error is dropped.
///
/// ```ignore
/// async fn handler(req: Request<ApitoolkitBody>) -> Result<Response<Full<Bytes>>, Infallible> {
///     if let Err(e) = charge_card(&req).await {
///         apitoolkit_core::report_error(&req, &e);
///     }
///     // ...
/// }
/// ```
pub fn report_error<B, E>(request: &http::Request<B>, error: &E) -> bool
where
    E: StdError + 'static,
{
    match request.extensions().get::<RequestContext>() {
        Some(context) => {
            context.report(error);
            true
        }
        None => {
            tracing::debug!(error = %error, "APIToolkit: no request context, error not reported");
            false
        }
    }
}
