//! Tower integration.
//!
//! [`ApitoolkitLayer`] wraps any `tower::Service` that accepts
//! `http::Request<ApitoolkitBody>`, so it slots into hyper, axum or tonic
//! stacks alike.
//!
//! Bodies stream through untouched. While the client is ready, up to
//! `max_body_size` bytes of each body are copied for the event; a response
//! whose length is not known up front is recorded once its body has been
//! read to the end or dropped.
//!
//! ```ignore
//! use apitoolkit_core::{ApitoolkitConfig, ApitoolkitLayer};
//! use tower::ServiceBuilder;
//!
//! let apitoolkit = ApitoolkitLayer::new(ApitoolkitConfig::from_env()?).await?;
//! let service = ServiceBuilder::new()
//!     .layer(apitoolkit.clone())
//!     .service(my_service);
//!
//! // on shutdown
//! apitoolkit.shutdown().await;
//! ```

use crate::body::{CaptureBody, CaptureBuffer, RecordingBody};
use crate::capture::{capture_headers, CapturedRequest, CapturedResponse};
use crate::client::Client;
use crate::config::ApitoolkitConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::event::{Correlation, Timing};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Error type of [`ApitoolkitService`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased future of the wrapped service.
type InnerFuture<S, ResBody> = Pin<
    Box<dyn Future<Output = std::result::Result<Response<ResBody>, <S as Service<Request<ApitoolkitBody>>>::Error>> + Send>,
>;

/// Body type handed to the wrapped service and returned to the caller.
pub type ApitoolkitBody = UnsyncBoxBody<Bytes, BoxError>;

/// Layer that records every request passing through it.
///
/// Clones share one [`Client`].
#[derive(Debug, Clone)]
pub struct ApitoolkitLayer {
    client: Arc<Client>,
}

impl ApitoolkitLayer {
    /// Bootstrap a client and wrap it in a layer.
    ///
    /// Fails only on invalid configuration or a rejected API key.
    pub async fn new(config: ApitoolkitConfig) -> Result<Self> {
        Ok(Self::from_client(Client::new(config).await?))
    }

    /// Wrap an already built client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// The shared client.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Flush queued events.
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
    }
}

impl<S> Layer<S> for ApitoolkitLayer {
    type Service = ApitoolkitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApitoolkitService {
            inner,
            client: self.client.clone(),
        }
    }
}

/// Service produced by [`ApitoolkitLayer`].
#[derive(Debug, Clone)]
pub struct ApitoolkitService<S> {
    inner: S,
    client: Arc<Client>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ApitoolkitService<S>
where
    S: Service<Request<ApitoolkitBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<ApitoolkitBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the service that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let client = self.client.clone();

        Box::pin(async move {
            let debug = client.config().is_debug();

            if !client.is_ready() {
                if debug {
                    tracing::debug!(
                        "APIToolkit: Project ID not set (restart your server to fix)"
                    );
                }
                let future: InnerFuture<S, ResBody> = Box::pin(inner.call(req.map(boxed)));
                let response = future
                    .await
                    .map_err(Into::<BoxError>::into)?;
                return Ok(response.map(boxed));
            }

            let limit = client.config().get_max_body_size();
            let context = RequestContext::new();
            let (mut parts, body) = req.into_parts();
            parts.extensions.insert(context.clone());
            let mut captured = CapturedRequest::from_head(&parts);

            let (body, request_body) = if known_to_fit(&body, limit) {
                let bytes = body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();
                (boxed(Full::new(bytes.clone())), RequestCapture::Buffered(bytes))
            } else {
                let buffer = Arc::new(Mutex::new(CaptureBuffer::new(limit)));
                (
                    boxed(CaptureBody::new(body, buffer.clone())),
                    RequestCapture::Streamed(buffer),
                )
            };

            if debug {
                tracing::debug!(
                    method = %captured.method,
                    path = %captured.path,
                    "APIToolkit: making request"
                );
            }
            let timing = Timing::start();
            let future: InnerFuture<S, ResBody> = Box::pin(inner.call(Request::from_parts(parts, body)));
            let response = future
                .await
                .map_err(Into::<BoxError>::into)?;
            let timing = timing.finish();

            let (res_parts, res_body) = response.into_parts();
            captured.merge_response_extensions(&res_parts.extensions);
            if debug {
                tracing::debug!(
                    status = res_parts.status.as_u16(),
                    duration_ns = timing.duration_nanos(),
                    "APIToolkit: after request"
                );
            }

            let pending = PendingEvent {
                client,
                request: captured,
                request_body,
                status: res_parts.status.as_u16(),
                headers: capture_headers(&res_parts.headers),
                timing,
                context,
            };

            if known_to_fit(&res_body, limit) {
                let bytes = res_body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();
                pending.record(Some(bytes.clone())).await;
                return Ok(Response::from_parts(res_parts, boxed(Full::new(bytes))));
            }

            let body = RecordingBody::new(res_body, limit, move |buffer| {
                pending.record_detached(buffer.captured());
            });
            Ok(Response::from_parts(res_parts, boxed(body)))
        })
    }
}

fn boxed<B>(body: B) -> ApitoolkitBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Whether `body` can be read whole right away without exceeding `limit`.
fn known_to_fit<B: Body>(body: &B, limit: usize) -> bool {
    body.is_end_stream()
        || body
            .size_hint()
            .exact()
            .is_some_and(|len| len <= limit as u64)
}

enum RequestCapture {
    Buffered(Bytes),
    Streamed(Arc<Mutex<CaptureBuffer>>),
}

impl RequestCapture {
    fn captured(&self) -> Option<Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes.clone()),
            Self::Streamed(buffer) => buffer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .captured(),
        }
    }
}

/// Everything known about an exchange except the response body.
struct PendingEvent {
    client: Arc<Client>,
    request: CapturedRequest,
    request_body: RequestCapture,
    status: u16,
    headers: BTreeMap<String, String>,
    timing: Timing,
    context: RequestContext,
}

impl PendingEvent {
    async fn record(mut self, response_body: Option<Bytes>) {
        let response = self.complete(response_body);
        self.client
            .record(&self.request, &response, self.timing, Correlation::from(&self.context))
            .await;
    }

    fn record_detached(mut self, response_body: Option<Bytes>) {
        let response = self.complete(response_body);
        self.client.record_detached(
            &self.request,
            &response,
            self.timing,
            Correlation::from(&self.context),
        );
    }

    /// Attach the captured bodies. A body that was too large, failed or
    /// was never read to the end is left out of the event.
    fn complete(&mut self, response_body: Option<Bytes>) -> CapturedResponse {
        match self.request_body.captured() {
            Some(bytes) => self.request.set_body(&bytes),
            None => tracing::debug!("APIToolkit: request body not captured"),
        }
        if response_body.is_none() {
            tracing::debug!("APIToolkit: response body not captured");
        }

        let response = CapturedResponse {
            status: self.status,
            headers: std::mem::take(&mut self.headers),
            body: response_body.unwrap_or_default(),
        };
        tracing::trace!(
            method = %self.request.method,
            path = %self.request.url_path(),
            status = response.status,
            duration_ns = self.timing.duration_nanos(),
            "APIToolkit: recording request"
        );
        response
    }
}
