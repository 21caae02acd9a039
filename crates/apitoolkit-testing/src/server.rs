//! The mock APIToolkit backend.

use super::response::MockResponse;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

type GenericError = Box<dyn std::error::Error + Send + Sync>;
type Result<T> = std::result::Result<T, GenericError>;

/// Client metadata served by a fresh [`MockBackend`].
pub fn default_metadata() -> Value {
    json!({
        "project_id": "00000000-0000-0000-0000-000000000001",
        "pubsub_project_id": "mock-gcp-project",
        "topic_id": "apitoolkit-events",
        "pubsub_push_service_account": {
            "type": "service_account",
            "client_email": "publisher@mock-gcp-project.iam.gserviceaccount.com"
        }
    })
}

/// A mock APIToolkit backend
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<Mutex<BackendState>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

struct BackendState {
    metadata_response: MockResponse,
    publish_response: Option<MockResponse>,
    metadata_requests: Vec<RecordedRequest>,
    published: Vec<PublishedMessage>,
    unmatched_requests: Vec<RecordedRequest>,
}

/// A request received by the backend
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method
    pub method: http::Method,
    /// Request path, without query string
    pub path: String,
    /// Request headers as received
    pub headers: http::HeaderMap,
    /// Full request body
    pub body: Bytes,
}

/// One Pub/Sub message received on a publish call
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Topic from the request path, e.g. `projects/p/topics/t`
    pub topic: String,
    /// Decoded message data
    pub data: Vec<u8>,
    /// `Authorization` header of the publish call
    pub authorization: Option<String>,
}

impl PublishedMessage {
    /// Parse the message data as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }
}

#[derive(Deserialize)]
struct PublishBody {
    messages: Vec<PublishBodyMessage>,
}

#[derive(Deserialize)]
struct PublishBodyMessage {
    data: String,
}

impl MockBackend {
    /// Start a backend on a random port serving [`default_metadata`]
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().expect("Mock backend has no address");

        let state = Arc::new(Mutex::new(BackendState {
            metadata_response: MockResponse::new().json(default_metadata()),
            publish_response: None,
            metadata_requests: Vec::new(),
            published: Vec::new(),
            unmatched_requests: Vec::new(),
        }));

        let state_clone = state.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stop_future = shutdown_rx;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let state = state_clone.clone();

                                tokio::spawn(async move {
                                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                        .serve_connection(io, service_fn(move |req| handle_request(req, state.clone())))
                                        .await
                                    {
                                        tracing::debug!(error = ?err, "Mock backend connection error");
                                    }
                                });
                            }
                            Err(e) => tracing::warn!(error = %e, "Mock backend accept error"),
                        }
                    }
                    _ = &mut stop_future => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Base URL, usable as both `root_url` and `pubsub_endpoint`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Serve different client metadata
    pub fn with_metadata(self, metadata: Value) -> Self {
        self.respond_to_metadata(MockResponse::new().json(metadata))
    }

    /// Replace the response of `GET /api/client_metadata`
    pub fn respond_to_metadata(self, response: MockResponse) -> Self {
        self.lock().metadata_response = response;
        self
    }

    /// Answer publish calls with `response` instead of accepting them
    pub fn respond_to_publish(self, response: MockResponse) -> Self {
        self.lock().publish_response = Some(response);
        self
    }

    /// Metadata requests received so far
    pub fn metadata_requests(&self) -> Vec<RecordedRequest> {
        self.lock().metadata_requests.clone()
    }

    /// Messages accepted so far
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Requests that hit neither endpoint
    pub fn unmatched_requests(&self) -> Vec<RecordedRequest> {
        self.lock().unmatched_requests.clone()
    }

    /// Wait until at least `count` messages were accepted, or `timeout` passes
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<PublishedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.published();
            if published.len() >= count || tokio::time::Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<Mutex<BackendState>>,
) -> Result<Response<Full<Bytes>>> {
    // Read the full body
    let (parts, body) = req.into_parts();
    let body_bytes = body.collect().await?.to_bytes();
    let path = parts.uri.path().to_string();

    let mut state_guard = state.lock().unwrap_or_else(|p| p.into_inner());
    let recorded = RecordedRequest {
        method: parts.method.clone(),
        path: path.clone(),
        headers: parts.headers.clone(),
        body: body_bytes.clone(),
    };

    if parts.method == Method::GET && path == "/api/client_metadata" {
        state_guard.metadata_requests.push(recorded);
        return Ok(state_guard.metadata_response.to_response()?);
    }

    let topic = path
        .strip_prefix("/v1/")
        .and_then(|rest| rest.strip_suffix(":publish"));
    if let (&Method::POST, Some(topic)) = (&parts.method, topic) {
        if let Some(response) = &state_guard.publish_response {
            return Ok(response.to_response()?);
        }

        let publish: PublishBody = match serde_json::from_slice(&body_bytes) {
            Ok(publish) => publish,
            Err(e) => return bad_request(format!("invalid publish body: {}", e)),
        };
        let authorization = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut ids = Vec::new();
        for message in publish.messages {
            let data = match STANDARD.decode(&message.data) {
                Ok(data) => data,
                Err(e) => return bad_request(format!("message data is not base64: {}", e)),
            };
            state_guard.published.push(PublishedMessage {
                topic: topic.to_string(),
                data,
                authorization: authorization.clone(),
            });
            ids.push(state_guard.published.len().to_string());
        }

        let body = serde_json::to_vec(&json!({ "messageIds": ids }))?;
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?);
    }

    state_guard.unmatched_requests.push(recorded);
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from("No mock endpoint matched")))?)
}

fn bad_request(message: String) -> Result<Response<Full<Bytes>>> {
    Ok(Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Full::new(Bytes::from(message)))?)
}
