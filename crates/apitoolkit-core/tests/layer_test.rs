use apitoolkit_core::{
    report_error, ApitoolkitBody, ApitoolkitConfig, ApitoolkitLayer, BoxError, Client,
    ClientMetadata, Delivery, MatchedRoute, MemorySink, PathParams, RequestContext, REDACTED,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};

fn metadata() -> ClientMetadata {
    ClientMetadata {
        project_id: "proj-1".into(),
        pubsub_project_id: "gcp".into(),
        topic_id: "events".into(),
        pubsub_push_service_account: json!({}),
    }
}

fn layer_with(config: ApitoolkitConfig) -> (ApitoolkitLayer, MemorySink) {
    let sink = MemorySink::new();
    let client = Client::with_sink(config, metadata(), Arc::new(sink.clone())).unwrap();
    (ApitoolkitLayer::from_client(client), sink)
}

fn inline() -> ApitoolkitConfig {
    ApitoolkitConfig::new().delivery(Delivery::Inline)
}

fn background() -> ApitoolkitConfig {
    ApitoolkitConfig::new().delivery(Delivery::Background { capacity: 8 })
}

fn empty() -> Full<Bytes> {
    Full::new(Bytes::new())
}

async fn echo(req: Request<ApitoolkitBody>) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = req.into_body().collect().await.unwrap().to_bytes();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(body))
        .unwrap())
}

async fn body_bytes(response: Response<ApitoolkitBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn test_request_body_field_is_redacted() {
    let (layer, sink) = layer_with(inline().redact_request_body(["password"]));
    let service = layer.layer(service_fn(echo));

    let request = Request::builder()
        .method("POST")
        .uri("/login")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(br#"{"password":"secret","id":1}"#)))
        .unwrap();
    let response = service.oneshot(request).await.unwrap();

    // The handler sees the real body.
    assert_eq!(
        body_bytes(response).await,
        Bytes::from_static(br#"{"password":"secret","id":1}"#)
    );

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        String::from_utf8(events[0].decoded_request_body().unwrap()).unwrap(),
        r#"{"password":"[CLIENT_REDACTED]","id":1}"#
    );
}

#[tokio::test]
async fn test_response_body_field_is_redacted() {
    let (layer, sink) = layer_with(inline().redact_response_body(["$.token", "$..card"]));
    let service = layer.layer(service_fn(|_req: Request<ApitoolkitBody>| async {
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
            br#"{"token":"abc","user":{"card":"4111"},"ok":true}"#,
        ))))
    }));

    let response = service
        .oneshot(Request::new(empty()))
        .await
        .unwrap();
    assert_eq!(
        body_bytes(response).await,
        Bytes::from_static(br#"{"token":"abc","user":{"card":"4111"},"ok":true}"#)
    );

    let event = &sink.events()[0];
    let body: Value = serde_json::from_slice(&event.decoded_response_body().unwrap()).unwrap();
    assert_eq!(body, json!({"token": REDACTED, "user": {"card": REDACTED}, "ok": true}));
}

#[tokio::test]
async fn test_authorization_header_is_redacted() {
    let (layer, sink) = layer_with(inline().redact_headers(["authorization"]));
    let service = layer.layer(service_fn(|req: Request<ApitoolkitBody>| async move {
        // Redaction never reaches the handler.
        assert_eq!(req.headers()["authorization"], "Bearer xyz");
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
    }));

    let request = Request::builder()
        .uri("/me")
        .header("Authorization", "Bearer xyz")
        .header("Accept", "application/json")
        .body(Full::new(Bytes::new()))
        .unwrap();
    service.oneshot(request).await.unwrap();

    let event = &sink.events()[0];
    assert_eq!(event.request_headers["Authorization"], REDACTED);
    assert_eq!(event.request_headers["Accept"], "application/json");
}

#[tokio::test]
async fn test_duration_covers_handler() {
    let (layer, sink) = layer_with(inline());
    let service = layer.layer(service_fn(|_req: Request<ApitoolkitBody>| async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
    }));

    service
        .oneshot(Request::new(empty()))
        .await
        .unwrap();

    assert!(sink.events()[0].duration >= 25_000_000);
}

#[tokio::test]
async fn test_handler_error_propagates_without_event() {
    let (layer, sink) = layer_with(inline());
    let service = layer.layer(service_fn(|_req: Request<ApitoolkitBody>| async {
        Err::<Response<Full<Bytes>>, _>(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "upstream closed",
        ))
    }));

    let err: BoxError = service
        .oneshot(Request::new(empty()))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "upstream closed");
    assert!(err.downcast_ref::<std::io::Error>().is_some());
    assert_eq!(sink.attempts(), 0);
}

#[tokio::test]
async fn test_degraded_client_passes_through() {
    let client = Client::degraded(inline(), "status 500").unwrap();
    let layer = ApitoolkitLayer::from_client(client);
    let service = layer.layer(service_fn(|req: Request<ApitoolkitBody>| async move {
        assert!(req.extensions().get::<RequestContext>().is_none());
        Ok::<_, Infallible>(
            Response::builder()
                .status(StatusCode::ACCEPTED)
                .header("x-handler", "yes")
                .body(Full::new(Bytes::from_static(b"queued")))
                .unwrap(),
        )
    }));

    let response = service
        .oneshot(Request::new(empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-handler"], "yes");
    assert_eq!(body_bytes(response).await, Bytes::from_static(b"queued"));
    assert!(!layer.client().is_ready());
}

#[tokio::test]
async fn test_route_from_response_extensions() {
    let (layer, sink) = layer_with(inline());
    let service = layer.layer(service_fn(|_req: Request<ApitoolkitBody>| async {
        let mut response = Response::new(Full::new(Bytes::new()));
        response
            .extensions_mut()
            .insert(MatchedRoute("/orders/{id}".to_string()));
        response
            .extensions_mut()
            .insert([("id", "981")].into_iter().collect::<PathParams>());
        Ok::<_, Infallible>(response)
    }));

    let request = Request::builder()
        .uri("/orders/981?verbose=1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    service.oneshot(request).await.unwrap();

    let event = &sink.events()[0];
    assert_eq!(event.url_path, "/orders/{id}");
    assert_eq!(event.raw_url, "/orders/981?verbose=1");
    assert_eq!(event.path_params["id"], "981");
    assert_eq!(event.query_params["verbose"], vec!["1"]);
}

#[tokio::test]
async fn test_reported_errors_are_attached() {
    let (layer, sink) = layer_with(inline());
    let service = layer.layer(service_fn(|req: Request<ApitoolkitBody>| async move {
        let err = "not-a-number".parse::<u64>().unwrap_err();
        assert!(report_error(&req, &err));
        Ok::<_, Infallible>(
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
    }));

    service
        .oneshot(Request::new(empty()))
        .await
        .unwrap();

    let event = &sink.events()[0];
    assert_eq!(event.status_code, 400);
    assert_eq!(event.errors.len(), 1);
    assert_eq!(event.errors[0].message, "invalid digit found in string");
    assert!(event.errors[0].error_type.ends_with("ParseIntError"));
    assert!(event.msg_id.is_some());
}

#[tokio::test]
async fn test_failing_sink_does_not_affect_response() {
    let sink = MemorySink::failing();
    let client = Client::with_sink(inline(), metadata(), Arc::new(sink.clone())).unwrap();
    let service = ApitoolkitLayer::from_client(client).layer(service_fn(echo));

    let request = Request::builder()
        .method("POST")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();
    let response = service.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, Bytes::from_static(b"{}"));
    assert_eq!(sink.attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_in_background() {
    let (layer, sink) = layer_with(
        ApitoolkitConfig::new().delivery(Delivery::Background { capacity: 64 }),
    );
    let service = layer.layer(service_fn(echo));

    let calls = (0..32).map(|i| {
        let service = service.clone();
        async move {
            let request = Request::builder()
                .method("POST")
                .uri(format!("/items/{}", i))
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(format!(r#"{{"n":{}}}"#, i))))
                .unwrap();
            service.oneshot(request).await.unwrap()
        }
    });
    let responses = futures_util::future::join_all(calls).await;
    assert_eq!(responses.len(), 32);

    layer.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 32);
    let ids: HashSet<_> = events.iter().map(|e| e.msg_id).collect();
    assert_eq!(ids.len(), 32);
    let paths: HashSet<_> = events.iter().map(|e| e.url_path.clone()).collect();
    assert!(paths.contains("/items/0") && paths.contains("/items/31"));
}

/// A server-sent event stream that sends one event and then stays open.
fn event_stream() -> Response<StreamBody<impl Stream<Item = Result<Frame<Bytes>, Infallible>> + Send>> {
    let first = futures_util::stream::iter([Ok(Frame::data(Bytes::from_static(b"event: hello\n\n")))]);
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(StreamBody::new(first.chain(futures_util::stream::pending())))
        .unwrap()
}

async fn first_frame(response: Response<ApitoolkitBody>) -> (Bytes, ApitoolkitBody) {
    let mut body = response.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("first frame was held back")
        .unwrap()
        .unwrap();
    (frame.into_data().unwrap(), body)
}

#[tokio::test]
async fn test_degraded_client_streams_open_response() {
    let client = Client::degraded(inline(), "status 500").unwrap();
    let service = ApitoolkitLayer::from_client(client)
        .layer(service_fn(|_req: Request<ApitoolkitBody>| async { Ok::<_, Infallible>(event_stream()) }));

    let response = tokio::time::timeout(Duration::from_secs(2), service.oneshot(Request::new(empty())))
        .await
        .expect("response was held back")
        .unwrap();

    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let (data, _body) = first_frame(response).await;
    assert_eq!(data, Bytes::from_static(b"event: hello\n\n"));
}

#[tokio::test]
async fn test_ready_client_streams_open_response() {
    let (layer, sink) = layer_with(background());
    let service = layer
        .layer(service_fn(|_req: Request<ApitoolkitBody>| async { Ok::<_, Infallible>(event_stream()) }));

    let request = Request::builder().uri("/events").body(empty()).unwrap();
    let response = tokio::time::timeout(Duration::from_secs(2), service.oneshot(request))
        .await
        .expect("response was held back")
        .unwrap();

    let (data, body) = first_frame(response).await;
    assert_eq!(data, Bytes::from_static(b"event: hello\n\n"));
    assert_eq!(sink.attempts(), 0);

    // The caller goes away mid-stream.
    drop(body);
    layer.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].url_path, "/events");
    assert_eq!(events[0].status_code, 200);
    assert_eq!(events[0].response_headers["Content-Type"], "text/event-stream");
    assert_eq!(events[0].decoded_response_body().unwrap(), b"");
}

#[tokio::test]
async fn test_streamed_response_is_recorded_once_read() {
    let (layer, sink) = layer_with(background().redact_response_body(["token"]));
    let service = layer.layer(service_fn(|_req: Request<ApitoolkitBody>| async {
        let chunks = [&b"{\"token\":"[..], &b"\"abc\"}"[..]]
            .map(|chunk| Ok::<_, Infallible>(Frame::data(Bytes::from_static(chunk))));
        Ok::<_, Infallible>(Response::new(StreamBody::new(futures_util::stream::iter(chunks))))
    }));

    let response = service.oneshot(Request::new(empty())).await.unwrap();
    assert_eq!(body_bytes(response).await, Bytes::from_static(br#"{"token":"abc"}"#));
    layer.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let body: Value = serde_json::from_slice(&events[0].decoded_response_body().unwrap()).unwrap();
    assert_eq!(body, json!({"token": REDACTED}));
}

#[tokio::test]
async fn test_bodies_over_the_cap_are_forwarded_but_left_out() {
    let (layer, sink) = layer_with(background().max_body_size(16).redact_request_body(["password"]));
    let service = layer.layer(service_fn(echo));

    let payload = r#"{"password":"secret","padding":"xxxxxxxxxxxxxxxx"}"#;
    let request = Request::builder()
        .method("POST")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(payload.as_bytes())))
        .unwrap();
    let response = service.oneshot(request).await.unwrap();

    // Nothing is cut short on the wire.
    assert_eq!(body_bytes(response).await, Bytes::from_static(payload.as_bytes()));
    layer.shutdown().await;

    let event = &sink.events()[0];
    assert_eq!(event.decoded_request_body().unwrap(), b"null");
    assert_eq!(event.decoded_response_body().unwrap(), b"");
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run one request through `client` and return everything it logged.
async fn logs_for(client: Client) -> String {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let service = ApitoolkitLayer::from_client(client).layer(service_fn(echo));
    service.oneshot(Request::new(empty())).await.unwrap();

    let bytes = logs.0.lock().unwrap().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn test_debug_mode_logs_request_lifecycle() {
    let client = Client::with_sink(inline().debug(true), metadata(), Arc::new(MemorySink::new())).unwrap();
    let logs = logs_for(client).await;
    assert!(logs.contains("APIToolkit: making request"), "{logs}");
    assert!(logs.contains("APIToolkit: after request"), "{logs}");

    let quiet = Client::with_sink(inline(), metadata(), Arc::new(MemorySink::new())).unwrap();
    let logs = logs_for(quiet).await;
    assert!(!logs.contains("APIToolkit: making request"), "{logs}");
    assert!(!logs.contains("APIToolkit: after request"), "{logs}");
}

#[tokio::test]
async fn test_debug_mode_reports_missing_project() {
    let client = Client::degraded(inline().debug(true), "status 500").unwrap();
    let logs = logs_for(client).await;
    assert!(
        logs.contains("APIToolkit: Project ID not set (restart your server to fix)"),
        "{logs}"
    );
    assert!(!logs.contains("APIToolkit: making request"), "{logs}");
}
