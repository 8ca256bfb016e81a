use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderMap as AxumHeaderMap, StatusCode as AxumStatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use reauth_http::{
    bearer_authorization, BoxError, ClientError, CredentialProvider, EventSink, RequestEvent,
    RetryDecision, RetryPolicyConfig, RetryingClient, Route, TransportErrorKind, WaitDiscipline,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Method, StatusCode,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Barrier;

#[derive(Clone)]
enum MockBody {
    Json(JsonValue),
    Text(&'static str),
}

#[derive(Clone)]
struct MockResponse {
    status: AxumStatusCode,
    body: MockBody,
    delay: Duration,
}

impl MockResponse {
    fn json(status: AxumStatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body: MockBody::Json(body),
            delay: Duration::from_millis(0),
        }
    }

    fn text(status: AxumStatusCode, body: &'static str) -> Self {
        Self {
            status,
            body: MockBody::Text(body),
            delay: Duration::from_millis(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    hits: Arc<AtomicUsize>,
    seen_auth: Arc<Mutex<Vec<String>>>,
    // When set, any other bearer token is answered with 401.
    valid_token: Option<&'static str>,
    // Holds the first `stale_requests` stale-token requests until all of them have arrived.
    stale_barrier: Option<Arc<Barrier>>,
    stale_requests: usize,
    stale_seen: Arc<AtomicUsize>,
}

async fn handler(State(state): State<MockState>, headers: AxumHeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    state
        .seen_auth
        .lock()
        .expect("auth log mutex must not be poisoned")
        .push(auth.clone());

    if let Some(token) = state.valid_token {
        if auth != format!("Bearer {token}") {
            let seen = state.stale_seen.fetch_add(1, Ordering::SeqCst);
            if let Some(barrier) = &state.stale_barrier {
                if seen < state.stale_requests {
                    barrier.wait().await;
                }
            }
            return (
                AxumStatusCode::UNAUTHORIZED,
                Json(json!({"error": "token expired"})),
            )
                .into_response();
        }
    }

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue
            .pop_front()
            .unwrap_or_else(|| MockResponse::json(AxumStatusCode::OK, json!({"ok": true})))
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    match response.body {
        MockBody::Json(body) => (response.status, Json(body)).into_response(),
        MockBody::Text(body) => (response.status, body).into_response(),
    }
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    seen_auth: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn seen_auth(&self) -> Vec<String> {
        self.seen_auth.lock().expect("auth log mutex").clone()
    }
}

struct ServerConfig {
    responses: Vec<MockResponse>,
    valid_token: Option<&'static str>,
    stale_requests: Option<usize>,
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    spawn_server_with(ServerConfig {
        responses,
        valid_token: None,
        stale_requests: None,
    })
    .await
}

async fn spawn_server_with(config: ServerConfig) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(config.responses.into())),
        hits: Arc::new(AtomicUsize::new(0)),
        seen_auth: Arc::new(Mutex::new(Vec::new())),
        valid_token: config.valid_token,
        stale_barrier: config.stale_requests.map(|n| Arc::new(Barrier::new(n))),
        stale_requests: config.stale_requests.unwrap_or(0),
        stale_seen: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/*path", any(handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        seen_auth: state.seen_auth,
        task,
    }
}

/// Bearer-token provider whose refresh swaps in `next_token`.
struct TokenProvider {
    token: Mutex<String>,
    next_token: &'static str,
    refresh_ok: bool,
    refresh_delay: Duration,
    refreshes: AtomicUsize,
    cancels: AtomicUsize,
}

impl TokenProvider {
    fn new(token: &str, next_token: &'static str) -> Self {
        Self {
            token: Mutex::new(token.to_owned()),
            next_token,
            refresh_ok: true,
            refresh_delay: Duration::from_millis(0),
            refreshes: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    fn failing(mut self) -> Self {
        self.refresh_ok = false;
        self
    }

    fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }
}

impl CredentialProvider for TokenProvider {
    fn common_headers(&self) -> HeaderMap {
        let token = self.token.lock().expect("token mutex").clone();
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            bearer_authorization(&token).expect("valid bearer token"),
        );
        headers
    }

    async fn refresh_credentials(&self) -> Result<(), BoxError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.refresh_delay).await;
        if !self.refresh_ok {
            return Err("refresh token revoked".into());
        }
        *self.token.lock().expect("token mutex") = self.next_token.to_owned();
        Ok(())
    }

    fn cancel_all_requests(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

fn refreshes(client: &RetryingClient<TokenProvider>) -> usize {
    client
        .interceptor()
        .coordinator()
        .provider()
        .refreshes
        .load(Ordering::SeqCst)
}

fn cancels(client: &RetryingClient<TokenProvider>) -> usize {
    client
        .interceptor()
        .coordinator()
        .provider()
        .cancels
        .load(Ordering::SeqCst)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<RequestEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<RequestEvent> {
        self.events.lock().expect("recorder mutex").clone()
    }

    fn retry_decisions(&self) -> Vec<RetryDecision> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RequestEvent::Retrying { decision, .. } => Some(decision),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for Recorder {
    fn on_event(&self, event: &RequestEvent) {
        self.events.lock().expect("recorder mutex").push(event.clone());
    }
}

#[derive(Debug, Deserialize)]
struct Item {
    id: u64,
}

#[tokio::test]
async fn success_sends_common_headers_once() {
    let server = spawn_server(vec![MockResponse::json(
        AxumStatusCode::OK,
        json!({"id": 7}),
    )])
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::default(),
        TokenProvider::new("t1", "t2"),
    );

    let item: Item = client
        .send_json(client.request(Method::GET, server.url("/v1/items/7")))
        .await
        .expect("request must succeed");

    assert_eq!(item.id, 7);
    assert_eq!(server.hits(), 1);
    assert_eq!(server.seen_auth(), ["Bearer t1"]);
}

#[tokio::test]
async fn retries_on_retryable_http_status() {
    let server = spawn_server(vec![
        MockResponse::json(AxumStatusCode::SERVICE_UNAVAILABLE, json!({"error": "busy"})),
        MockResponse::json(AxumStatusCode::OK, json!({"id": 1})),
    ])
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new().retry_status_codes([StatusCode::SERVICE_UNAVAILABLE]),
        TokenProvider::new("t1", "t2"),
    );

    let item: Item = client
        .send_json(client.request(Method::GET, server.url("/v1/items/1")))
        .await
        .expect("request must succeed after retry");

    assert_eq!(item.id, 1);
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn gives_up_when_attempt_ceiling_is_reached() {
    let busy = MockResponse::json(AxumStatusCode::SERVICE_UNAVAILABLE, json!({"error": "busy"}));
    let server = spawn_server(vec![busy.clone(), busy.clone(), busy.clone(), busy]).await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new()
            .max_retries(3)
            .retry_status_codes([StatusCode::SERVICE_UNAVAILABLE]),
        TokenProvider::new("t1", "t2"),
    );

    let err = client
        .send(client.request(Method::GET, server.url("/v1/items")))
        .await
        .expect_err("request must give up");

    match err {
        ClientError::Http { status, body } => {
            assert_eq!(status, 503);
            assert!(body.contains("busy"));
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn non_retryable_status_surfaces_immediately() {
    let server = spawn_server(vec![MockResponse::json(
        AxumStatusCode::NOT_FOUND,
        json!({"error": "missing"}),
    )])
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new().retry_status_codes([StatusCode::SERVICE_UNAVAILABLE]),
        TokenProvider::new("t1", "t2"),
    );

    let err = client
        .send(client.request(Method::GET, server.url("/v1/items/9")))
        .await
        .expect_err("404 must not be retried");

    assert!(matches!(err, ClientError::Http { status: 404, .. }));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn expired_token_is_refreshed_and_request_replayed() {
    let server = spawn_server_with(ServerConfig {
        responses: vec![MockResponse::json(AxumStatusCode::OK, json!({"id": 3}))],
        valid_token: Some("fresh"),
        stale_requests: None,
    })
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new().max_retries(2),
        TokenProvider::new("stale", "fresh"),
    );

    let item: Item = client
        .send_json(
            client
                .request(Method::POST, server.url("/v1/items"))
                .json(&json!({"name": "kit"})),
        )
        .await
        .expect("request must succeed after refresh");

    assert_eq!(item.id, 3);
    assert_eq!(refreshes(&client), 1);
    assert_eq!(server.seen_auth(), ["Bearer stale", "Bearer fresh"]);
}

#[tokio::test]
async fn concurrent_expired_requests_trigger_one_refresh() {
    const REQUESTS: usize = 6;
    let server = spawn_server_with(ServerConfig {
        responses: Vec::new(),
        valid_token: Some("fresh"),
        stale_requests: Some(REQUESTS),
    })
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new().max_retries(2),
        TokenProvider::new("stale", "fresh").with_refresh_delay(Duration::from_millis(300)),
    );

    let tasks: Vec<_> = (0..REQUESTS)
        .map(|index| {
            let client = client.clone();
            let url = server.url(&format!("/v1/items/{index}"));
            tokio::spawn(async move { client.send(client.request(Method::GET, url)).await })
        })
        .collect();

    for task in tasks {
        let response = task
            .await
            .expect("request task")
            .expect("request must succeed after shared refresh");
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(refreshes(&client), 1);
    assert_eq!(server.hits(), REQUESTS * 2);
}

#[tokio::test]
async fn failed_refresh_fails_every_waiter_and_cancels_once() {
    let server = spawn_server_with(ServerConfig {
        responses: Vec::new(),
        valid_token: Some("fresh"),
        stale_requests: Some(2),
    })
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new().max_retries(2),
        TokenProvider::new("stale", "fresh")
            .failing()
            .with_refresh_delay(Duration::from_millis(300)),
    );

    let tasks: Vec<_> = ["/v1/a", "/v1/b"]
        .into_iter()
        .map(|path| {
            let client = client.clone();
            let url = server.url(path);
            tokio::spawn(async move { client.send(client.request(Method::GET, url)).await })
        })
        .collect();

    for task in tasks {
        let err = task
            .await
            .expect("request task")
            .expect_err("request must fail after refresh failure");
        assert!(matches!(err, ClientError::Http { status: 401, .. }));
    }
    assert_eq!(refreshes(&client), 1);
    assert_eq!(cancels(&client), 1);
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn post_timeout_is_not_retried_but_get_is() {
    let slow = MockResponse::json(AxumStatusCode::OK, json!({"id": 1}))
        .with_delay(Duration::from_millis(300));
    let fast = MockResponse::json(AxumStatusCode::OK, json!({"id": 2}));
    let server = spawn_server(vec![slow.clone(), slow, fast]).await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new()
            .retry_error_kinds([TransportErrorKind::Timeout])
            .retry_methods([Method::GET]),
        TokenProvider::new("t1", "t2"),
    )
    .with_request_timeout(Duration::from_millis(50));

    let err = client
        .send(client.request(Method::POST, server.url("/v1/items")))
        .await
        .expect_err("post must time out");
    match err {
        ClientError::Transport(inner) => assert!(inner.is_timeout()),
        other => panic!("expected transport timeout error, got {other:?}"),
    }

    let item: Item = client
        .send_json(client.request(Method::GET, server.url("/v1/items/2")))
        .await
        .expect("get must succeed after retrying the timeout");
    assert_eq!(item.id, 2);
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn route_headers_override_common_headers() {
    let server = spawn_server(vec![MockResponse::json(
        AxumStatusCode::OK,
        json!({"id": 5}),
    )])
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::default(),
        TokenProvider::new("t1", "t2"),
    )
    .with_base_url(&server.base_url)
    .expect("valid base url");

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic cm91dGU="));
    let route = Route::new(Method::GET, "/v1/search").with_headers(headers);

    let response = client
        .send_route_with(&route, &json!({"q": "kit"}))
        .await
        .expect("route must succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.seen_auth(), ["Basic cm91dGU="]);
}

#[tokio::test]
async fn non_json_success_body_is_a_decode_error() {
    let server = spawn_server(vec![MockResponse::text(
        AxumStatusCode::OK,
        "<html>maintenance</html>",
    )])
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::default(),
        TokenProvider::new("t1", "t2"),
    );

    let err = client
        .send_json::<Item>(client.request(Method::GET, server.url("/v1/items/1")))
        .await
        .expect_err("html body must not decode");

    match err {
        ClientError::Decode(message) => assert!(message.contains("<html>maintenance</html>")),
        other => panic!("expected decode error, got {other:?}"),
    }
    assert_eq!(server.hits(), 1);
}

#[tokio::test(start_paused = true)]
async fn backoff_spaces_out_plain_retries() {
    let busy = MockResponse::json(AxumStatusCode::SERVICE_UNAVAILABLE, json!({"error": "busy"}));
    let server = spawn_server(vec![
        busy.clone(),
        busy,
        MockResponse::json(AxumStatusCode::OK, json!({"id": 4})),
    ])
    .await;
    let recorder = Arc::new(Recorder::default());
    let client = RetryingClient::with_events(
        RetryPolicyConfig::new()
            .retry_status_codes([StatusCode::SERVICE_UNAVAILABLE])
            .retry_backoff(Duration::from_secs(1)),
        TokenProvider::new("t1", "t2"),
        recorder.clone(),
    );

    let started = tokio::time::Instant::now();
    let item: Item = client
        .send_json(client.request(Method::GET, server.url("/v1/items/4")))
        .await
        .expect("request must succeed after backoff");

    assert_eq!(item.id, 4);
    assert_eq!(server.hits(), 3);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(
        recorder.retry_decisions(),
        [
            RetryDecision::RetryAfterDelay(Duration::from_secs(1)),
            RetryDecision::RetryAfterDelay(Duration::from_secs(2)),
        ]
    );

    let completed: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            RequestEvent::Completed {
                attempt,
                status,
                elapsed,
                ..
            } => Some((attempt, status, elapsed)),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1);
    let (attempt, status, elapsed) = completed[0];
    assert_eq!(attempt, 3);
    assert_eq!(status, StatusCode::OK);
    assert!(elapsed >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn deferred_request_is_resent_after_retry_delay() {
    let server = spawn_server_with(ServerConfig {
        responses: Vec::new(),
        valid_token: Some("fresh"),
        stale_requests: Some(2),
    })
    .await;
    let recorder = Arc::new(Recorder::default());
    let client = RetryingClient::with_events(
        RetryPolicyConfig::new()
            .max_retries(10)
            .wait_discipline(WaitDiscipline::Defer)
            .retry_delay(Duration::from_secs(2)),
        TokenProvider::new("stale", "fresh").with_refresh_delay(Duration::from_secs(5)),
        recorder.clone(),
    );

    let tasks: Vec<_> = ["/v1/a", "/v1/b"]
        .into_iter()
        .map(|path| {
            let client = client.clone();
            let url = server.url(path);
            tokio::spawn(async move { client.send(client.request(Method::GET, url)).await })
        })
        .collect();

    for task in tasks {
        let response = task
            .await
            .expect("request task")
            .expect("request must succeed once the refresh lands");
        assert_eq!(response.status(), StatusCode::OK);
    }

    // The owner waits out the 5s refresh; the deferred request is resent at
    // 2s and 4s with the stale token and at 6s with the fresh one.
    assert_eq!(refreshes(&client), 1);
    assert_eq!(server.hits(), 6);
    let deferred = recorder
        .retry_decisions()
        .into_iter()
        .filter(|decision| *decision == RetryDecision::RetryAfterDelay(Duration::from_secs(2)))
        .count();
    assert_eq!(deferred, 3);
}

#[tokio::test]
async fn streamed_body_is_not_resent_but_still_refreshes() {
    let server = spawn_server_with(ServerConfig {
        responses: Vec::new(),
        valid_token: Some("fresh"),
        stale_requests: None,
    })
    .await;
    let client = RetryingClient::new(
        RetryPolicyConfig::new().max_retries(2),
        TokenProvider::new("stale", "fresh"),
    );

    let err = client
        .send(
            client
                .request(Method::POST, server.url("/v1/uploads"))
                .body(reqwest::Body::wrap(String::from("chunk"))),
        )
        .await
        .expect_err("streamed body must not be resent");
    assert!(matches!(err, ClientError::Http { status: 401, .. }));
    assert_eq!(server.hits(), 1);
    assert_eq!(refreshes(&client), 1);

    let response = client
        .send(client.request(Method::GET, server.url("/v1/uploads")))
        .await
        .expect("next request must carry the refreshed token");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.seen_auth(), ["Bearer stale", "Bearer fresh"]);
}
