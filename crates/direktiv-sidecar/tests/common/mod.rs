// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for direktiv-sidecar integration tests.
//!
//! Provides a stub user container, a wiremock variable store and a
//! TestContext wiring both to a worker pool with a recording engine.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use direktiv_sidecar::action::*;
use direktiv_sidecar::container::UserContainer;
use direktiv_sidecar::engine::RecordingEngine;
use direktiv_sidecar::local_server::ControlState;
use direktiv_sidecar::queue::{InboundQueue, IngressReply, QueuedAction};
use direktiv_sidecar::variables::VariableClient;
use direktiv_sidecar::worker::WorkerPool;

pub const NAMESPACE: &str = "ns";
pub const INSTANCE_ID: &str = "inst-1";
pub const WORKFLOW_PATH: &str = "/wf.yaml";
pub const API_KEY: &str = "secret-token";

// ============================================================================
// Stub user container
// ============================================================================

/// One `POST /` received by the stub container.
#[derive(Debug, Clone)]
pub struct ContainerCall {
    pub action_id: String,
    pub query_action_id: Option<String>,
    pub iterator: String,
    pub temp_dir: PathBuf,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ContainerCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub type ContainerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;
pub type ContainerHandler = Arc<dyn Fn(ContainerCall, StubHandle) -> ContainerFuture + Send + Sync>;

#[derive(Default)]
struct StubLog {
    calls: Mutex<Vec<ContainerCall>>,
    cancels: Mutex<Vec<String>>,
    cancel_notify: tokio::sync::Notify,
}

/// Cheap handle given to container handlers so they can wait for a cancel.
#[derive(Clone)]
pub struct StubHandle {
    log: Arc<StubLog>,
}

impl StubHandle {
    /// Resolve once `DELETE /` for the action arrived.
    pub async fn cancelled(&self, action_id: &str) {
        loop {
            let notified = self.log.cancel_notify.notified();
            if self.log.cancels.lock().unwrap().iter().any(|id| id == action_id) {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
struct StubState {
    log: Arc<StubLog>,
    handler: ContainerHandler,
}

/// An axum server standing in for the user container.
pub struct StubContainer {
    pub addr: SocketAddr,
    log: Arc<StubLog>,
}

impl StubContainer {
    pub async fn start(handler: ContainerHandler) -> Self {
        let log = Arc::new(StubLog::default());
        let state = StubState {
            log: log.clone(),
            handler,
        };
        let app = Router::new()
            .route("/", post(stub_invoke).delete(stub_cancel))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { addr, log }
    }

    /// Container answering every action with `200` and the given body.
    pub async fn echo() -> Self {
        Self::start(handler(|call, _| async move { (StatusCode::OK, call.body).into_response() })).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn client(&self) -> UserContainer {
        UserContainer::with_host("127.0.0.1", self.port()).unwrap()
    }

    pub fn calls(&self) -> Vec<ContainerCall> {
        self.log.calls.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.log.cancels.lock().unwrap().clone()
    }
}

/// Box an async closure into a [`ContainerHandler`].
pub fn handler<F, Fut>(f: F) -> ContainerHandler
where
    F: Fn(ContainerCall, StubHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |call, handle| Box::pin(f(call, handle)))
}

async fn stub_invoke(
    State(state): State<StubState>,
    axum::extract::Query(query): axum::extract::Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let call = ContainerCall {
        action_id: get(HEADER_ACTION_ID),
        query_action_id: query.get("action_id").cloned(),
        iterator: get(HEADER_ITERATOR),
        temp_dir: PathBuf::from(get(HEADER_TEMP_DIR)),
        headers: headers.clone(),
        body,
    };
    state.log.calls.lock().unwrap().push(call.clone());
    (state.handler)(call, StubHandle { log: state.log.clone() }).await
}

async fn stub_cancel(State(state): State<StubState>, headers: HeaderMap) -> StatusCode {
    let action_id = headers
        .get(HEADER_ACTION_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.log.cancels.lock().unwrap().push(action_id);
    state.log.cancel_notify.notify_waiters();
    StatusCode::OK
}

/// Response carrying the catchable error headers.
pub fn container_error(code: &str, message: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_ERROR_CODE, HeaderValue::from_str(code).unwrap());
    headers.insert(HEADER_ERROR_MESSAGE, HeaderValue::from_str(message).unwrap());
    (StatusCode::OK, headers).into_response()
}

// ============================================================================
// Variable store
// ============================================================================

/// A variable as listed by the store.
pub fn variable_json(id: &str, scope: VariableScope, name: &str, mime: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": format!("{}-variable", scope),
        "name": name,
        "mimeType": mime,
        "size": 0,
    })
}

/// Serve `list` for every variable listing in the namespace.
pub async fn mount_variable_list(store: &MockServer, list: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/namespaces/{}/variables", NAMESPACE)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": list })))
        .mount(store)
        .await;
}

/// Serve the data of variable `id`.
pub async fn mount_variable_data(store: &MockServer, id: &str, data: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/namespaces/{}/variables/{}", NAMESPACE, id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": id, "data": BASE64.encode(data) }
        })))
        .mount(store)
        .await;
}

/// Accept variable creations.
pub async fn mount_variable_create(store: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/api/v2/namespaces/{}/variables", NAMESPACE)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .mount(store)
        .await;
}

/// Bodies of every JSON request with `method` under `path`.
pub async fn json_bodies(store: &MockServer, verb: &str, path: &str) -> Vec<serde_json::Value> {
    store
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == verb && r.url.path() == path)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

pub fn variables_path() -> String {
    format!("/api/v2/namespaces/{}/variables", NAMESPACE)
}

pub fn decode_b64(value: &serde_json::Value) -> Vec<u8> {
    BASE64.decode(value.as_str().unwrap()).unwrap()
}

// ============================================================================
// Action envelopes
// ============================================================================

/// Builder for the engine's header envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub action_id: String,
    pub step: i32,
    pub iterator: i32,
    pub deadline: DateTime<Utc>,
    pub files: Vec<serde_json::Value>,
    pub input: Bytes,
    pub traceparent: Option<String>,
}

impl Envelope {
    pub fn new(action_id: &str) -> Self {
        Self {
            action_id: action_id.to_string(),
            step: 2,
            iterator: 0,
            deadline: Utc::now() + chrono::Duration::seconds(30),
            files: Vec::new(),
            input: Bytes::from_static(br#"{"hello":"world"}"#),
            traceparent: None,
        }
    }

    pub fn deadline_in(mut self, d: Duration) -> Self {
        self.deadline = Utc::now() + chrono::Duration::from_std(d).unwrap();
        self
    }

    pub fn file(mut self, spec: serde_json::Value) -> Self {
        self.files.push(spec);
        self
    }

    pub fn input(mut self, input: &'static [u8]) -> Self {
        self.input = Bytes::from_static(input);
        self
    }

    pub fn iterator(mut self, iterator: i32) -> Self {
        self.iterator = iterator;
        self
    }

    pub fn traceparent(mut self, value: &str) -> Self {
        self.traceparent = Some(value.to_string());
        self
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut set = |name: &str, value: String| {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(&value).unwrap(),
            );
        };
        set(HEADER_ACTION_ID, self.action_id.clone());
        set(HEADER_INSTANCE_ID, INSTANCE_ID.to_string());
        set(HEADER_NAMESPACE, NAMESPACE.to_string());
        set(HEADER_STEP, self.step.to_string());
        set(HEADER_ITERATOR, self.iterator.to_string());
        set(HEADER_DEADLINE, self.deadline.to_rfc3339());
        set(
            HEADER_FUNCTION_CONTEXT,
            BASE64.encode(json!({ "workflowPath": WORKFLOW_PATH }).to_string()),
        );
        for spec in &self.files {
            set(HEADER_FILES, BASE64.encode(spec.to_string()));
        }
        if let Some(tp) = &self.traceparent {
            set("traceparent", tp.clone());
        }
        headers
    }

    pub fn request(&self) -> ActionRequest {
        ActionRequest::from_parts(&self.headers(), self.input.clone()).unwrap()
    }
}

// ============================================================================
// Test context
// ============================================================================

/// Worker pool wired to a stub container, a wiremock store and a recording engine.
pub struct TestContext {
    pub store: MockServer,
    pub engine: Arc<RecordingEngine>,
    pub container: StubContainer,
    pub state: Arc<ControlState>,
    pub pool: Arc<WorkerPool>,
    pub shared: tempfile::TempDir,
}

impl TestContext {
    pub async fn new(container: StubContainer) -> Self {
        Self::with_workers(container, 2, Duration::from_secs(10)).await
    }

    pub async fn with_workers(container: StubContainer, workers: usize, cancel_grace: Duration) -> Self {
        let store = MockServer::start().await;
        let engine = RecordingEngine::new();
        let shared = tempfile::TempDir::new().unwrap();

        let variables = VariableClient::new(store.uri(), API_KEY).unwrap();
        let mut control = ControlState::new(
            InboundQueue::new(16),
            variables,
            engine.clone(),
            container.client(),
        );
        control.cancel_grace = cancel_grace;
        let state = Arc::new(control);
        let pool = WorkerPool::spawn(workers, state.clone(), shared.path().to_path_buf());

        Self {
            store,
            engine,
            container,
            state,
            pool,
            shared,
        }
    }

    /// Enqueue an action and return its caller token and completion.
    pub async fn enqueue(
        &self,
        request: ActionRequest,
    ) -> (CancellationToken, oneshot::Receiver<IngressReply>) {
        let caller = CancellationToken::new();
        let (completion, done) = oneshot::channel();
        self.state
            .queue
            .send(QueuedAction {
                request,
                caller: caller.clone(),
                completion,
            })
            .await
            .unwrap();
        (caller, done)
    }

    /// Enqueue an action and wait for its ingress reply.
    pub async fn run(&self, request: ActionRequest) -> IngressReply {
        let (_caller, done) = self.enqueue(request).await;
        tokio::time::timeout(Duration::from_secs(30), done)
            .await
            .expect("action did not complete")
            .expect("completion dropped")
    }

    pub fn workspace_path(&self, action_id: &str) -> PathBuf {
        self.shared.path().join(action_id)
    }
}

/// Poll `check` until it holds or a few seconds passed.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
