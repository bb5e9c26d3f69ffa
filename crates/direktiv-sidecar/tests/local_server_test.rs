// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local control server tests: `/log` and `/var` on behalf of active actions.

mod common;

use std::net::SocketAddr;

use axum::http::StatusCode;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::*;
use direktiv_sidecar::action::VariableScope;
use direktiv_sidecar::active::{ActionMeta, ActiveRequest};
use direktiv_sidecar::local_server;
use direktiv_sidecar::telemetry::TraceCarrier;

async fn start_local(ctx: &TestContext) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = local_server::router(ctx.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

fn register(ctx: &TestContext, action_id: &str) {
    ctx.state
        .active
        .register(ActiveRequest {
            action_id: action_id.to_string(),
            ctx: CancellationToken::new(),
            meta: ActionMeta {
                instance_id: INSTANCE_ID.to_string(),
                namespace: NAMESPACE.to_string(),
                workflow_path: Some(WORKFLOW_PATH.to_string()),
                step: 1,
                iterator: 4,
            },
            trace: TraceCarrier::default(),
        })
        .unwrap();
}

async fn context() -> (TestContext, SocketAddr) {
    let ctx = TestContext::new(StubContainer::echo().await).await;
    let addr = start_local(&ctx).await;
    register(&ctx, "act");
    (ctx, addr)
}

#[tokio::test]
async fn test_log_post_forwards_line() {
    let (ctx, addr) = context().await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/log?aid=act", addr))
        .body("hello from the container")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let logs = ctx.engine.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].instance_id, INSTANCE_ID);
    assert_eq!(logs[0].iterator, 4);
    assert_eq!(logs[0].lines, vec!["hello from the container".to_string()]);
}

#[tokio::test]
async fn test_log_get_uses_query() {
    let (ctx, addr) = context().await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/log", addr))
        .query(&[("aid", "act"), ("log", "via query")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(ctx.engine.logs().await[0].lines, vec!["via query".to_string()]);
}

#[tokio::test]
async fn test_log_empty_message_not_forwarded() {
    let (ctx, addr) = context().await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/log?aid=act", addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(ctx.engine.logs().await.is_empty());
}

#[tokio::test]
async fn test_log_errors() {
    let (ctx, addr) = context().await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("http://{}/log", addr))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let unknown = client
        .post(format!("http://{}/log?aid=ghost", addr))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    ctx.engine.set_failing(true);
    let failing = client
        .post(format!("http://{}/log?aid=act", addr))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(failing.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_var_get_returns_data_and_mime() {
    let (ctx, addr) = context().await;
    mount_variable_list(
        &ctx.store,
        vec![variable_json("v9", VariableScope::Workflow, "config", "application/json")],
    )
    .await;
    mount_variable_data(&ctx.store, "v9", br#"{"a":1}"#).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/var", addr))
        .query(&[("aid", "act"), ("scope", "workflow"), ("key", "config")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), br#"{"a":1}"#);

    // Workflow lookups are filtered by the action's workflow path.
    let listing = ctx
        .store
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path() == variables_path())
        .unwrap();
    assert!(
        listing
            .url
            .query_pairs()
            .any(|(k, v)| k == "workflowPath" && v == WORKFLOW_PATH)
    );
}

#[tokio::test]
async fn test_var_get_unknown_key_is_not_found() {
    let (ctx, addr) = context().await;
    mount_variable_list(&ctx.store, vec![]).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/var", addr))
        .query(&[("aid", "act"), ("scope", "instance"), ("key", "nothing")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_var_bad_requests() {
    let (_ctx, addr) = context().await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/var", addr);

    for query in [
        vec![("aid", "act"), ("scope", "instance")],
        vec![("aid", "act"), ("scope", "galaxy"), ("key", "k")],
        vec![("aid", "act"), ("scope", "file-system"), ("key", "/k")],
        vec![("aid", "act"), ("scope", "instance"), ("key", "")],
    ] {
        let response = client.get(&url).query(&query).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{:?}", query);
    }

    let unknown = client
        .get(&url)
        .query(&[("aid", "ghost"), ("scope", "instance"), ("key", "k")])
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_var_post_creates_variable() {
    let (ctx, addr) = context().await;
    mount_variable_list(&ctx.store, vec![]).await;
    mount_variable_create(&ctx.store).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/var", addr))
        .query(&[("aid", "act"), ("scope", "instance"), ("key", "result")])
        .header("Content-Type", "text/plain")
        .body("value")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let created = json_bodies(&ctx.store, "POST", &variables_path()).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["name"], "result");
    assert_eq!(created[0]["mimeType"], "text/plain");
    assert_eq!(created[0]["instanceId"], INSTANCE_ID);
    assert_eq!(decode_b64(&created[0]["data"]), b"value");
}

#[tokio::test]
async fn test_var_post_patches_existing_variable() {
    let (ctx, addr) = context().await;
    mount_variable_list(
        &ctx.store,
        vec![variable_json("v7", VariableScope::Namespace, "shared", "text/plain")],
    )
    .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/v7", variables_path())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .expect(1)
        .mount(&ctx.store)
        .await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/var", addr))
        .query(&[("aid", "act"), ("scope", "namespace"), ("key", "shared")])
        .body("new")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let patches = json_bodies(&ctx.store, "PATCH", &format!("{}/v7", variables_path())).await;
    assert_eq!(patches[0]["mimeType"], "application/octet-stream");
    assert_eq!(decode_b64(&patches[0]["data"]), b"new");
}

#[tokio::test]
async fn test_var_post_store_failure() {
    let (ctx, addr) = context().await;
    Mock::given(method("GET"))
        .and(path(variables_path()))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&ctx.store)
        .await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/var", addr))
        .query(&[("aid", "act"), ("scope", "instance"), ("key", "k")])
        .body("v")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
