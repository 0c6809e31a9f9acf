//! HTTP surface tests against a gateway whose nodes are unreachable.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::NamedTempFile;
use tower::ServiceExt;

use jobdeck::gateway::{
    Deadlines, FileSource, Gateway, GatewayOptions, NodeRegistry, RetryPolicy, TonicConnector,
};
use jobdeck::server::{create_router, AppState};

const NODES: &str = r#"
version: "1"
nodes:
  default:
    address: "127.0.0.1:1"
  edge:
    address: "127.0.0.1:2"
"#;

struct TestApp {
    router: Router,
    _nodes: NamedTempFile,
}

fn app() -> TestApp {
    let mut nodes = NamedTempFile::new().unwrap();
    nodes.write_all(NODES.as_bytes()).unwrap();

    let registry = Arc::new(NodeRegistry::new(
        FileSource::new(nodes.path()),
        Duration::from_secs(60),
    ));
    let options = GatewayOptions {
        initial_node: "default".to_string(),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            retry_mutations: false,
        },
        deadlines: Deadlines {
            read: Duration::from_secs(2),
            write: Duration::from_secs(2),
        },
        ..GatewayOptions::default()
    };
    let gateway = Arc::new(Gateway::new(registry, TonicConnector::default(), options));
    let state = Arc::new(AppState::new(gateway, 4));

    TestApp {
        router: create_router(state),
        _nodes: nodes,
    }
}

async fn send(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_current_node() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["currentNode"], "default");
}

#[tokio::test]
async fn nodes_are_listed_from_the_document() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/api/nodes", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"], "default");
    assert_eq!(body["degraded"], false);
    let names: Vec<&str> = body["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["default", "edge"]);
}

#[tokio::test]
async fn switching_to_an_unknown_node_is_a_configuration_error() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/nodes/current",
        Some(serde_json::json!({ "node": "missing" })),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "configuration");

    let (_, current) = send(&app, Method::GET, "/api/nodes/current", None).await;
    assert_eq!(current["current"], "default");
}

#[tokio::test]
async fn switching_nodes_changes_the_default_target() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/nodes/current",
        Some(serde_json::json!({ "node": "edge" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previous"], "default");
    assert_eq!(body["current"], "edge");
}

#[tokio::test]
async fn unknown_node_query_fails_before_any_call() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/api/jobs?node=missing", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "configuration");
}

#[tokio::test]
async fn unreachable_backend_is_reported_as_connectivity() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/api/jobs", None).await;

    assert!(
        status == StatusCode::BAD_GATEWAY || status == StatusCode::GATEWAY_TIMEOUT,
        "unexpected status {status}"
    );
    assert_eq!(body["kind"], "connectivity");
}

#[tokio::test]
async fn unknown_install_session_is_not_found() {
    let app = app();

    let (status, body) = send(&app, Method::GET, "/api/runtimes/install/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "session_not_found");

    let (status, body) = send(&app, Method::GET, "/ws/install/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "session_not_found");
}

#[tokio::test]
async fn tail_routes_require_an_upgrade() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/ws/logs/job-1", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn invalid_network_spec_is_rejected_locally() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/networks",
        Some(serde_json::json!({ "name": "lab", "cidr": "not-a-cidr" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn stats_count_requests() {
    let app = app();
    send(&app, Method::GET, "/api/nodes", None).await;
    let (status, body) = send(&app, Method::GET, "/api/stats", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.is_object());
}

#[tokio::test]
async fn metrics_endpoint_without_recorder_is_not_found() {
    let app = app();
    let (status, _) = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
