use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use edgekv::config::HashMapConfig;
use edgekv::edge_cache::EdgeCachedStore;
use edgekv::images::Image;
use edgekv::memory_store::MemoryStore;
use edgekv::store::{KeyValueStore, ReadOptions, SharedStore};
use http::{header, HeaderMap, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

const CLIENT: &str = "1.2.3.4";

fn router_with(store: SharedStore, config: HashMapConfig) -> Router {
    edgekv::build_router(store, config).unwrap()
}

/// Configuration of a service behind a proxy that sets the client address headers.
fn behind_proxy() -> HashMapConfig {
    HashMapConfig::default().with("TRUST_FORWARDED_HEADERS", "true")
}

fn memory_router() -> (Router, MemoryStore) {
    let memory = MemoryStore::new();
    (router_with(Arc::new(memory.clone()), behind_proxy()), memory)
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

fn get_todos(uri: &str) -> Request<Body> {
    Request::builder()
    .uri(uri)
    .header("CF-Connecting-IP", CLIENT)
    .body(Body::empty())
    .unwrap()
}

fn put_todos(body: &str) -> Request<Body> {
    Request::builder()
    .method("PUT")
    .uri("/todos")
    .header("CF-Connecting-IP", CLIENT)
    .body(Body::from(body.to_string()))
    .unwrap()
}

#[tokio::test]
async fn first_read_initializes_todos() {
    let (router, memory) = memory_router();

    let (status, _, body) = send(&router, get_todos("/todos")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"todos": []}));

    let stored = memory.get("data-1.2.3.4", ReadOptions::default()).await.unwrap();
    assert_eq!(stored.as_deref(), Some(r#"{"todos":[]}"#));
}

#[tokio::test]
async fn written_todos_are_read_back() {
    let (router, memory) = memory_router();
    let payload = r#"{"todos":[{"id":1,"name":"milk","completed":false}]}"#;

    let (status, headers, body) = send(&router, put_todos(payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(body, payload);

    let (status, _, body) = send(&router, get_todos("/todos")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["todos"][0]["name"], "milk");
    assert_eq!(memory.get("data-1.2.3.4", ReadOptions::default()).await.unwrap().as_deref(), Some(payload));
}

#[tokio::test]
async fn invalid_todos_are_rejected() {
    let (router, memory) = memory_router();
    send(&router, put_todos(r#"{"todos":[]}"#)).await;

    let (status, _, body) = send(&router, put_todos("not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.is_empty());
    assert_eq!(memory.get("data-1.2.3.4", ReadOptions::default()).await.unwrap().as_deref(), Some(r#"{"todos":[]}"#));
}

#[tokio::test]
async fn clients_are_told_apart() {
    let (router, memory) = memory_router();
    send(&router, put_todos(r#"{"todos":[{"id":1,"name":"milk","completed":false}]}"#)).await;

    let other = Request::builder()
    .uri("/todos")
    .header("X-Forwarded-For", "5.6.7.8, 10.0.0.1")
    .body(Body::empty())
    .unwrap();
    let (status, _, body) = send(&router, other).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"todos": []}));
    assert_eq!(memory.len(), 2);
}

#[tokio::test]
async fn todos_need_a_client_address() {
    let (router, _) = memory_router();
    let req = Request::builder().uri("/todos").body(Body::empty()).unwrap();

    let (status, _, _) = send(&router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forwarded_headers_are_ignored_unless_trusted() {
    let memory = MemoryStore::new();
    let router = router_with(Arc::new(memory.clone()), HashMapConfig::default());
    let peer: SocketAddr = "192.0.2.10:40000".parse().unwrap();

    let mut req = put_todos(r#"{"todos":[{"id":1,"name":"milk","completed":false}]}"#);
    req.extensions_mut().insert(ConnectInfo(peer));
    let (status, _, _) = send(&router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(memory.get("data-192.0.2.10", ReadOptions::default()).await.unwrap().is_some());
    assert_eq!(memory.get("data-1.2.3.4", ReadOptions::default()).await.unwrap(), None);

    // the header alone does not name a client
    let (status, _, _) = send(&router, get_todos("/todos")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(memory.len(), 1);
}

#[test]
fn unknown_trust_setting_fails_router_setup() {
    let config = HashMapConfig::default().with("TRUST_FORWARDED_HEADERS", "maybe");
    assert!(edgekv::build_router(Arc::new(MemoryStore::new()), config).is_err());
}

#[tokio::test]
async fn zero_freshness_window_is_rejected() {
    let (router, _) = memory_router();

    let (status, _, _) = send(&router, get_todos("/todos?cache_ttl=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send(&router, get_todos("/todos?cache_ttl=soon")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn freshness_window_may_serve_previous_document() {
    let store: SharedStore = Arc::new(EdgeCachedStore::new(MemoryStore::new()));
    let router = router_with(store, behind_proxy());
    let first = r#"{"todos":[{"id":1,"name":"milk","completed":false}]}"#;
    let second = r#"{"todos":[{"id":1,"name":"milk","completed":true}]}"#;

    send(&router, put_todos(first)).await;
    let (_, _, body) = send(&router, get_todos("/todos?cache_ttl=60")).await;
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["todos"][0]["completed"], false);

    send(&router, put_todos(second)).await;
    let (_, _, body) = send(&router, get_todos("/todos?cache_ttl=60")).await;
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["todos"][0]["completed"], false);

    let (_, _, body) = send(&router, get_todos("/todos")).await;
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["todos"][0]["completed"], true);
}

#[tokio::test]
async fn corrupt_entry_policy_is_configurable() {
    let memory = MemoryStore::new();
    memory.put("data-1.2.3.4", "{oops".to_string()).await.unwrap();

    let failing = router_with(Arc::new(memory.clone()), behind_proxy());
    let (status, _, body) = send(&failing, get_todos("/todos")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.contains("oops"));

    let resetting = router_with(Arc::new(memory.clone()), behind_proxy().with("KV_CORRUPT_ENTRY", "reset"));
    let (status, _, body) = send(&resetting, get_todos("/todos")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"todos": []}));
}

#[test]
fn unknown_corrupt_entry_policy_fails_router_setup() {
    let config = HashMapConfig::default().with("KV_CORRUPT_ENTRY", "shrug");
    assert!(edgekv::build_router(Arc::new(MemoryStore::new()), config).is_err());
}

#[tokio::test]
async fn set_and_get_user() {
    let (router, _) = memory_router();
    let get = || Request::builder().uri("/get").body(Body::empty()).unwrap();

    let (status, _, body) = send(&router, get()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "");

    let (status, headers, body) = send(&router, Request::builder().uri("/set").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(body, r#"{"name":"MP"}"#);

    send(&router, Request::builder().uri("/set?name=Ada").body(Body::empty()).unwrap()).await;
    let (_, _, body) = send(&router, get()).await;
    assert_eq!(body, r#"{"name":"Ada"}"#);
}

#[tokio::test]
async fn user_is_only_read_at_get() {
    let (router, _) = memory_router();
    send(&router, Request::builder().uri("/set?name=Ada").body(Body::empty()).unwrap()).await;

    let (status, _, body) = send(&router, Request::builder().uri("/whoami").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!body.contains("Ada"));
}

async fn fake_search(Query(params): Query<HashMap<String, String>>, headers: HeaderMap) -> Response {
    if headers.get(header::AUTHORIZATION).and_then(|v|v.to_str().ok()) != Some("Client-ID test-client") {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let query = params.get("query").cloned().unwrap_or_default();
    Json(json!({
        "total": 1,
        "total_pages": 1,
        "results": [
            {"id": query, "urls": {"small": "https://images.test/small.jpg"}, "links": {"html": "https://photos.test/p"}}
        ]
    })).into_response()
}

/// Serves a stand-in for the photo search API and returns its base URL.
async fn spawn_fake_search() -> String {
    let app = Router::new().route("/search/photos", get(fake_search));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{address}")
}

fn search(query: &str, origin: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
    .method("POST")
    .uri("/images")
    .header(header::CONTENT_TYPE, "application/json");
    if let Some(origin) = origin {
        builder = builder.header(header::ORIGIN, origin);
    }
    builder.body(Body::from(json!({ "query": query }).to_string())).unwrap()
}

#[tokio::test]
async fn image_search_reshapes_results() {
    let base_url = spawn_fake_search().await;
    let config = HashMapConfig::default()
    .with("UNSPLASH_API_URL", &base_url)
    .with("CLIENT_ID", "test-client");
    let router = router_with(Arc::new(MemoryStore::new()), config);

    let (status, headers, body) = send(&router, search("red fox", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "POST");

    let images: Vec<Image> = serde_json::from_str(&body).unwrap();
    assert_eq!(images, vec![Image {
        id: "red fox".to_string(),
        image: "https://images.test/small.jpg".to_string(),
        link: "https://photos.test/p".to_string(),
    }]);
}

#[tokio::test]
async fn image_search_accepts_any_content_type() {
    let base_url = spawn_fake_search().await;
    let config = HashMapConfig::default()
    .with("UNSPLASH_API_URL", &base_url)
    .with("CLIENT_ID", "test-client");
    let router = router_with(Arc::new(MemoryStore::new()), config);
    let post = |body: &str| Request::builder()
    .method("POST")
    .uri("/images")
    .body(Body::from(body.to_string()))
    .unwrap();

    let (status, _, body) = send(&router, post(r#"{"query":"owl"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Vec<Image>>(&body).unwrap()[0].id, "owl");

    let (status, _, _) = send(&router, post("query=owl")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send(&router, post(r#"{"term":"owl"}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn image_search_upstream_failure_is_bad_gateway() {
    let base_url = spawn_fake_search().await;
    let config = HashMapConfig::default()
    .with("UNSPLASH_API_URL", &base_url)
    .with("CLIENT_ID", "wrong-client");
    let router = router_with(Arc::new(MemoryStore::new()), config);

    let (status, _, body) = send(&router, search("fox", None)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(!body.contains("bad credentials"));
}

#[tokio::test]
async fn image_search_without_credential() {
    let (router, _) = memory_router();

    let (status, _, _) = send(&router, search("fox", None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn image_preflight_and_methods() {
    let config = HashMapConfig::default().with("ALLOWED_ORIGINS", "https://viewer.pages.dev,http://localhost:3000");
    let router = router_with(Arc::new(MemoryStore::new()), config);

    let preflight = Request::builder()
    .method("OPTIONS")
    .uri("/images")
    .header(header::ORIGIN, "http://localhost:3000")
    .body(Body::empty())
    .unwrap();
    let (status, headers, body) = send(&router, preflight).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:3000");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "*");

    let (status, _, body) = send(&router, Request::builder().uri("/images").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body, "Invalid method");
}

#[tokio::test]
async fn api_description_is_served() {
    let (router, _) = memory_router();

    let (status, _, body) = send(&router, Request::builder().uri("/api/public/openapi.yaml").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("/todos"));

    let (status, headers, _) = send(&router, Request::builder().uri("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert!(headers[header::LOCATION].to_str().unwrap().starts_with("/api/public/swagger-ui/index.html"));
}
