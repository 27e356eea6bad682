use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::body::Body;
use axum::debug_handler;
use axum::extract::{FromRef, Query, State};
use axum::{Router, routing::get, response::{Response, IntoResponse, Redirect}, Json, extract::Path};
use bytes::Bytes;
use edgekv_config::Config;
use http::{header, HeaderMap, StatusCode};
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::cache_fronted::{CacheFrontedStore, CorruptEntryPolicy};
use crate::client_address::{ClientAddress, TrustForwardedHeaders};
use crate::edge_cache::EdgeCachedStore;
use crate::error::HandlerError;
use crate::images::{cors_headers, AllowedOrigins, ImageSearch, SearchRequest};
use crate::memory_store::MemoryStore;
use crate::pg_store::PgStore;
use crate::store::{ReadOptions, SharedStore};

pub mod store;
pub mod memory_store;
pub mod pg_store;
pub mod edge_cache;
pub mod cache_fronted;
pub mod client_address;
pub mod error;
pub mod images;
pub mod todo;
pub mod user;

pub use edgekv_config as config;

static SWAGGER_SPEC: OnceLock<swagger_ui::Spec> = OnceLock::new();

const SWAGGER_SPEC_URL: &str = "/api/public/openapi.yaml";

#[derive(Clone)]
struct EdgeState {
    store: CacheFrontedStore<SharedStore>,
    images: ImageSearch,
    allowed_origins: AllowedOrigins,
    trust_forwarded_headers: TrustForwardedHeaders,
}

impl FromRef<EdgeState> for TrustForwardedHeaders {
    fn from_ref(state: &EdgeState) -> Self {
        state.trust_forwarded_headers
    }
}

pub fn init_logging(cfg: impl Config) {
    let rust_log_config = cfg.get("RUST_LOG").ok();
    let mut logger_builder = env_logger::builder();
    if let Some(rust_log) = rust_log_config {
        logger_builder.parse_filters(&rust_log);
    } else {
        logger_builder.filter_level(log::LevelFilter::Info);
    }
    logger_builder.init();
}

fn flag(cfg: &impl Config, key: &str) -> Result<bool> {
    match cfg.get_opt(key).map(|v|v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(anyhow!("{key} must be 'true' or 'false', not '{other}'")),
    }
}

fn default_cache_ttl(cfg: &impl Config) -> Result<Option<Duration>> {
    match cfg.get_opt("KV_CACHE_TTL") {
        Some(secs) => {
            let secs: u64 = secs.trim().parse().map_err(|e|anyhow!("KV_CACHE_TTL must be a number of seconds: {e}"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        None => Ok(None),
    }
}

/// Opens the key value store configured by `PG_ADDRESS`, or an in-memory
/// store if there is none, wrapped into the freshness window cache.
pub async fn open_store(cfg: impl Config) -> Result<SharedStore> {
    let origin: SharedStore = match cfg.get_opt("PG_ADDRESS") {
        Some(pg_address) => {
            log::debug!("connecting to database...");
            let pool = pg_store::connect_db(&pg_address).await?;
            log::debug!("connected.");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("PG_ADDRESS not set, using a non-durable in-memory key value store");
            Arc::new(MemoryStore::new())
        }
    };

    let default_ttl = default_cache_ttl(&cfg)?;
    if let Some(ttl) = default_ttl {
        info!("default freshness window is {}s", ttl.as_secs());
    }
    Ok(Arc::new(EdgeCachedStore::new(origin).with_default_ttl(default_ttl)))
}

pub fn build_router(store: SharedStore, config: impl Config) -> Result<Router>
{
    let corrupt_entry_policy = match config.get_opt("KV_CORRUPT_ENTRY") {
        Some(policy) => policy.parse::<CorruptEntryPolicy>()?,
        None => CorruptEntryPolicy::default(),
    };
    let allowed_origins = AllowedOrigins::parse(&config.get_opt("ALLOWED_ORIGINS").unwrap_or_default());
    let trust_forwarded_headers = TrustForwardedHeaders(flag(&config, "TRUST_FORWARDED_HEADERS")?);
    if !trust_forwarded_headers.0 {
        info!("forwarded client address headers are ignored, todo lists are keyed by peer address");
    }

    let state = EdgeState {
        store: CacheFrontedStore::new(store).with_corrupt_entry_policy(corrupt_entry_policy),
        images: ImageSearch::from_config(&config),
        allowed_origins,
        trust_forwarded_headers,
    };

    Ok(Router::new()
    .route(SWAGGER_SPEC_URL, get(handle_get_swagger_spec))
    .route("/api/public/swagger-ui/:path", get(handle_get_swagger_ui))
    .route("/todos", get(handle_get_todos).put(handle_put_todos))
    .route("/set", get(handle_get_set))
    .route("/get", get(handle_get_get))
    .route("/images", axum::routing::post(handle_post_images)
        .options(handle_options_images)
        .fallback(handle_invalid_method))
    .route("/", get(handle_get_root))
    .with_state(state))
}

async fn handle_get_root() -> Redirect {
    Redirect::temporary(&format!("/api/public/swagger-ui/index.html?url={SWAGGER_SPEC_URL}"))
}

async fn handle_get_swagger_spec() -> Result<Response<Body>, HandlerError> {
    let spec = SWAGGER_SPEC.get_or_init(||swagger_ui::swagger_spec_file!("../edgekv.yaml"));
    let resp = Response::builder()
    .status(200)
    .header(header::CONTENT_TYPE, "application/yaml")
    .body(Body::from(Bytes::copy_from_slice(spec.content)))
    ?;

    Ok(resp)
}

#[debug_handler]
async fn handle_get_swagger_ui(Path(path): Path<String>) -> Result<Response<Body>, HandlerError>{

    let resp = match swagger_ui::Assets::get(&path) {
        Some(data) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, mime.to_string())
            .body(Body::from(Bytes::copy_from_slice(data.as_ref())))?
        },
        None => Response::builder()
            .status(404)
            .body(Body::from(Bytes::from_static(b"404 Not Found")))?
    };

    Ok(resp)
}

#[derive(Deserialize)]
struct TodoQueryParams {
    cache_ttl: Option<u64>,
}

fn read_options(cache_ttl: Option<u64>) -> Result<ReadOptions, HandlerError> {
    match cache_ttl {
        Some(0) => Err(HandlerError::BadRequest("cache_ttl must be a positive number of seconds".to_string())),
        Some(secs) => Ok(ReadOptions::with_cache_ttl(Duration::from_secs(secs))),
        None => Ok(ReadOptions::default()),
    }
}

#[debug_handler]
async fn handle_get_todos(State(state): State<EdgeState>, ClientAddress(address): ClientAddress, Query(query): Query<TodoQueryParams>) -> Result<Json<Value>, HandlerError> {
    let options = read_options(query.cache_ttl)?;
    let todos = todo::get_todos(&state.store, address, options).await?;
    Ok(Json(todos))
}

#[debug_handler]
async fn handle_put_todos(State(state): State<EdgeState>, ClientAddress(address): ClientAddress, body: String) -> Result<Response<Body>, HandlerError> {
    todo::put_todos(&state.store, address, body.clone()).await?;
    json_response(body)
}

fn json_response(body: String) -> Result<Response<Body>, HandlerError> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))?
    )
}

#[derive(Deserialize)]
struct SetQueryParams {
    name: Option<String>,
}

#[debug_handler]
async fn handle_get_set(State(state): State<EdgeState>, Query(query): Query<SetQueryParams>) -> Result<Response<Body>, HandlerError> {
    let name = query.name.unwrap_or_else(||user::DEFAULT_USER_NAME.to_string());
    let user = user::set_user(&state.store, &name).await?;
    json_response(user)
}

#[debug_handler]
async fn handle_get_get(State(state): State<EdgeState>) -> Result<Response<Body>, HandlerError> {
    // an unset user yields an empty body
    let user = user::get_user(&state.store).await?.unwrap_or_default();
    json_response(user)
}

fn request_origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::ORIGIN).and_then(|o|o.to_str().ok())
}

#[debug_handler]
async fn handle_post_images(State(state): State<EdgeState>, headers: HeaderMap, body: Bytes) -> Result<Response, HandlerError> {
    // any content type is accepted, as long as the body is a search request
    let request: SearchRequest = serde_json::from_slice(&body)
    .map_err(|e|HandlerError::BadRequest(format!("invalid search request: {e}")))?;
    let images = state.images.search(&request.query).await?;
    let origin = state.allowed_origins.check(request_origin(&headers));
    Ok((StatusCode::OK, cors_headers(&origin), Json(images)).into_response())
}

#[debug_handler]
async fn handle_options_images(State(state): State<EdgeState>, headers: HeaderMap) -> Response {
    let origin = state.allowed_origins.check(request_origin(&headers));
    (StatusCode::OK, cors_headers(&origin), "OK").into_response()
}

async fn handle_invalid_method() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "Invalid method")
}

#[test]
fn test_read_options() {
    assert!(read_options(Some(0)).is_err());
    assert_eq!(read_options(None).unwrap(), ReadOptions::default());
    assert_eq!(read_options(Some(60)).unwrap().cache_ttl, Some(Duration::from_secs(60)));
}

#[test]
fn test_flag() {
    use edgekv_config::HashMapConfig;

    let config = HashMapConfig::default()
    .with("ON", " True ")
    .with("OFF", "0")
    .with("BAD", "yes");
    assert!(flag(&config, "ON").unwrap());
    assert!(!flag(&config, "OFF").unwrap());
    assert!(!flag(&config, "MISSING").unwrap());
    assert!(flag(&config, "BAD").is_err());
}
