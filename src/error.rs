use axum::response::{IntoResponse, Response};
use http::StatusCode;
use log::error;

use crate::cache_fronted::CacheError;
use crate::images::UpstreamError;


/// Failure of a request handler, mapped onto an HTTP status.
///
/// Client errors carry their message to the client; store, upstream and
/// internal failures are logged and answered with a generic message.
#[derive(Debug)]
pub enum HandlerError {
    Cache(CacheError),
    Upstream(UpstreamError),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Cache(e @ (CacheError::Validation{..} | CacheError::InvalidKey(_))) => {
                (StatusCode::BAD_REQUEST, e.to_string()).into_response()
            }
            HandlerError::Cache(e) => {
                error!("key value store failure: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
            HandlerError::Upstream(UpstreamError::MissingCredential) => {
                error!("image search is not configured: set CLIENT_ID");
                (StatusCode::INTERNAL_SERVER_ERROR, "image search is not configured").into_response()
            }
            HandlerError::Upstream(e) => {
                error!("upstream failure: {e}");
                (StatusCode::BAD_GATEWAY, "image search failed").into_response()
            }
            HandlerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            HandlerError::Internal(e) => {
                error!("internal error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

impl From<CacheError> for HandlerError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl From<UpstreamError> for HandlerError {
    fn from(err: UpstreamError) -> Self {
        Self::Upstream(err)
    }
}

impl From<http::Error> for HandlerError {
    fn from(err: http::Error) -> Self {
        Self::Internal(err.into())
    }
}

#[test]
fn test_status_mapping() {
    let validation = HandlerError::from(CacheError::Validation { message: "expected value at line 1 column 1".to_string() });
    assert_eq!(validation.into_response().status(), StatusCode::BAD_REQUEST);

    let corrupt = HandlerError::from(CacheError::CorruptEntry { key: "k".to_string(), message: "eof".to_string() });
    assert_eq!(corrupt.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

    let upstream = HandlerError::from(UpstreamError::Status(StatusCode::UNAUTHORIZED));
    assert_eq!(upstream.into_response().status(), StatusCode::BAD_GATEWAY);

    let unconfigured = HandlerError::from(UpstreamError::MissingCredential);
    assert_eq!(unconfigured.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
}
