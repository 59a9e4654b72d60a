//! Shared middleware chain (§4.9): structured request logging plus panic
//! recovery that turns a panicking handler into a classified `internal`
//! error response instead of a dropped connection.

use std::any::Any;

use axum::Router;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use docbuilder_types::{Category, ClassifiedError};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Wrap `router` with request tracing and panic recovery, in that order
/// (trace sees the panic as a 500 response, not a connection drop).
pub fn with_common_layers(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");
    let err = ClassifiedError::builder(Category::Internal, detail).build();
    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(err.to_http_body())).into_response()
}

/// Build the canonical error response body for a classified error (§4.1,
/// §6): `{error, code, details?, retryable?}` with the matching status.
pub fn error_response(err: &ClassifiedError) -> Response {
    let status = StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(err.to_http_body())).into_response()
}
