//! Docs listener (§4.9): static serving of the generated site, with an
//! optional livereload script injected into HTML responses.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use tower_http::services::ServeDir;

const MAX_INJECTED_BODY: usize = 16 * 1024 * 1024;

/// Build the docs router serving `site_dir`. When `livereload_port` is
/// `Some`, a small script tag pointing at the livereload websocket is
/// injected before `</body>` in any `text/html` response.
pub fn router(site_dir: impl Into<std::path::PathBuf>, livereload_port: Option<u16>) -> Router {
    let serve = ServeDir::new(site_dir.into()).append_index_html_on_directories(true);
    let router = Router::new().fallback_service(serve);
    match livereload_port {
        Some(port) => router.layer(middleware::from_fn(move |req: Request, next: Next| inject_livereload(req, next, port))),
        None => router,
    }
}

async fn inject_livereload(req: Request, next: Next, port: u16) -> Response {
    let response = next.run(req).await;
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));
    if !is_html {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_INJECTED_BODY).await {
        Ok(b) => b,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };
    let html = String::from_utf8_lossy(&bytes);
    let script = format!(
        "<script>(function(){{var ws=new WebSocket('ws://'+location.hostname+':{port}/ws');ws.onmessage=function(e){{if(e.data==='reload')location.reload();}};}})();</script>"
    );
    let injected = match html.rfind("</body>") {
        Some(idx) => format!("{}{}{}", &html[..idx], script, &html[idx..]),
        None => format!("{html}{script}"),
    };
    Response::from_parts(parts, Body::from(injected)).into_response()
}
