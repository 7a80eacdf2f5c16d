//! Request correlation IDs.
//!
//! Every request runs inside a `request` span tagged with an ID, and the same
//! ID is echoed in the `x-request-id` response header. A well-formed ID sent
//! by the client (or a proxy in front of us) is reused; anything else is
//! replaced with a fresh UUID.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Longest client-supplied ID we accept.
const MAX_ID_LEN: usize = 128;

fn accept_client_id(value: &HeaderValue) -> Option<String> {
    let id = value.to_str().ok()?.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    valid.then(|| id.to_string())
}

pub async fn request_id_middleware(request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(accept_client_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %request.method(),
        path = request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    async fn echoed(header: Option<&str>) -> String {
        let mut req = Request::get("/");
        if let Some(h) = header {
            req = req.header("x-request-id", h);
        }
        let response = app().oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        response.headers()[&X_REQUEST_ID].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn generates_an_id() {
        let id = echoed(None).await;
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn reuses_a_well_formed_client_id() {
        assert_eq!(echoed(Some("lb-7f3a.42")).await, "lb-7f3a.42");
    }

    #[tokio::test]
    async fn replaces_a_suspicious_client_id() {
        let id = echoed(Some("a b\tc")).await;
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
