use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Keeps a caller-supplied `x-request-id` or assigns a fresh uuid, and
/// echoes it on the response.
pub async fn inject_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID)
        .filter(|value| is_usable(value))
        .cloned()
        .unwrap_or_else(fresh_request_id);
    request
        .headers_mut()
        .insert(REQUEST_ID.clone(), request_id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID.clone(), request_id);
    response
}

fn is_usable(value: &HeaderValue) -> bool {
    value
        .to_str()
        .map(|raw| !raw.trim().is_empty() && raw.len() <= 128)
        .unwrap_or(false)
}

fn fresh_request_id() -> HeaderValue {
    let id = uuid::Uuid::new_v4().to_string();
    HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(inject_request_id))
    }

    #[tokio::test]
    async fn echoes_a_supplied_request_id() {
        let request = HttpRequest::builder()
            .uri("/")
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .expect("request builds");
        let response = app().oneshot(request).await.expect("router responds");
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn assigns_a_uuid_when_missing() {
        let request = HttpRequest::builder()
            .uri("/")
            .body(Body::empty())
            .expect("request builds");
        let response = app().oneshot(request).await.expect("router responds");
        let id = response.headers()["x-request-id"]
            .to_str()
            .expect("ascii header");
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }
}
