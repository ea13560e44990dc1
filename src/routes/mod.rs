use axum::{routing::get, Router};
use serde_json::Value;

use crate::state::AppState;

pub mod budgets;
pub mod charges;
pub mod funds;
pub mod health;
pub mod identity;
pub mod incomes;
mod items;
pub mod payment_transfers;
pub mod recurring_transfers;
pub mod reimbursements;
pub mod reports;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/me", get(identity::me))
        .merge(budgets::router())
        .merge(funds::router())
        .merge(incomes::router())
        .merge(reimbursements::router())
        .merge(charges::router())
        .merge(recurring_transfers::router())
        .merge(payment_transfers::router())
        .merge(reports::router())
}

fn value_i64(row: &Value, key: &str) -> Option<i64> {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_i64)
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::v1_router;
    use crate::{config::AppConfig, state::AppState};

    fn app(config: AppConfig) -> Router {
        Router::new()
            .nest("/v1", v1_router())
            .with_state(AppState::with_pool(config, None))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("router responds");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request builds")
    }

    #[tokio::test]
    async fn health_without_database_is_ok() {
        let (status, body) = send(app(AppConfig::for_tests()), get("/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["db"], true);
    }

    #[tokio::test]
    async fn data_endpoints_require_a_bearer_token() {
        for uri in [
            "/v1/me",
            "/v1/budgets",
            "/v1/payment-transfers",
            "/v1/reports/validate?year=2026",
        ] {
            let (status, body) = send(app(AppConfig::for_tests()), get(uri)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
            assert!(body["error"].as_str().is_some_and(|e| e.contains("bearer")));
        }
    }

    #[tokio::test]
    async fn authenticated_requests_without_database_are_unavailable() {
        let mut config = AppConfig::for_tests();
        config.dev_auth_overrides_enabled = true;
        let request = Request::builder()
            .uri("/v1/budgets")
            .header("x-user-id", "7")
            .body(Body::empty())
            .expect("request builds");

        let (status, body) = send(app(config), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Database is not configured. Set DATABASE_URL.");
    }

    #[tokio::test]
    async fn batch_size_is_checked_before_touching_the_database() {
        let mut config = AppConfig::for_tests();
        config.dev_auth_overrides_enabled = true;
        let ids = (1..=201).collect::<Vec<i64>>();
        let request = Request::builder()
            .method("POST")
            .uri("/v1/reimbursements/batch-approve")
            .header("x-user-id", "7")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "ids": ids }).to_string()))
            .expect("request builds");

        let (status, _) = send(app(config), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
