use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    Validation {
        message: String,
        code: &'static str,
        details: Value,
    },
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    UnprocessableEntity(String),
    #[error("{0}")]
    Dependency(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Infrastructure failures abort a whole batch; everything else is a
    /// per-item business-rule rejection.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Dependency(_) | Self::Internal(_))
    }

    /// Message safe to show to clients.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        if matches!(error, sqlx::Error::RowNotFound) {
            return Self::NotFound("Record not found.".to_string());
        }

        let code = error
            .as_database_error()
            .and_then(|db_error| db_error.code())
            .map(|code| code.into_owned());
        tracing::error!(db_error = %error, code = ?code, "Database query failed");

        if let Some(mapped) = code.as_deref().and_then(from_sqlstate) {
            return mapped;
        }
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                Self::Dependency("Database operation failed.".to_string())
            }
            other => Self::Internal(format!("Database error: {other}")),
        }
    }
}

/// Maps the Postgres error codes callers can act on. Unlisted codes fall
/// through to the error kind.
fn from_sqlstate(code: &str) -> Option<AppError> {
    let error = match code {
        "23505" => {
            AppError::Conflict("Duplicate value violates a unique constraint.".to_string())
        }
        "23503" => {
            AppError::BadRequest("Referenced record does not exist or is still in use.".to_string())
        }
        "23514" | "22P02" => AppError::BadRequest("Value violates a column constraint.".to_string()),
        "40001" | "40P01" => AppError::Conflict(
            "Concurrent update on the same records; retry the request.".to_string(),
        ),
        class if class.starts_with("08") || class == "57P01" || class == "57P03" => {
            AppError::Dependency("Database operation failed.".to_string())
        }
        _ => return None,
    };
    Some(error)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::Internal(detail) = &self {
            tracing::error!(error = %detail, "Unhandled request failure");
        }

        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.public_message()));
        if let Self::Validation { code, details, .. } = self {
            body.insert("code".to_string(), Value::String(code.to_string()));
            if !details.is_null() {
                body.insert("details".to_string(), details);
            }
        }

        (status, Json(Value::Object(body))).into_response()
    }
}

pub fn allocation_exceeds_budget(budget_total: f64, requested_total: f64) -> AppError {
    AppError::Validation {
        message: "Fund allocations exceed the budget total.".to_string(),
        code: "ALLOCATION_EXCEEDS_BUDGET",
        details: json!({
            "budget_total": budget_total,
            "requested_total": requested_total,
            "excess": round_cents(requested_total - budget_total),
        }),
    }
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(error: AppError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_details() {
        let (status, body) =
            body_json(AppError::Internal("connection string postgres://secret".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error.");
    }

    #[tokio::test]
    async fn validation_errors_carry_code_and_details() {
        let (status, body) = body_json(allocation_exceeds_budget(1000.0, 1250.5)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "ALLOCATION_EXCEEDS_BUDGET");
        assert_eq!(body["details"]["excess"], 250.5);
    }

    #[test]
    fn dependency_maps_to_service_unavailable() {
        let error = AppError::Dependency("db down".to_string());
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(error.is_infrastructure());
        assert!(!AppError::Conflict("dup".to_string()).is_infrastructure());
    }

    #[test]
    fn connection_failures_are_dependency_errors() {
        let error = AppError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            AppError::from(sqlx::Error::PoolClosed),
            AppError::Dependency(_)
        ));
    }

    #[test]
    fn query_bugs_are_internal_not_unavailable() {
        let error = AppError::from(sqlx::Error::ColumnNotFound("total".to_string()));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.public_message(), "Internal server error.");
        assert!(matches!(
            AppError::from(sqlx::Error::RowNotFound),
            AppError::NotFound(_)
        ));
    }

    #[test]
    fn constraint_violations_map_to_client_errors() {
        let status = |code| from_sqlstate(code).map(|error| error.status());
        assert_eq!(status("23505"), Some(StatusCode::CONFLICT));
        assert_eq!(status("23503"), Some(StatusCode::BAD_REQUEST));
        assert_eq!(status("23514"), Some(StatusCode::BAD_REQUEST));
        assert_eq!(status("40P01"), Some(StatusCode::CONFLICT));
        assert_eq!(status("08006"), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(status("42703"), None);
        assert!(!from_sqlstate("23505").is_some_and(|error| error.is_infrastructure()));
    }
}
