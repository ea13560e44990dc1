use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Datelike;
use serde_json::{json, Value};

use crate::{
    auth::require_access_profile,
    error::AppResult,
    schemas::{requested_scope, AnnualReportQuery, MonthlyReportQuery, ValidateReportQuery},
    services::{
        report_validation::validate_reports,
        reports::{annual_report, monthly_report, period_bounds},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/reports/monthly", axum::routing::get(monthly))
        .route("/reports/annual", axum::routing::get(annual))
        .route("/reports/validate", axum::routing::get(validate))
}

async fn monthly(
    State(state): State<AppState>,
    Query(query): Query<MonthlyReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    period_bounds(query.year, Some(query.month))?;
    let profile = require_access_profile(&state, &headers).await?;
    let scopes =
        profile.requested_scopes(requested_scope(query.budget_type.as_deref(), query.group_id)?)?;
    let pool = state.db_pool()?;

    let report = monthly_report(pool, &scopes, query.year, query.month).await?;
    Ok(Json(json!(report)))
}

async fn annual(
    State(state): State<AppState>,
    Query(query): Query<AnnualReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    period_bounds(query.year, None)?;
    let profile = require_access_profile(&state, &headers).await?;
    let scopes =
        profile.requested_scopes(requested_scope(query.budget_type.as_deref(), query.group_id)?)?;
    let pool = state.db_pool()?;

    let report = annual_report(pool, &scopes, query.year).await?;
    Ok(Json(json!(report)))
}

/// Cross-checks stored and derived aggregates for a year (default: the
/// current treasury year).
async fn validate(
    State(state): State<AppState>,
    Query(query): Query<ValidateReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let year = query.year.unwrap_or_else(|| state.config.today().year());
    period_bounds(year, None)?;
    let profile = require_access_profile(&state, &headers).await?;
    let scopes =
        profile.requested_scopes(requested_scope(query.budget_type.as_deref(), query.group_id)?)?;
    let pool = state.db_pool()?;

    let summary = validate_reports(pool, &scopes, year, state.config.report_tolerance).await?;
    Ok(Json(json!(summary)))
}
