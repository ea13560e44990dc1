use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::{
    access::{can_access_budget, require_budget_type_access, AccessProfile},
    auth::require_access_profile,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateIncomeInput,
        IncomePath, IncomesQuery, UpdateIncomeInput,
    },
    services::budget_scope::{fetch_fund_ref, resolve_budget_scope},
    state::AppState,
};

use super::value_i64;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/incomes",
            axum::routing::get(list_incomes).post(create_income),
        )
        .route(
            "/incomes/{income_id}",
            axum::routing::get(get_income)
                .patch(update_income)
                .delete(delete_income),
        )
}

fn income_filters(query: &IncomesQuery) -> Map<String, Value> {
    let mut filters = Map::new();
    if let Some(budget_id) = query.budget_id {
        filters.insert("budget_id".to_string(), json!(budget_id));
    }
    if let Some(fund_id) = query.fund_id {
        filters.insert("fund_id".to_string(), json!(fund_id));
    }
    if let Some(from_date) = query.from_date {
        filters.insert("income_date__gte".to_string(), json!(from_date));
    }
    if let Some(to_date) = query.to_date {
        filters.insert("income_date__lte".to_string(), json!(to_date));
    }
    filters
}

/// Incomes are listed per budget; the budget must be visible to the caller.
async fn list_incomes(
    State(state): State<AppState>,
    Query(query): Query<IncomesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let Some(budget_id) = query.budget_id else {
        return Err(AppError::BadRequest(
            "budget_id is required to list incomes.".to_string(),
        ));
    };
    if !can_access_budget(pool, &profile, budget_id).await? {
        return Err(AppError::Forbidden(
            "Forbidden: no access to this budget.".to_string(),
        ));
    }

    let filters = income_filters(&query);
    let rows = list_rows(
        pool,
        "incomes",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "income_date",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_income(
    State(state): State<AppState>,
    Path(path): Path<IncomePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let row = get_row(pool, "incomes", path.income_id).await?;
    let budget_id = income_budget_id(&row, path.income_id)?;
    if !can_access_budget(pool, &profile, budget_id).await? {
        return Err(AppError::Forbidden(
            "Forbidden: no access to this income.".to_string(),
        ));
    }
    Ok(Json(row))
}

fn income_budget_id(row: &Value, income_id: i64) -> AppResult<i64> {
    value_i64(row, "budget_id")
        .ok_or_else(|| AppError::Internal(format!("Income {income_id} has no budget.")))
}

async fn require_budget_treasurer(
    pool: &PgPool,
    profile: &AccessProfile,
    budget_id: i64,
) -> AppResult<()> {
    let scope = resolve_budget_scope(pool, budget_id).await?;
    require_budget_type_access(profile, &scope)
}

async fn ensure_fund_in_budget(pool: &PgPool, fund_id: i64, budget_id: i64) -> AppResult<()> {
    let fund = fetch_fund_ref(pool, fund_id).await?;
    if fund.budget_id != budget_id {
        return Err(AppError::BadRequest(format!(
            "Fund {fund_id} does not belong to budget {budget_id}."
        )));
    }
    Ok(())
}

async fn create_income(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateIncomeInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    require_budget_treasurer(pool, &profile, payload.budget_id).await?;
    if let Some(fund_id) = payload.fund_id {
        ensure_fund_in_budget(pool, fund_id, payload.budget_id).await?;
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("created_by".to_string(), json!(profile.user_id));
    let created = create_row(pool, "incomes", &record).await?;

    tracing::info!(
        income_id = value_i64(&created, "id"),
        budget_id = payload.budget_id,
        amount = payload.amount,
        "Recorded income"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_income(
    State(state): State<AppState>,
    Path(path): Path<IncomePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateIncomeInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let row = get_row(pool, "incomes", path.income_id).await?;
    let budget_id = income_budget_id(&row, path.income_id)?;
    require_budget_treasurer(pool, &profile, budget_id).await?;
    if let Some(fund_id) = payload.fund_id {
        ensure_fund_in_budget(pool, fund_id, budget_id).await?;
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "incomes", path.income_id, &patch).await?;
    Ok(Json(updated))
}

async fn delete_income(
    State(state): State<AppState>,
    Path(path): Path<IncomePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let row = get_row(pool, "incomes", path.income_id).await?;
    require_budget_treasurer(pool, &profile, income_budget_id(&row, path.income_id)?).await?;

    let deleted = delete_row(pool, "incomes", path.income_id).await?;
    tracing::info!(income_id = path.income_id, actor = profile.user_id, "Deleted income");
    Ok(Json(deleted))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn date_range_becomes_bound_filters() {
        let query = IncomesQuery {
            budget_id: Some(3),
            fund_id: None,
            from_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            to_date: NaiveDate::from_ymd_opt(2026, 3, 31),
            limit: 50,
        };
        let filters = income_filters(&query);
        assert_eq!(filters.get("budget_id"), Some(&json!(3)));
        assert_eq!(filters.get("income_date__gte"), Some(&json!("2026-01-01")));
        assert_eq!(filters.get("income_date__lte"), Some(&json!("2026-03-31")));
        assert!(!filters.contains_key("fund_id"));
    }
}
