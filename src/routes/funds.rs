use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    access::{require_budget_type_access, validate_fund_access, visible_scopes},
    auth::require_access_profile,
    db::{begin_transaction, commit},
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateFundInput,
        FundPath, FundsQuery, UpdateFundInput,
    },
    services::{
        allocations::{
            apply_allocations, check_within_budget, fund_allocations, lock_budget,
            plan_allocations, FundAllocation,
        },
        budget_scope::ScopeSet,
    },
    state::AppState,
};

use super::value_i64;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/funds", axum::routing::get(list_funds).post(create_fund))
        .route(
            "/funds/{fund_id}",
            axum::routing::get(get_fund)
                .patch(update_fund)
                .delete(delete_fund),
        )
}

/// Fund rows with their budget context and what has been spent from them
/// (approved and paid reimbursements).
fn fund_rows_query(scopes: Option<&ScopeSet>) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT (to_jsonb(f) || jsonb_build_object(
                   'budget_name', b.name,
                   'group_id', b.group_id,
                   'fiscal_year', b.fiscal_year,
                   'spent', COALESCE((
                     SELECT SUM(r.amount) FROM reimbursements r
                     WHERE r.fund_id = f.id AND r.status IN ('approved', 'paid')), 0)))::json AS row
         FROM funds f
         JOIN budgets b ON b.id = f.budget_id
         WHERE TRUE",
    );
    if let Some(scopes) = scopes {
        scopes.push_group_clause(&mut builder, "b.group_id");
    }
    builder
}

async fn list_funds(
    State(state): State<AppState>,
    Query(query): Query<FundsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let scopes = visible_scopes(&profile);
    let mut builder = fund_rows_query(scopes.as_ref());
    if let Some(budget_id) = query.budget_id {
        builder.push(" AND f.budget_id = ").push_bind(budget_id);
    }
    builder
        .push(" ORDER BY b.fiscal_year DESC, b.id, f.name LIMIT ")
        .push_bind(clamp_limit_in_range(query.limit, 1, 1000));

    let rows: Vec<Option<Value>> = builder.build_query_scalar().fetch_all(pool).await?;
    Ok(Json(json!({ "data": rows.into_iter().flatten().collect::<Vec<_>>() })))
}

async fn fetch_fund_row(pool: &PgPool, fund_id: i64) -> AppResult<Value> {
    let mut builder = fund_rows_query(None);
    builder.push(" AND f.id = ").push_bind(fund_id);
    let row: Option<Option<Value>> = builder.build_query_scalar().fetch_optional(pool).await?;
    row.flatten()
        .ok_or_else(|| AppError::NotFound(format!("Fund {fund_id} not found.")))
}

async fn get_fund(
    State(state): State<AppState>,
    Path(path): Path<FundPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    validate_fund_access(pool, &profile, path.fund_id).await?;
    Ok(Json(fetch_fund_row(pool, path.fund_id).await?))
}

async fn create_fund(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateFundInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let budget = lock_budget(&mut tx, payload.budget_id).await?;
    require_budget_type_access(&profile, &budget.scope())?;

    let allocated = fund_allocations(&mut tx, payload.budget_id)
        .await?
        .values()
        .sum::<f64>();
    check_within_budget(budget.total_amount, allocated + payload.allocated_amount)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("name".to_string(), json!(payload.name.trim()));
    let created = create_row(&mut *tx, "funds", &record).await?;
    commit(tx).await?;

    tracing::info!(
        fund_id = value_i64(&created, "id"),
        budget_id = payload.budget_id,
        allocated_amount = payload.allocated_amount,
        "Created fund"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_fund(
    State(state): State<AppState>,
    Path(path): Path<FundPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateFundInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let fund = validate_fund_access(pool, &profile, path.fund_id).await?;
    require_budget_type_access(&profile, &fund.scope())?;

    let mut tx = begin_transaction(pool).await?;
    if let Some(allocated_amount) = payload.allocated_amount {
        let budget = lock_budget(&mut tx, fund.budget_id).await?;
        let current = fund_allocations(&mut tx, fund.budget_id).await?;
        let plan = plan_allocations(
            budget.total_amount,
            &current,
            &[FundAllocation {
                fund_id: path.fund_id,
                allocated_amount,
            }],
        )?;
        apply_allocations(&mut tx, &plan).await?;
    }

    let mut patch = remove_nulls(serialize_to_map(&payload));
    patch.remove("allocated_amount");
    if let Some(name) = payload.name.as_deref() {
        patch.insert("name".to_string(), json!(name.trim()));
    }
    patch.insert("updated_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    update_row(&mut *tx, "funds", path.fund_id, &patch).await?;
    commit(tx).await?;

    tracing::info!(fund_id = path.fund_id, actor = profile.user_id, "Updated fund");
    Ok(Json(fetch_fund_row(pool, path.fund_id).await?))
}

async fn delete_fund(
    State(state): State<AppState>,
    Path(path): Path<FundPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let fund = validate_fund_access(pool, &profile, path.fund_id).await?;
    require_budget_type_access(&profile, &fund.scope())?;

    let (reimbursements, charges, recurring, incomes): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT
           (SELECT COUNT(*) FROM reimbursements WHERE fund_id = $1),
           (SELECT COUNT(*) FROM charges WHERE fund_id = $1),
           (SELECT COUNT(*) FROM recurring_transfers WHERE fund_id = $1),
           (SELECT COUNT(*) FROM incomes WHERE fund_id = $1)",
    )
    .bind(path.fund_id)
    .fetch_one(pool)
    .await?;
    if reimbursements + charges + recurring + incomes > 0 {
        return Err(AppError::Conflict(format!(
            "Fund is still referenced by {reimbursements} reimbursement(s), {charges} charge(s), \
             {recurring} recurring transfer(s) and {incomes} income(s)."
        )));
    }

    let deleted = delete_row(pool, "funds", path.fund_id).await?;
    tracing::info!(fund_id = path.fund_id, actor = profile.user_id, "Deleted fund");
    Ok(Json(deleted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fund_query_is_restricted_to_visible_scopes() {
        let scopes = ScopeSet {
            circle: true,
            group_ids: vec![4],
        };
        let builder = fund_rows_query(Some(&scopes));
        assert!(builder.sql().contains("b.group_id"));

        let unrestricted = fund_rows_query(None);
        assert!(unrestricted.sql().trim_end().ends_with("WHERE TRUE"));
    }
}
