use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::{PgExecutor, Postgres, QueryBuilder};

use crate::{
    access::{can_view_budget_group, require_budget_type_access, visible_scopes},
    auth::require_access_profile,
    db::{begin_transaction, commit},
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, BudgetPath,
        BudgetsQuery, CreateBudgetInput, SetAllocationsInput, UpdateBudgetInput,
    },
    services::{
        allocations::{
            apply_allocations, check_within_budget, fund_allocations, lock_budget,
            plan_allocations, FundAllocation,
        },
        budget_scope::{resolve_budget_scope, BudgetScope},
    },
    state::AppState,
};

use super::{value_i64, value_str};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/budgets",
            axum::routing::get(list_budgets).post(create_budget),
        )
        .route(
            "/budgets/{budget_id}",
            axum::routing::get(get_budget)
                .patch(update_budget)
                .delete(delete_budget),
        )
        .route(
            "/budgets/{budget_id}/allocations",
            axum::routing::put(set_allocations),
        )
}

async fn list_budgets(
    State(state): State<AppState>,
    Query(query): Query<BudgetsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT (to_jsonb(b) || jsonb_build_object(
                   'allocated_total',
                   COALESCE((SELECT SUM(f.allocated_amount) FROM funds f WHERE f.budget_id = b.id), 0),
                   'fund_count',
                   (SELECT COUNT(*) FROM funds f WHERE f.budget_id = b.id)))::json AS row
         FROM budgets b
         WHERE TRUE",
    );
    if let Some(scopes) = visible_scopes(&profile) {
        scopes.push_group_clause(&mut builder, "b.group_id");
    }
    if let Some(group_id) = query.group_id {
        builder.push(" AND b.group_id = ").push_bind(group_id);
    }
    if let Some(fiscal_year) = query.fiscal_year {
        builder.push(" AND b.fiscal_year = ").push_bind(fiscal_year);
    }
    if let Some(is_active) = query.is_active {
        builder.push(" AND b.is_active = ").push_bind(is_active);
    }
    builder
        .push(" ORDER BY b.fiscal_year DESC, b.name LIMIT ")
        .push_bind(clamp_limit_in_range(query.limit, 1, 1000));

    let rows: Vec<Option<Value>> = builder.build_query_scalar().fetch_all(pool).await?;
    Ok(Json(json!({ "data": rows.into_iter().flatten().collect::<Vec<_>>() })))
}

async fn get_budget(
    State(state): State<AppState>,
    Path(path): Path<BudgetPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut budget = get_row(pool, "budgets", path.budget_id).await?;
    if !can_view_budget_group(&profile, value_i64(&budget, "group_id")) {
        return Err(AppError::Forbidden(
            "Forbidden: no access to this budget.".to_string(),
        ));
    }

    let mut filters = Map::new();
    filters.insert("budget_id".to_string(), json!(path.budget_id));
    let funds = list_rows(pool, "funds", Some(&filters), 500, 0, "name", true).await?;
    if let Some(obj) = budget.as_object_mut() {
        obj.insert("funds".to_string(), Value::Array(funds));
    }
    Ok(Json(budget))
}

/// Budget names are unique per scope and fiscal year.
async fn ensure_unique_name<'e, E>(
    executor: E,
    name: &str,
    fiscal_year: i32,
    group_id: Option<i64>,
    exclude_id: Option<i64>,
) -> AppResult<()>
where
    E: PgExecutor<'e>,
{
    let taken: bool = sqlx::query_scalar(
        "SELECT EXISTS (
           SELECT 1 FROM budgets
           WHERE lower(name) = lower($1)
             AND fiscal_year = $2
             AND group_id IS NOT DISTINCT FROM $3
             AND ($4::bigint IS NULL OR id <> $4)
         )",
    )
    .bind(name.trim())
    .bind(fiscal_year)
    .bind(group_id)
    .bind(exclude_id)
    .fetch_one(executor)
    .await?;

    if taken {
        return Err(AppError::Conflict(format!(
            "A budget named '{}' already exists for {fiscal_year} in this scope.",
            name.trim()
        )));
    }
    Ok(())
}

async fn create_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBudgetInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let scope = BudgetScope::from_budget_group(payload.group_id);
    require_budget_type_access(&profile, &scope)?;
    let pool = state.db_pool()?;

    ensure_unique_name(pool, &payload.name, payload.fiscal_year, payload.group_id, None).await?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("name".to_string(), json!(payload.name.trim()));
    record.insert("created_by".to_string(), json!(profile.user_id));
    let created = create_row(pool, "budgets", &record).await?;

    tracing::info!(
        budget_id = value_i64(&created, "id"),
        budget_type = scope.budget_type.as_str(),
        group_id = scope.group_id,
        total_amount = payload.total_amount,
        "Created budget"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_budget(
    State(state): State<AppState>,
    Path(path): Path<BudgetPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateBudgetInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let budget = lock_budget(&mut tx, path.budget_id).await?;
    require_budget_type_access(&profile, &budget.scope())?;

    if payload.name.is_some() || payload.fiscal_year.is_some() {
        let current = get_row(&mut *tx, "budgets", path.budget_id).await?;
        let name = payload
            .name
            .clone()
            .unwrap_or_else(|| value_str(&current, "name"));
        let fiscal_year = match payload.fiscal_year {
            Some(year) => year,
            None => value_i64(&current, "fiscal_year")
                .and_then(|year| i32::try_from(year).ok())
                .ok_or_else(|| AppError::Internal("Budget has no fiscal year.".to_string()))?,
        };
        ensure_unique_name(
            &mut *tx,
            &name,
            fiscal_year,
            budget.group_id,
            Some(path.budget_id),
        )
        .await?;
    }

    if let Some(total_amount) = payload.total_amount {
        let allocated = fund_allocations(&mut tx, path.budget_id)
            .await?
            .values()
            .sum::<f64>();
        check_within_budget(total_amount, allocated)?;
    }

    let mut patch = remove_nulls(serialize_to_map(&payload));
    if let Some(name) = payload.name.as_deref() {
        patch.insert("name".to_string(), json!(name.trim()));
    }
    patch.insert("updated_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    let updated = update_row(&mut *tx, "budgets", path.budget_id, &patch).await?;
    commit(tx).await?;

    tracing::info!(budget_id = path.budget_id, actor = profile.user_id, "Updated budget");
    Ok(Json(updated))
}

async fn delete_budget(
    State(state): State<AppState>,
    Path(path): Path<BudgetPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let scope = resolve_budget_scope(pool, path.budget_id).await?;
    require_budget_type_access(&profile, &scope)?;

    let mut filters = Map::new();
    filters.insert("budget_id".to_string(), json!(path.budget_id));
    let fund_count = count_rows(pool, "funds", Some(&filters)).await?;
    if fund_count > 0 {
        return Err(AppError::Conflict(format!(
            "Budget still has {fund_count} fund(s); delete them first."
        )));
    }

    let deleted = delete_row(pool, "budgets", path.budget_id).await?;
    tracing::info!(budget_id = path.budget_id, actor = profile.user_id, "Deleted budget");
    Ok(Json(deleted))
}

/// Replaces the allocated amounts of the listed funds in one transaction.
async fn set_allocations(
    State(state): State<AppState>,
    Path(path): Path<BudgetPath>,
    headers: HeaderMap,
    Json(payload): Json<SetAllocationsInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let requested = payload
        .allocations
        .iter()
        .map(|entry| FundAllocation {
            fund_id: entry.fund_id,
            allocated_amount: entry.allocated_amount,
        })
        .collect::<Vec<_>>();

    let mut tx = begin_transaction(pool).await?;
    let budget = lock_budget(&mut tx, path.budget_id).await?;
    require_budget_type_access(&profile, &budget.scope())?;
    let current = fund_allocations(&mut tx, path.budget_id).await?;
    let plan = plan_allocations(budget.total_amount, &current, &requested)?;
    apply_allocations(&mut tx, &plan).await?;
    commit(tx).await?;

    tracing::info!(
        budget_id = path.budget_id,
        funds = plan.changes.len(),
        allocated_total = plan.allocated_total,
        budget_total = plan.budget_total,
        "Updated fund allocations"
    );
    Ok(Json(json!(plan)))
}
