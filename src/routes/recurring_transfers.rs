use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use sqlx::{PgConnection, Postgres, QueryBuilder};

use crate::{
    access::{
        can_access_budget_type, require_budget_type_access, validate_fund_access, AccessProfile,
    },
    auth::require_access_profile,
    db::{begin_transaction, commit},
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        CreateRecurringTransferInput, RecurringStatusInput, RecurringTransferPath,
        RecurringTransfersQuery, UpdateRecurringTransferInput,
    },
    services::{
        budget_scope::resolve_fund_budget_scope,
        recurring::{remove_pending_applications, Frequency, RecurringStatus},
    },
    state::AppState,
};

use super::{value_i64, value_str};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/recurring-transfers",
            axum::routing::get(list_recurring_transfers).post(create_recurring_transfer),
        )
        .route(
            "/recurring-transfers/{recurring_transfer_id}",
            axum::routing::get(get_recurring_transfer)
                .patch(update_recurring_transfer)
                .delete(delete_recurring_transfer),
        )
        .route(
            "/recurring-transfers/{recurring_transfer_id}/status",
            axum::routing::post(change_recurring_status),
        )
}

async fn list_recurring_transfers(
    State(state): State<AppState>,
    Query(query): Query<RecurringTransfersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT (to_jsonb(rt) || jsonb_build_object(
                   'fund_name', f.name,
                   'budget_id', b.id,
                   'group_id', b.group_id,
                   'recipient_name', u.full_name))::json AS row
         FROM recurring_transfers rt
         JOIN funds f ON f.id = rt.fund_id
         JOIN budgets b ON b.id = f.budget_id
         JOIN users u ON u.id = rt.recipient_user_id
         WHERE (rt.recipient_user_id = ",
    );
    builder.push_bind(profile.user_id);
    let scopes = profile.treasury_scopes();
    if !scopes.is_empty() {
        builder.push(" OR (TRUE");
        scopes.push_group_clause(&mut builder, "b.group_id");
        builder.push(")");
    }
    builder.push(")");

    if let Some(status) = query.status.as_deref() {
        let status = RecurringStatus::parse(status)?;
        builder.push(" AND rt.status = ").push_bind(status.as_str());
    }
    if let Some(fund_id) = query.fund_id {
        builder.push(" AND rt.fund_id = ").push_bind(fund_id);
    }
    if let Some(recipient_user_id) = query.recipient_user_id {
        builder
            .push(" AND rt.recipient_user_id = ")
            .push_bind(recipient_user_id);
    }
    builder
        .push(" ORDER BY rt.status, rt.start_date DESC, rt.id DESC LIMIT ")
        .push_bind(clamp_limit_in_range(query.limit, 1, 1000));

    let rows: Vec<Option<Value>> = builder.build_query_scalar().fetch_all(pool).await?;
    Ok(Json(json!({ "data": rows.into_iter().flatten().collect::<Vec<_>>() })))
}

async fn get_recurring_transfer(
    State(state): State<AppState>,
    Path(path): Path<RecurringTransferPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let row = get_row(pool, "recurring_transfers", path.recurring_transfer_id).await?;
    let fund_id = value_i64(&row, "fund_id").ok_or_else(|| {
        AppError::Internal(format!(
            "Recurring transfer {} has no fund.",
            path.recurring_transfer_id
        ))
    })?;
    let scope = resolve_fund_budget_scope(pool, fund_id).await?;
    let is_recipient = value_i64(&row, "recipient_user_id") == Some(profile.user_id);
    if !is_recipient && !can_access_budget_type(&profile, &scope) {
        return Err(AppError::Forbidden(
            "Forbidden: no access to this recurring transfer.".to_string(),
        ));
    }
    Ok(Json(row))
}

async fn create_recurring_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateRecurringTransferInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let fund = validate_fund_access(pool, &profile, payload.fund_id).await?;
    require_budget_type_access(&profile, &fund.scope())?;
    let frequency = Frequency::parse(&payload.frequency)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("frequency".to_string(), json!(frequency));
    record.insert(
        "status".to_string(),
        json!(RecurringStatus::Active.as_str()),
    );
    record.insert("created_by".to_string(), json!(profile.user_id));
    let created = create_row(pool, "recurring_transfers", &record).await?;

    tracing::info!(
        recurring_transfer_id = value_i64(&created, "id"),
        fund_id = payload.fund_id,
        recipient_user_id = payload.recipient_user_id,
        amount = payload.amount,
        frequency = ?frequency,
        "Created recurring transfer"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, sqlx::FromRow)]
struct LockedRecurring {
    fund_id: i64,
    status: String,
    start_date: NaiveDate,
}

/// Row-locks a recurring transfer and checks the caller treasures its scope.
async fn lock_recurring(
    conn: &mut PgConnection,
    profile: &AccessProfile,
    recurring_transfer_id: i64,
) -> AppResult<(LockedRecurring, RecurringStatus)> {
    let locked = sqlx::query_as::<_, LockedRecurring>(
        "SELECT fund_id, status, start_date FROM recurring_transfers WHERE id = $1 FOR UPDATE",
    )
    .bind(recurring_transfer_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| {
        AppError::NotFound(format!(
            "Recurring transfer {recurring_transfer_id} not found."
        ))
    })?;

    let scope = resolve_fund_budget_scope(&mut *conn, locked.fund_id).await?;
    require_budget_type_access(profile, &scope)?;
    let status = RecurringStatus::parse(&locked.status)?;
    Ok((locked, status))
}

async fn update_recurring_transfer(
    State(state): State<AppState>,
    Path(path): Path<RecurringTransferPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateRecurringTransferInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let (locked, status) = lock_recurring(&mut tx, &profile, path.recurring_transfer_id).await?;
    if status == RecurringStatus::Cancelled {
        return Err(AppError::Conflict(
            "Cancelled recurring transfers cannot be edited.".to_string(),
        ));
    }
    if payload.end_date.is_some_and(|end| end < locked.start_date) {
        return Err(AppError::BadRequest(
            "end_date must not be before start_date.".to_string(),
        ));
    }

    let mut patch = remove_nulls(serialize_to_map(&payload));
    patch.insert("updated_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    let updated = update_row(
        &mut *tx,
        "recurring_transfers",
        path.recurring_transfer_id,
        &patch,
    )
    .await?;
    commit(tx).await?;

    Ok(Json(updated))
}

/// Moves between active, paused and cancelled. Cancelling pulls the
/// transfer's applications out of pending payment transfers.
async fn change_recurring_status(
    State(state): State<AppState>,
    Path(path): Path<RecurringTransferPath>,
    headers: HeaderMap,
    Json(payload): Json<RecurringStatusInput>,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let next = RecurringStatus::parse(&payload.status)?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let (_, current) = lock_recurring(&mut tx, &profile, path.recurring_transfer_id).await?;
    current.check_change(next)?;

    let mut patch = serde_json::Map::new();
    patch.insert("status".to_string(), json!(next.as_str()));
    patch.insert("updated_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    let mut updated = update_row(
        &mut *tx,
        "recurring_transfers",
        path.recurring_transfer_id,
        &patch,
    )
    .await?;

    let removed = if next == RecurringStatus::Cancelled {
        remove_pending_applications(&mut tx, path.recurring_transfer_id).await?
    } else {
        0
    };
    commit(tx).await?;

    tracing::info!(
        recurring_transfer_id = path.recurring_transfer_id,
        from = current.as_str(),
        to = next.as_str(),
        removed_applications = removed,
        actor = profile.user_id,
        "Changed recurring transfer status"
    );
    if let Some(obj) = updated.as_object_mut() {
        obj.insert("removed_applications".to_string(), json!(removed));
    }
    Ok(Json(updated))
}

/// Deletes a recurring transfer whose applications are all still pending.
/// Settled history must stay, so those are cancelled instead.
async fn delete_recurring_transfer(
    State(state): State<AppState>,
    Path(path): Path<RecurringTransferPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    lock_recurring(&mut tx, &profile, path.recurring_transfer_id).await?;
    let removed = remove_pending_applications(&mut tx, path.recurring_transfer_id).await?;

    let settled: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM recurring_transfer_applications WHERE recurring_transfer_id = $1",
    )
    .bind(path.recurring_transfer_id)
    .fetch_one(&mut *tx)
    .await?;
    if settled > 0 {
        return Err(AppError::Conflict(format!(
            "Recurring transfer has {settled} settled application(s); cancel it instead."
        )));
    }

    let deleted = delete_row(&mut *tx, "recurring_transfers", path.recurring_transfer_id).await?;
    commit(tx).await?;

    tracing::info!(
        recurring_transfer_id = path.recurring_transfer_id,
        removed_applications = removed,
        status = %value_str(&deleted, "status"),
        actor = profile.user_id,
        "Deleted recurring transfer"
    );
    Ok(Json(deleted))
}
