use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::{
    access::{require_budget_type_access, validate_fund_access},
    auth::require_access_profile,
    db::{begin_transaction, commit},
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, update_row},
    schemas::{
        remove_nulls, serialize_to_map, validate_input, BatchIdsInput, ChargePath, ChargesQuery,
        CreateChargeInput, UpdateChargeInput,
    },
    services::{
        lifecycle::{EditKind, ItemKind, ItemStatus, StatusAction},
        review::{apply_status_action, lock_editable_item},
    },
    state::AppState,
};

use super::{
    items::{get_visible_item, list_items, run_batch_action, run_status_action, ItemFilters},
    value_i64,
};

const KIND: ItemKind = ItemKind::Charge;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/charges", axum::routing::get(list_charges).post(create_charge))
        .route("/charges/batch-approve", axum::routing::post(batch_approve))
        .route("/charges/batch-reject", axum::routing::post(batch_reject))
        .route(
            "/charges/{charge_id}",
            axum::routing::get(get_charge)
                .patch(update_charge)
                .delete(delete_charge),
        )
        .route(
            "/charges/{charge_id}/approve",
            axum::routing::post(approve_charge),
        )
        .route(
            "/charges/{charge_id}/reject",
            axum::routing::post(reject_charge),
        )
        .route(
            "/charges/{charge_id}/return-to-pending",
            axum::routing::post(return_charge_to_pending),
        )
}

async fn list_charges(
    State(state): State<AppState>,
    Query(query): Query<ChargesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let filters = ItemFilters {
        status: query.status,
        fund_id: query.fund_id,
        budget_id: query.budget_id,
        user_id: query.user_id,
        limit: query.limit,
    };
    let rows = list_items(pool, KIND, &profile, &filters).await?;
    Ok(Json(json!({ "data": rows })))
}

/// Charges are raised by a treasurer of the fund's scope against a member.
/// With `approve_immediately` the new charge is approved in the same
/// transaction and lands in the member's open payment transfer.
async fn create_charge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateChargeInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let fund = validate_fund_access(pool, &profile, payload.fund_id).await?;
    require_budget_type_access(&profile, &fund.scope())?;
    if !fund.budget_active {
        return Err(AppError::BadRequest(
            "The fund's budget is not active.".to_string(),
        ));
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("status".to_string(), json!(ItemStatus::Pending.as_str()));
    record.insert("created_by".to_string(), json!(profile.user_id));

    let mut tx = begin_transaction(pool).await?;
    let mut created = create_row(&mut *tx, KIND.table(), &record).await?;
    let charge_id = value_i64(&created, "id")
        .ok_or_else(|| AppError::Internal("Created charge has no id.".to_string()))?;
    if payload.approve_immediately {
        created = apply_status_action(&mut tx, KIND, charge_id, StatusAction::Approve, &profile, None)
            .await?;
    }
    commit(tx).await?;

    tracing::info!(
        charge_id,
        fund_id = payload.fund_id,
        user_id = payload.user_id,
        amount = payload.amount,
        approved = payload.approve_immediately,
        "Created charge"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_charge(
    State(state): State<AppState>,
    Path(path): Path<ChargePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let (row, _) = get_visible_item(pool, KIND, &profile, path.charge_id).await?;
    Ok(Json(row))
}

/// Only treasurers of the charge's scope edit charges, checked under the
/// charge's row lock.
async fn update_charge(
    State(state): State<AppState>,
    Path(path): Path<ChargePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateChargeInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    lock_editable_item(&mut tx, KIND, &profile, path.charge_id, EditKind::Update).await?;
    let mut patch = remove_nulls(serialize_to_map(&payload));
    patch.insert("updated_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    let updated = update_row(&mut *tx, KIND.table(), path.charge_id, &patch).await?;
    commit(tx).await?;
    Ok(Json(updated))
}

async fn delete_charge(
    State(state): State<AppState>,
    Path(path): Path<ChargePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    lock_editable_item(&mut tx, KIND, &profile, path.charge_id, EditKind::Delete).await?;
    let deleted = delete_row(&mut *tx, KIND.table(), path.charge_id).await?;
    commit(tx).await?;

    tracing::info!(charge_id = path.charge_id, actor = profile.user_id, "Deleted charge");
    Ok(Json(deleted))
}

async fn approve_charge(
    State(state): State<AppState>,
    Path(path): Path<ChargePath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    run_status_action(&state, &headers, KIND, path.charge_id, StatusAction::Approve, &body).await
}

async fn reject_charge(
    State(state): State<AppState>,
    Path(path): Path<ChargePath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    run_status_action(&state, &headers, KIND, path.charge_id, StatusAction::Reject, &body).await
}

async fn return_charge_to_pending(
    State(state): State<AppState>,
    Path(path): Path<ChargePath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    run_status_action(
        &state,
        &headers,
        KIND,
        path.charge_id,
        StatusAction::ReturnToPending,
        &body,
    )
    .await
}

async fn batch_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BatchIdsInput>,
) -> AppResult<Json<Value>> {
    run_batch_action(&state, &headers, KIND, &payload.ids, StatusAction::Approve).await
}

async fn batch_reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BatchIdsInput>,
) -> AppResult<Json<Value>> {
    run_batch_action(&state, &headers, KIND, &payload.ids, StatusAction::Reject).await
}
