use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::{
    access::{can_access_budget_type, can_access_fund, validate_fund_access},
    auth::require_access_profile,
    db::{begin_transaction, commit},
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, update_row},
    schemas::{
        remove_nulls, serialize_to_map, validate_input, BatchIdsInput, CreateReimbursementInput,
        ReimbursementPath, ReimbursementsQuery, UpdateReimbursementInput,
    },
    services::{
        budget_scope::resolve_fund_budget_scope,
        lifecycle::{EditKind, ItemKind, ItemStatus, StatusAction},
        review::lock_editable_item,
    },
    state::AppState,
};

use super::{
    items::{get_visible_item, list_items, run_batch_action, run_status_action, ItemFilters},
    value_i64,
};

const KIND: ItemKind = ItemKind::Reimbursement;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/reimbursements",
            axum::routing::get(list_reimbursements).post(create_reimbursement),
        )
        .route(
            "/reimbursements/batch-approve",
            axum::routing::post(batch_approve),
        )
        .route(
            "/reimbursements/batch-reject",
            axum::routing::post(batch_reject),
        )
        .route(
            "/reimbursements/batch-mark-for-review",
            axum::routing::post(batch_mark_for_review),
        )
        .route(
            "/reimbursements/{reimbursement_id}",
            axum::routing::get(get_reimbursement)
                .patch(update_reimbursement)
                .delete(delete_reimbursement),
        )
        .route(
            "/reimbursements/{reimbursement_id}/approve",
            axum::routing::post(approve_reimbursement),
        )
        .route(
            "/reimbursements/{reimbursement_id}/reject",
            axum::routing::post(reject_reimbursement),
        )
        .route(
            "/reimbursements/{reimbursement_id}/mark-for-review",
            axum::routing::post(mark_reimbursement_for_review),
        )
        .route(
            "/reimbursements/{reimbursement_id}/return-to-pending",
            axum::routing::post(return_reimbursement_to_pending),
        )
}

async fn list_reimbursements(
    State(state): State<AppState>,
    Query(query): Query<ReimbursementsQuery>,
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

async fn create_reimbursement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateReimbursementInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let fund = validate_fund_access(pool, &profile, payload.fund_id).await?;
    if !fund.budget_active {
        return Err(AppError::BadRequest(
            "The fund's budget is not active.".to_string(),
        ));
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("user_id".to_string(), json!(profile.user_id));
    record.insert("status".to_string(), json!(ItemStatus::Pending.as_str()));

    let created = create_row(pool, KIND.table(), &record).await?;
    tracing::info!(
        reimbursement_id = value_i64(&created, "id"),
        fund_id = payload.fund_id,
        user_id = profile.user_id,
        amount = payload.amount,
        "Submitted reimbursement"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_reimbursement(
    State(state): State<AppState>,
    Path(path): Path<ReimbursementPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let (row, _) = get_visible_item(pool, KIND, &profile, path.reimbursement_id).await?;
    Ok(Json(row))
}

/// Submitters may edit their own pending items; treasurers of the scope may
/// edit anything not yet approved or paid. Checked under the item's row lock.
async fn update_reimbursement(
    State(state): State<AppState>,
    Path(path): Path<ReimbursementPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateReimbursementInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let item =
        lock_editable_item(&mut tx, KIND, &profile, path.reimbursement_id, EditKind::Update).await?;

    if let Some(fund_id) = payload.fund_id.filter(|id| *id != item.fund_id) {
        if !can_access_fund(pool, &profile, fund_id).await? {
            return Err(AppError::Forbidden(
                "Forbidden: no access to the target fund.".to_string(),
            ));
        }
        let scope = resolve_fund_budget_scope(&mut *tx, fund_id).await?;
        let owner_edit = item.user_id == profile.user_id;
        if !owner_edit && !can_access_budget_type(&profile, &scope) {
            return Err(AppError::Forbidden(
                "Forbidden: no treasurer access to the target fund.".to_string(),
            ));
        }
    }

    let mut patch = remove_nulls(serialize_to_map(&payload));
    patch.insert("updated_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    let updated = update_row(&mut *tx, KIND.table(), path.reimbursement_id, &patch).await?;
    commit(tx).await?;
    Ok(Json(updated))
}

async fn delete_reimbursement(
    State(state): State<AppState>,
    Path(path): Path<ReimbursementPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    lock_editable_item(&mut tx, KIND, &profile, path.reimbursement_id, EditKind::Delete).await?;
    let deleted = delete_row(&mut *tx, KIND.table(), path.reimbursement_id).await?;
    commit(tx).await?;

    tracing::info!(
        reimbursement_id = path.reimbursement_id,
        actor = profile.user_id,
        "Deleted reimbursement"
    );
    Ok(Json(deleted))
}

async fn approve_reimbursement(
    State(state): State<AppState>,
    Path(path): Path<ReimbursementPath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    run_status_action(&state, &headers, KIND, path.reimbursement_id, StatusAction::Approve, &body)
        .await
}

async fn reject_reimbursement(
    State(state): State<AppState>,
    Path(path): Path<ReimbursementPath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    run_status_action(&state, &headers, KIND, path.reimbursement_id, StatusAction::Reject, &body)
        .await
}

async fn mark_reimbursement_for_review(
    State(state): State<AppState>,
    Path(path): Path<ReimbursementPath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    run_status_action(
        &state,
        &headers,
        KIND,
        path.reimbursement_id,
        StatusAction::MarkForReview,
        &body,
    )
    .await
}

async fn return_reimbursement_to_pending(
    State(state): State<AppState>,
    Path(path): Path<ReimbursementPath>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    run_status_action(
        &state,
        &headers,
        KIND,
        path.reimbursement_id,
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

async fn batch_mark_for_review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BatchIdsInput>,
) -> AppResult<Json<Value>> {
    run_batch_action(&state, &headers, KIND, &payload.ids, StatusAction::MarkForReview).await
}
