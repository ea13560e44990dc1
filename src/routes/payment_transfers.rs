use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    access::{can_access_budget_type, require_budget_type_access},
    auth::require_access_profile,
    db::{begin_transaction, commit},
    error::{AppError, AppResult},
    schemas::{requested_scope, PaymentTransferPath, PaymentTransfersQuery},
    services::{
        payment_transfers::{
            execute_payment_transfer, fetch_transfer, list_payment_transfers, lock_transfer,
            transfer_detail, update_transfer_totals, TransferFilters,
        },
        recurring::generate_recurring_transfers,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/payment-transfers",
            axum::routing::get(list_transfers),
        )
        .route(
            "/payment-transfers/generate-recurring",
            axum::routing::post(generate_recurring),
        )
        .route(
            "/payment-transfers/{transfer_id}",
            axum::routing::get(get_transfer),
        )
        .route(
            "/payment-transfers/{transfer_id}/execute",
            axum::routing::post(execute_transfer),
        )
        .route(
            "/payment-transfers/{transfer_id}/recompute",
            axum::routing::post(recompute_transfer),
        )
}

fn parse_status_filter(raw: Option<&str>) -> AppResult<Option<String>> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(status @ ("pending" | "executed")) => Ok(Some(status.to_string())),
        Some(other) => Err(AppError::BadRequest(format!(
            "Invalid status '{other}'. Expected pending or executed."
        ))),
    }
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<PaymentTransfersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let scopes =
        profile.requested_scopes(requested_scope(query.budget_type.as_deref(), query.group_id)?)?;
    let pool = state.db_pool()?;

    let filters = TransferFilters {
        status: parse_status_filter(query.status.as_deref())?,
        recipient_user_id: query.recipient_user_id,
        limit: query.limit,
    };
    let rows = list_payment_transfers(pool, &scopes, &filters).await?;
    Ok(Json(json!({ "data": rows })))
}

/// Visible to treasurers of the transfer's scope and to its recipient.
async fn get_transfer(
    State(state): State<AppState>,
    Path(path): Path<PaymentTransferPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let transfer = fetch_transfer(pool, path.transfer_id).await?;
    let is_recipient = transfer.recipient_user_id == profile.user_id;
    if !is_recipient && !can_access_budget_type(&profile, &transfer.scope()?) {
        return Err(AppError::Forbidden(
            "Forbidden: no access to this payment transfer.".to_string(),
        ));
    }

    Ok(Json(transfer_detail(pool, path.transfer_id).await?))
}

async fn generate_recurring(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;
    let today = state.config.today();

    let mut tx = begin_transaction(pool).await?;
    let report = generate_recurring_transfers(&mut tx, &profile, today).await?;
    commit(tx).await?;

    Ok(Json(json!(report)))
}

async fn execute_transfer(
    State(state): State<AppState>,
    Path(path): Path<PaymentTransferPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;
    let today = state.config.today();

    let mut tx = begin_transaction(pool).await?;
    let outcome = execute_payment_transfer(&mut tx, path.transfer_id, &profile, today).await?;
    commit(tx).await?;

    Ok(Json(json!(outcome)))
}

/// Rebuilds a pending transfer's totals from its linked rows.
async fn recompute_transfer(
    State(state): State<AppState>,
    Path(path): Path<PaymentTransferPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let transfer = lock_transfer(&mut tx, path.transfer_id).await?;
    require_budget_type_access(&profile, &transfer.scope()?)?;
    let totals = update_transfer_totals(&mut tx, path.transfer_id).await?;
    commit(tx).await?;

    tracing::info!(
        transfer_id = path.transfer_id,
        previous_total = transfer.total_amount,
        total_amount = totals.total_amount,
        item_count = totals.reimbursement_count,
        "Recomputed payment transfer on request"
    );
    Ok(Json(json!({
        "transfer_id": path.transfer_id,
        "total_amount": totals.total_amount,
        "reimbursement_count": totals.reimbursement_count,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_filter_accepts_known_statuses_only() {
        assert_eq!(parse_status_filter(None).ok(), Some(None));
        assert_eq!(parse_status_filter(Some("  ")).ok(), Some(None));
        assert_eq!(
            parse_status_filter(Some("executed")).ok(),
            Some(Some("executed".to_string()))
        );
        assert!(matches!(
            parse_status_filter(Some("paid")),
            Err(AppError::BadRequest(_))
        ));
    }
}
