//! Handlers shared by reimbursements and charges: listing, visibility and
//! status actions.

use axum::{body::Bytes, http::HeaderMap, Json};
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    access::{can_access_budget_type, load_access_profile, AccessProfile},
    auth::{require_access_profile, require_user_id},
    db::{begin_transaction, commit},
    error::{AppError, AppResult},
    repository::table_service::get_row,
    schemas::{clamp_limit_in_range, validate_input, ReviewInput},
    services::{
        batch::normalize_batch_ids,
        budget_scope::{resolve_fund_budget_scope, BudgetScope},
        lifecycle::{ItemKind, ItemStatus, StatusAction},
        review::{apply_status_action, apply_status_action_batch},
    },
    state::AppState,
};

use super::value_i64;

pub(super) struct ItemFilters {
    pub status: Option<String>,
    pub fund_id: Option<i64>,
    pub budget_id: Option<i64>,
    pub user_id: Option<i64>,
    pub limit: i64,
}

/// Treasurers see items in their treasury scopes; everyone sees their own.
pub(super) async fn list_items(
    pool: &PgPool,
    kind: ItemKind,
    profile: &AccessProfile,
    filters: &ItemFilters,
) -> AppResult<Vec<Value>> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT (to_jsonb(x) || jsonb_build_object(
                   'fund_name', f.name,
                   'budget_id', b.id,
                   'budget_name', b.name,
                   'group_id', b.group_id,
                   'user_name', u.full_name))::json AS row
         FROM ",
    );
    builder.push(kind.table()).push(
        " x
         JOIN funds f ON f.id = x.fund_id
         JOIN budgets b ON b.id = f.budget_id
         JOIN users u ON u.id = x.user_id
         WHERE (x.user_id = ",
    );
    builder.push_bind(profile.user_id);
    let scopes = profile.treasury_scopes();
    if !scopes.is_empty() {
        builder.push(" OR (TRUE");
        scopes.push_group_clause(&mut builder, "b.group_id");
        builder.push(")");
    }
    builder.push(")");

    if let Some(status) = filters.status.as_deref() {
        let status = ItemStatus::parse(status)?;
        builder.push(" AND x.status = ").push_bind(status.as_str());
    }
    if let Some(fund_id) = filters.fund_id {
        builder.push(" AND x.fund_id = ").push_bind(fund_id);
    }
    if let Some(budget_id) = filters.budget_id {
        builder.push(" AND b.id = ").push_bind(budget_id);
    }
    if let Some(user_id) = filters.user_id {
        builder.push(" AND x.user_id = ").push_bind(user_id);
    }
    builder
        .push(" ORDER BY x.created_at DESC, x.id DESC LIMIT ")
        .push_bind(clamp_limit_in_range(filters.limit, 1, 1000));

    let rows: Vec<Option<Value>> = builder.build_query_scalar().fetch_all(pool).await?;
    Ok(rows.into_iter().flatten().collect())
}

/// Loads an item the caller may see: its owner or a treasurer of its scope.
/// Returns the row and its budget scope.
pub(super) async fn get_visible_item(
    pool: &PgPool,
    kind: ItemKind,
    profile: &AccessProfile,
    item_id: i64,
) -> AppResult<(Value, BudgetScope)> {
    let row = get_row(pool, kind.table(), item_id).await?;
    let fund_id = value_i64(&row, "fund_id")
        .ok_or_else(|| AppError::Internal(format!("{} {item_id} has no fund.", kind.label())))?;
    let scope = resolve_fund_budget_scope(pool, fund_id).await?;

    let is_owner = value_i64(&row, "user_id") == Some(profile.user_id);
    if !is_owner && !can_access_budget_type(profile, &scope) {
        return Err(AppError::Forbidden(format!(
            "Forbidden: no access to this {}.",
            kind.label().to_ascii_lowercase()
        )));
    }
    Ok((row, scope))
}

fn parse_review_input(body: &Bytes) -> AppResult<ReviewInput> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ReviewInput::default());
    }
    let input: ReviewInput = serde_json::from_slice(body)
        .map_err(|error| AppError::BadRequest(format!("Invalid request body: {error}")))?;
    validate_input(&input)?;
    Ok(input)
}

/// Single status change in its own transaction. The body is optional and
/// may carry `review_notes`.
pub(super) async fn run_status_action(
    state: &AppState,
    headers: &HeaderMap,
    kind: ItemKind,
    item_id: i64,
    action: StatusAction,
    body: &Bytes,
) -> AppResult<Json<Value>> {
    let profile = require_access_profile(state, headers).await?;
    let input = parse_review_input(body)?;
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let updated = apply_status_action(
        &mut tx,
        kind,
        item_id,
        action,
        &profile,
        input.review_notes.as_deref(),
    )
    .await?;
    commit(tx).await?;

    Ok(Json(updated))
}

pub(super) async fn run_batch_action(
    state: &AppState,
    headers: &HeaderMap,
    kind: ItemKind,
    ids: &[i64],
    action: StatusAction,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(state, headers).await?;
    let ids = normalize_batch_ids(ids)?;
    let profile = load_access_profile(state, user_id).await?;
    if !profile.is_treasurer() {
        return Err(AppError::Forbidden(
            "Forbidden: treasurer role required.".to_string(),
        ));
    }
    let pool = state.db_pool()?;

    let mut tx = begin_transaction(pool).await?;
    let report = apply_status_action_batch(&mut tx, kind, &ids, action, &profile).await?;
    commit(tx).await?;

    Ok(Json(json!(report)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_means_no_notes() {
        let input = parse_review_input(&Bytes::from_static(b"  \n")).expect("empty body");
        assert_eq!(input.review_notes, None);
    }

    #[test]
    fn notes_are_read_from_json() {
        let input = parse_review_input(&Bytes::from_static(br#"{"review_notes":"Receipt ok"}"#))
            .expect("valid body");
        assert_eq!(input.review_notes.as_deref(), Some("Receipt ok"));
        assert!(matches!(
            parse_review_input(&Bytes::from_static(b"not json")),
            Err(AppError::BadRequest(_))
        ));
    }
}
