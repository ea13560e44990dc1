use serde_json::Value;
use sqlx::{Connection, PgConnection};

use crate::{
    access::{
        can_access_budget_type, require_budget_type_access, validate_reimbursement_ownership,
        AccessProfile,
    },
    error::{AppError, AppResult},
    services::{
        batch::BatchReport,
        budget_scope::resolve_fund_budget_scope,
        lifecycle::{
            check_transition, check_treasurer_edit, EditKind, ItemKind, ItemStatus, StatusAction,
        },
        payment_transfers::{
            associate_charge_with_transfer, associate_reimbursement_with_transfer, dissociate_item,
            lock_item, lock_item_with_slot, LinkableItem,
        },
    },
};

/// Applies a treasurer status action to one reimbursement or charge and keeps
/// its payment-transfer link in step: approval links it to the recipient's
/// open transfer, leaving `approved` unlinks it.
pub async fn apply_status_action(
    conn: &mut PgConnection,
    kind: ItemKind,
    item_id: i64,
    action: StatusAction,
    actor: &AccessProfile,
    review_notes: Option<&str>,
) -> AppResult<Value> {
    let (item, scope) = lock_item_with_slot(conn, kind, item_id).await?;
    require_budget_type_access(actor, &scope)?;

    let current = ItemStatus::parse(&item.status)?;
    let next = check_transition(kind, current, action)?;

    if current == ItemStatus::Approved {
        dissociate_item(conn, kind, item_id).await?;
    }

    let sql = format!(
        "UPDATE {} SET status = $1, reviewed_by = $2, reviewed_at = now(),
                review_notes = COALESCE($3, review_notes), updated_at = now()
         WHERE id = $4",
        kind.table()
    );
    sqlx::query(&sql)
        .bind(next.as_str())
        .bind(actor.user_id)
        .bind(review_notes)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;

    if next == ItemStatus::Approved {
        match kind {
            ItemKind::Reimbursement => associate_reimbursement_with_transfer(conn, item_id).await?,
            ItemKind::Charge => associate_charge_with_transfer(conn, item_id).await?,
        };
    }

    tracing::info!(
        item = kind.table(),
        item_id,
        from = current.as_str(),
        to = next.as_str(),
        actor = actor.user_id,
        "Changed item status"
    );

    let sql = format!("SELECT row_to_json(t) FROM {} t WHERE t.id = $1", kind.table());
    let row: Option<Value> = sqlx::query_scalar(&sql)
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or_else(|| AppError::NotFound(format!("{} {item_id} not found.", kind.label())))
}

/// Row-locks an item in the caller's transaction and checks the edit under
/// that lock, so a concurrent approval cannot slip in between. The submitter
/// of a reimbursement edits it while pending; treasurers of the scope follow
/// `check_treasurer_edit`.
pub async fn lock_editable_item(
    conn: &mut PgConnection,
    kind: ItemKind,
    profile: &AccessProfile,
    item_id: i64,
    edit: EditKind,
) -> AppResult<LinkableItem> {
    let item = lock_item(conn, kind, item_id).await?;
    let scope = resolve_fund_budget_scope(&mut *conn, item.fund_id).await?;
    let is_treasurer = can_access_budget_type(profile, &scope);

    if kind == ItemKind::Reimbursement && item.user_id == profile.user_id && !is_treasurer {
        validate_reimbursement_ownership(&mut *conn, profile, item_id).await?;
        return Ok(item);
    }
    if !is_treasurer {
        return Err(AppError::Forbidden(format!(
            "Forbidden: no access to this {}.",
            kind.label().to_ascii_lowercase()
        )));
    }
    check_treasurer_edit(kind, ItemStatus::parse(&item.status)?, edit)?;
    Ok(item)
}

/// Runs a status action over many items inside the caller's transaction.
/// Each item gets its own savepoint, so a rejected item leaves no trace
/// while the others proceed; infrastructure errors abort the batch.
pub async fn apply_status_action_batch(
    conn: &mut PgConnection,
    kind: ItemKind,
    ids: &[i64],
    action: StatusAction,
    actor: &AccessProfile,
) -> AppResult<BatchReport> {
    let mut report = BatchReport::default();

    for id in ids {
        let mut savepoint = conn.begin().await?;
        let outcome = apply_status_action(&mut savepoint, kind, *id, action, actor, None).await;
        match outcome {
            Ok(_) => savepoint.commit().await?,
            Err(_) => savepoint.rollback().await?,
        }
        report.record(*id, outcome.map(|_| ()))?;
    }

    tracing::info!(
        item = kind.table(),
        action = action.verb(),
        updated = report.updated,
        failed = report.errors.len(),
        "Processed batch status change"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::PgPool;

    use super::*;
    use crate::services::test_support::*;

    async fn act(
        pool: &PgPool,
        kind: ItemKind,
        id: i64,
        action: StatusAction,
    ) -> AppResult<Value> {
        let mut tx = pool.begin().await?;
        let row = apply_status_action(&mut tx, kind, id, action, &circle_treasurer(), None).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn try_edit(
        pool: &PgPool,
        profile: &AccessProfile,
        id: i64,
        edit: EditKind,
    ) -> AppResult<LinkableItem> {
        let mut tx = pool.begin().await?;
        lock_editable_item(&mut tx, ItemKind::Reimbursement, profile, id, edit).await
    }

    #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
    async fn batch_approval_skips_paid_items(pool: PgPool) {
        let first = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 10.0).await;
        let paid = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 20.0).await;
        let third = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 30.0).await;
        sqlx::query("UPDATE reimbursements SET status = 'paid' WHERE id = $1")
            .bind(paid)
            .execute(&pool)
            .await
            .expect("mark paid");

        let mut tx = pool.begin().await.expect("begin");
        let report = apply_status_action_batch(
            &mut tx,
            ItemKind::Reimbursement,
            &[first, paid, third],
            StatusAction::Approve,
            &circle_treasurer(),
        )
        .await
        .expect("batch");
        tx.commit().await.expect("commit");

        assert_eq!(report.updated, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].id, paid);
        assert!(report.errors[0].error.contains("already paid"));
        assert_eq!(item_status(&pool, "reimbursements", paid).await, ("paid".to_string(), None));

        let transfers = pending_transfer_ids(&pool, MEMBER).await;
        assert_eq!(transfers.len(), 1);
        let (stored, derived) = stored_and_derived(&pool, transfers[0]).await;
        assert_eq!(stored, (40.0, 2));
        assert_eq!(stored, derived);
    }

    #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
    async fn returning_to_pending_unlinks_and_recomputes(pool: PgPool) {
        let kept = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 20.0).await;
        let returned = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 15.0).await;
        for id in [kept, returned] {
            act(&pool, ItemKind::Reimbursement, id, StatusAction::Approve)
                .await
                .expect("approve");
        }
        let transfer_id = pending_transfer_ids(&pool, MEMBER).await[0];

        act(&pool, ItemKind::Reimbursement, returned, StatusAction::ReturnToPending)
            .await
            .expect("return to pending");

        assert_eq!(
            item_status(&pool, "reimbursements", returned).await,
            ("pending".to_string(), None)
        );
        let (stored, derived) = stored_and_derived(&pool, transfer_id).await;
        assert_eq!(stored, (20.0, 1));
        assert_eq!(stored, derived);
    }

    #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
    async fn approved_reimbursements_refuse_edits(pool: PgPool) {
        let id = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 42.0).await;

        try_edit(&pool, &member(), id, EditKind::Update)
            .await
            .expect("submitter edits while pending");
        assert!(matches!(
            try_edit(&pool, &group_treasurer(), id, EditKind::Update).await,
            Err(AppError::Forbidden(_))
        ));

        act(&pool, ItemKind::Reimbursement, id, StatusAction::Approve)
            .await
            .expect("approve");

        for profile in [member(), circle_treasurer()] {
            for edit in [EditKind::Update, EditKind::Delete] {
                assert!(matches!(
                    try_edit(&pool, &profile, id, edit).await,
                    Err(AppError::Conflict(_))
                ));
            }
        }
    }

    #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
    async fn approval_sees_an_edit_made_under_lock(pool: PgPool) {
        let id = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 40.0).await;

        let mut edit_tx = pool.begin().await.expect("begin");
        lock_editable_item(&mut edit_tx, ItemKind::Reimbursement, &member(), id, EditKind::Update)
            .await
            .expect("lock for edit");

        let approval = tokio::spawn({
            let pool = pool.clone();
            async move { act(&pool, ItemKind::Reimbursement, id, StatusAction::Approve).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        sqlx::query("UPDATE reimbursements SET amount = 65 WHERE id = $1")
            .bind(id)
            .execute(&mut *edit_tx)
            .await
            .expect("edit amount");
        edit_tx.commit().await.expect("commit edit");
        approval.await.expect("join").expect("approve");

        let (_, transfer_id) = item_status(&pool, "reimbursements", id).await;
        let (stored, derived) =
            stored_and_derived(&pool, transfer_id.expect("linked transfer")).await;
        assert_eq!(stored, (65.0, 1));
        assert_eq!(stored, derived);
    }
}
