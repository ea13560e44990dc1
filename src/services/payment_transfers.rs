//! Payment-transfer reconciliation: one pending batch per recipient and
//! budget scope, fed by approved reimbursements (+), approved charges (-)
//! and recurring-transfer applications (+).
//!
//! Every function here takes `&mut PgConnection` and expects to run inside
//! the caller's transaction; the caller commits.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder, Row};

use crate::{
    access::{require_budget_type_access, AccessProfile},
    error::{round_cents, AppError, AppResult},
    services::{
        budget_scope::{resolve_fund_budget_scope, BudgetScope, ScopeSet},
        lifecycle::ItemKind,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Executed,
}

impl TransferStatus {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "pending" => Ok(Self::Pending),
            "executed" => Ok(Self::Executed),
            other => Err(AppError::Internal(format!(
                "Unexpected payment transfer status '{other}'."
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferTotals {
    pub total_amount: f64,
    pub reimbursement_count: i64,
}

/// Link between an item and the pending transfer it now belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferLink {
    pub transfer_id: i64,
    pub totals: TransferTotals,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TransferRow {
    pub id: i64,
    pub recipient_user_id: i64,
    pub budget_type: String,
    pub group_id: Option<i64>,
    pub status: String,
    pub total_amount: f64,
    pub reimbursement_count: i64,
}

impl TransferRow {
    pub fn scope(&self) -> AppResult<BudgetScope> {
        BudgetScope::from_parts(&self.budget_type, self.group_id)
    }
}

const TRANSFER_COLUMNS: &str = "id, recipient_user_id, budget_type, group_id, status,
       total_amount::float8 AS total_amount, reimbursement_count::bigint AS reimbursement_count";

/// Advisory-lock key serializing the read-check-create of an open transfer.
pub fn open_transfer_lock_key(recipient_user_id: i64, scope: &BudgetScope) -> String {
    format!("payment_transfer:{recipient_user_id}:{}", scope.label())
}

/// Takes the transaction-scoped advisory lock for (recipient, scope).
/// Paths that also row-lock a transfer take this lock first. Re-entrant
/// within one transaction.
pub async fn lock_open_transfer_slot(
    conn: &mut PgConnection,
    recipient_user_id: i64,
    scope: &BudgetScope,
) -> AppResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
        .bind(open_transfer_lock_key(recipient_user_id, scope))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Returns the pending transfer for (recipient, scope), creating a zeroed one
/// when none exists. The transaction-scoped advisory lock keeps concurrent
/// approvals for the same pair from creating duplicates.
pub async fn get_or_create_open_transfer(
    conn: &mut PgConnection,
    recipient_user_id: i64,
    scope: &BudgetScope,
) -> AppResult<i64> {
    lock_open_transfer_slot(conn, recipient_user_id, scope).await?;

    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM payment_transfers
         WHERE recipient_user_id = $1
           AND budget_type = $2
           AND group_id IS NOT DISTINCT FROM $3
           AND status = 'pending'
         ORDER BY id
         LIMIT 1",
    )
    .bind(recipient_user_id)
    .bind(scope.budget_type.as_str())
    .bind(scope.group_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(transfer_id) = existing {
        return Ok(transfer_id);
    }

    let transfer_id: i64 = sqlx::query_scalar(
        "INSERT INTO payment_transfers
           (recipient_user_id, budget_type, group_id, status, total_amount, reimbursement_count)
         VALUES ($1, $2, $3, 'pending', 0, 0)
         RETURNING id",
    )
    .bind(recipient_user_id)
    .bind(scope.budget_type.as_str())
    .bind(scope.group_id)
    .fetch_one(&mut *conn)
    .await?;

    tracing::info!(
        transfer_id,
        recipient_user_id,
        budget_type = scope.budget_type.as_str(),
        group_id = ?scope.group_id,
        "Opened payment transfer"
    );
    Ok(transfer_id)
}

/// Recomputes a pending transfer from its linked rows:
/// approved reimbursements minus approved charges plus applications.
pub async fn update_transfer_totals(
    conn: &mut PgConnection,
    transfer_id: i64,
) -> AppResult<TransferTotals> {
    let row = sqlx::query(
        "WITH totals AS (
           SELECT
             COALESCE((SELECT SUM(amount) FROM reimbursements
                       WHERE payment_transfer_id = $1 AND status = 'approved'), 0)
             - COALESCE((SELECT SUM(amount) FROM charges
                         WHERE payment_transfer_id = $1 AND status = 'approved'), 0)
             + COALESCE((SELECT SUM(applied_amount) FROM recurring_transfer_applications
                         WHERE payment_transfer_id = $1), 0) AS total_amount,
             (SELECT COUNT(*) FROM reimbursements
              WHERE payment_transfer_id = $1 AND status = 'approved')
             + (SELECT COUNT(*) FROM charges
                WHERE payment_transfer_id = $1 AND status = 'approved')
             + (SELECT COUNT(*) FROM recurring_transfer_applications
                WHERE payment_transfer_id = $1) AS item_count
         )
         UPDATE payment_transfers pt
         SET total_amount = totals.total_amount,
             reimbursement_count = totals.item_count,
             updated_at = now()
         FROM totals
         WHERE pt.id = $1 AND pt.status = 'pending'
         RETURNING pt.total_amount::float8 AS total_amount,
                   pt.reimbursement_count::bigint AS reimbursement_count",
    )
    .bind(transfer_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| {
        AppError::Conflict(format!(
            "Payment transfer {transfer_id} is not pending."
        ))
    })?;

    let totals = TransferTotals {
        total_amount: row.try_get("total_amount")?,
        reimbursement_count: row.try_get("reimbursement_count")?,
    };
    tracing::debug!(
        transfer_id,
        total_amount = totals.total_amount,
        item_count = totals.reimbursement_count,
        "Recomputed payment transfer totals"
    );
    Ok(totals)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LinkableItem {
    pub fund_id: i64,
    pub user_id: i64,
    pub status: String,
    pub payment_transfer_id: Option<i64>,
}

const ITEM_COLUMNS: &str = "fund_id, user_id, status, payment_transfer_id";

/// Loads and row-locks a reimbursement or charge.
pub async fn lock_item(
    conn: &mut PgConnection,
    kind: ItemKind,
    item_id: i64,
) -> AppResult<LinkableItem> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM {} WHERE id = $1 FOR UPDATE",
        kind.table()
    );
    sqlx::query_as::<_, LinkableItem>(&sql)
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} {item_id} not found.", kind.label())))
}

/// Takes the open-transfer slot of the item's recipient and scope, then
/// row-locks the item. Same lock order as execution: slot, then rows.
pub async fn lock_item_with_slot(
    conn: &mut PgConnection,
    kind: ItemKind,
    item_id: i64,
) -> AppResult<(LinkableItem, BudgetScope)> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM {} WHERE id = $1", kind.table());
    let seen = sqlx::query_as::<_, LinkableItem>(&sql)
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} {item_id} not found.", kind.label())))?;
    let scope = resolve_fund_budget_scope(&mut *conn, seen.fund_id).await?;
    lock_open_transfer_slot(conn, seen.user_id, &scope).await?;

    let item = lock_item(conn, kind, item_id).await?;
    if item.fund_id != seen.fund_id || item.user_id != seen.user_id {
        return Err(AppError::Conflict(format!(
            "{} changed while it was being processed; retry the request.",
            kind.label()
        )));
    }
    Ok((item, scope))
}

async fn associate_item(
    conn: &mut PgConnection,
    kind: ItemKind,
    item_id: i64,
) -> AppResult<TransferLink> {
    let (item, scope) = lock_item_with_slot(conn, kind, item_id).await?;
    let transfer_id = get_or_create_open_transfer(conn, item.user_id, &scope).await?;

    let sql = format!(
        "UPDATE {} SET payment_transfer_id = $1, updated_at = now() WHERE id = $2",
        kind.table()
    );
    sqlx::query(&sql)
        .bind(transfer_id)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;

    if let Some(previous) = item.payment_transfer_id.filter(|id| *id != transfer_id) {
        refresh_if_pending(conn, previous).await?;
    }

    let totals = update_transfer_totals(conn, transfer_id).await?;
    tracing::info!(
        item = kind.table(),
        item_id,
        transfer_id,
        total_amount = totals.total_amount,
        "Associated item with payment transfer"
    );
    Ok(TransferLink {
        transfer_id,
        totals,
    })
}

pub async fn associate_reimbursement_with_transfer(
    conn: &mut PgConnection,
    reimbursement_id: i64,
) -> AppResult<TransferLink> {
    associate_item(conn, ItemKind::Reimbursement, reimbursement_id).await
}

pub async fn associate_charge_with_transfer(
    conn: &mut PgConnection,
    charge_id: i64,
) -> AppResult<TransferLink> {
    associate_item(conn, ItemKind::Charge, charge_id).await
}

/// Clears an item's transfer link and recomputes the transfer it left.
/// Returns the former transfer id, if any.
pub async fn dissociate_item(
    conn: &mut PgConnection,
    kind: ItemKind,
    item_id: i64,
) -> AppResult<Option<i64>> {
    let item = lock_item(conn, kind, item_id).await?;
    let Some(transfer_id) = item.payment_transfer_id else {
        return Ok(None);
    };

    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM payment_transfers WHERE id = $1 FOR UPDATE")
            .bind(transfer_id)
            .fetch_optional(&mut *conn)
            .await?;
    if status.as_deref() == Some("executed") {
        return Err(AppError::Conflict(format!(
            "{} belongs to an executed payment transfer.",
            kind.label()
        )));
    }

    let sql = format!(
        "UPDATE {} SET payment_transfer_id = NULL, updated_at = now() WHERE id = $1",
        kind.table()
    );
    sqlx::query(&sql).bind(item_id).execute(&mut *conn).await?;

    if status.is_some() {
        update_transfer_totals(conn, transfer_id).await?;
    }
    tracing::info!(
        item = kind.table(),
        item_id,
        transfer_id,
        "Removed item from payment transfer"
    );
    Ok(Some(transfer_id))
}

async fn refresh_if_pending(conn: &mut PgConnection, transfer_id: i64) -> AppResult<()> {
    match update_transfer_totals(conn, transfer_id).await {
        Ok(_) | Err(AppError::Conflict(_)) => Ok(()),
        Err(error) => Err(error),
    }
}

pub async fn lock_transfer(conn: &mut PgConnection, transfer_id: i64) -> AppResult<TransferRow> {
    let sql = format!("SELECT {TRANSFER_COLUMNS} FROM payment_transfers WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, TransferRow>(&sql)
        .bind(transfer_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Payment transfer {transfer_id} not found.")))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionPlan {
    /// Pay out: the transfer becomes `executed`.
    Settle,
    /// Net debt: the transfer is removed and the debt becomes a charge.
    CarryForwardDebt { debt: f64 },
}

/// Decides what executing a transfer in this state means.
pub fn plan_execution(
    status: TransferStatus,
    total_amount: f64,
    reimbursement_count: i64,
) -> AppResult<ExecutionPlan> {
    if status == TransferStatus::Executed {
        return Err(AppError::Conflict(
            "Payment transfer is already executed.".to_string(),
        ));
    }

    let total = round_cents(total_amount);
    if reimbursement_count == 0 && total == 0.0 {
        return Err(AppError::BadRequest(
            "Payment transfer is empty.".to_string(),
        ));
    }

    if total < 0.0 {
        return Ok(ExecutionPlan::CarryForwardDebt { debt: total.abs() });
    }
    Ok(ExecutionPlan::Settle)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Executed {
        transfer_id: i64,
        total_amount: f64,
        paid_reimbursements: u64,
        paid_charges: u64,
    },
    DebtCarriedForward {
        deleted_transfer_id: i64,
        debt_amount: f64,
        charge_id: i64,
        next_transfer_id: i64,
        paid_reimbursements: u64,
        paid_charges: u64,
    },
}

/// Executes a pending transfer under a row lock. Either the transfer becomes
/// `executed` and its approved items `paid`, or (net negative) its items are
/// paid, the transfer is deleted and the debt is charged to the recipient's
/// next open transfer.
pub async fn execute_payment_transfer(
    conn: &mut PgConnection,
    transfer_id: i64,
    actor: &AccessProfile,
    today: NaiveDate,
) -> AppResult<ExecutionOutcome> {
    // Recipient and scope of a transfer never change.
    let unlocked = fetch_transfer(&mut *conn, transfer_id).await?;
    lock_open_transfer_slot(conn, unlocked.recipient_user_id, &unlocked.scope()?).await?;
    let transfer = lock_transfer(conn, transfer_id).await?;
    let plan = plan_execution(
        TransferStatus::parse(&transfer.status)?,
        transfer.total_amount,
        transfer.reimbursement_count,
    )?;
    let scope = transfer.scope()?;
    require_budget_type_access(actor, &scope)?;

    match plan {
        ExecutionPlan::Settle => {
            sqlx::query(
                "UPDATE payment_transfers
                 SET status = 'executed', executed_at = now(), executed_by = $2, updated_at = now()
                 WHERE id = $1",
            )
            .bind(transfer_id)
            .bind(actor.user_id)
            .execute(&mut *conn)
            .await?;
            let (paid_reimbursements, paid_charges) = mark_linked_items_paid(conn, transfer_id).await?;

            tracing::info!(
                transfer_id,
                recipient_user_id = transfer.recipient_user_id,
                total_amount = transfer.total_amount,
                executed_by = actor.user_id,
                "Executed payment transfer"
            );
            Ok(ExecutionOutcome::Executed {
                transfer_id,
                total_amount: round_cents(transfer.total_amount),
                paid_reimbursements,
                paid_charges,
            })
        }
        ExecutionPlan::CarryForwardDebt { debt } => {
            let fund_id = carry_forward_fund(conn, transfer_id).await?;
            let (paid_reimbursements, paid_charges) = mark_linked_items_paid(conn, transfer_id).await?;

            for table in ["reimbursements", "charges", "recurring_transfer_applications"] {
                let sql = format!(
                    "UPDATE {table} SET payment_transfer_id = NULL WHERE payment_transfer_id = $1"
                );
                sqlx::query(&sql).bind(transfer_id).execute(&mut *conn).await?;
            }
            sqlx::query("DELETE FROM payment_transfers WHERE id = $1")
                .bind(transfer_id)
                .execute(&mut *conn)
                .await?;

            let charge_id: i64 = sqlx::query_scalar(
                "INSERT INTO charges
                   (fund_id, user_id, amount, description, charge_date, status,
                    created_by, reviewed_by, reviewed_at, carried_forward_from)
                 VALUES ($1, $2, $3, $4, $5, 'approved', $6, $6, now(), $7)
                 RETURNING id",
            )
            .bind(fund_id)
            .bind(transfer.recipient_user_id)
            .bind(debt)
            .bind(format!(
                "Debt carried forward from payment transfer #{transfer_id}, offset in the next cycle"
            ))
            .bind(today)
            .bind(actor.user_id)
            .bind(transfer_id)
            .fetch_one(&mut *conn)
            .await?;

            let link = associate_charge_with_transfer(conn, charge_id).await?;

            tracing::info!(
                transfer_id,
                recipient_user_id = transfer.recipient_user_id,
                debt,
                charge_id,
                next_transfer_id = link.transfer_id,
                "Carried negative payment transfer forward as a charge"
            );
            Ok(ExecutionOutcome::DebtCarriedForward {
                deleted_transfer_id: transfer_id,
                debt_amount: debt,
                charge_id,
                next_transfer_id: link.transfer_id,
                paid_reimbursements,
                paid_charges,
            })
        }
    }
}

async fn mark_linked_items_paid(conn: &mut PgConnection, transfer_id: i64) -> AppResult<(u64, u64)> {
    let mut counts = [0_u64; 2];
    for (slot, table) in ["reimbursements", "charges"].into_iter().enumerate() {
        let sql = format!(
            "UPDATE {table}
             SET status = 'paid', paid_at = now(), updated_at = now()
             WHERE payment_transfer_id = $1 AND status = 'approved'"
        );
        counts[slot] = sqlx::query(&sql)
            .bind(transfer_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok((counts[0], counts[1]))
}

/// Fund the carried debt is booked against: a linked charge's fund first,
/// then a reimbursement's, then a recurring transfer's.
async fn carry_forward_fund(conn: &mut PgConnection, transfer_id: i64) -> AppResult<i64> {
    let fund_id: Option<i64> = sqlx::query_scalar(
        "SELECT fund_id FROM (
           SELECT fund_id, 0 AS priority, id FROM charges
           WHERE payment_transfer_id = $1 AND status = 'approved'
           UNION ALL
           SELECT fund_id, 1 AS priority, id FROM reimbursements
           WHERE payment_transfer_id = $1 AND status = 'approved'
           UNION ALL
           SELECT rt.fund_id, 2 AS priority, a.id
           FROM recurring_transfer_applications a
           JOIN recurring_transfers rt ON rt.id = a.recurring_transfer_id
           WHERE a.payment_transfer_id = $1
         ) linked
         ORDER BY priority, id DESC
         LIMIT 1",
    )
    .bind(transfer_id)
    .fetch_optional(&mut *conn)
    .await?;

    fund_id.ok_or_else(|| {
        AppError::Conflict(format!(
            "Payment transfer {transfer_id} has no linked items; recompute it before executing."
        ))
    })
}

#[derive(Debug, Clone, Default)]
pub struct TransferFilters {
    pub status: Option<String>,
    pub recipient_user_id: Option<i64>,
    pub limit: i64,
}

pub async fn list_payment_transfers(
    pool: &PgPool,
    scopes: &ScopeSet,
    filters: &TransferFilters,
) -> AppResult<Vec<Value>> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT (to_jsonb(t) || jsonb_build_object(
                   'recipient_name', u.full_name,
                   'recipient_email', u.email))::json AS row
         FROM payment_transfers t
         JOIN users u ON u.id = t.recipient_user_id
         WHERE 1=1",
    );
    scopes.push_group_clause(&mut builder, "t.group_id");
    if let Some(status) = filters.status.as_deref() {
        builder.push(" AND t.status = ").push_bind(status.to_string());
    }
    if let Some(recipient) = filters.recipient_user_id {
        builder.push(" AND t.recipient_user_id = ").push_bind(recipient);
    }
    builder
        .push(" ORDER BY t.status, t.created_at DESC LIMIT ")
        .push_bind(filters.limit.clamp(1, 1000));

    let rows = builder.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect())
}

pub async fn fetch_transfer<'e, E>(executor: E, transfer_id: i64) -> AppResult<TransferRow>
where
    E: PgExecutor<'e>,
{
    let sql = format!("SELECT {TRANSFER_COLUMNS} FROM payment_transfers WHERE id = $1");
    sqlx::query_as::<_, TransferRow>(&sql)
        .bind(transfer_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Payment transfer {transfer_id} not found.")))
}

/// Transfer row plus its linked reimbursements, charges and applications.
pub async fn transfer_detail(pool: &PgPool, transfer_id: i64) -> AppResult<Value> {
    let row = sqlx::query(
        "SELECT json_build_object(
           'transfer', (SELECT row_to_json(t) FROM payment_transfers t WHERE t.id = $1),
           'reimbursements', COALESCE((
             SELECT json_agg(r ORDER BY r.id) FROM reimbursements r
             WHERE r.payment_transfer_id = $1), '[]'::json),
           'charges', COALESCE((
             SELECT json_agg(c ORDER BY c.id) FROM charges c
             WHERE c.payment_transfer_id = $1), '[]'::json),
           'recurring_applications', COALESCE((
             SELECT json_agg(json_build_object(
                      'id', a.id,
                      'recurring_transfer_id', a.recurring_transfer_id,
                      'period_year', a.period_year,
                      'period_month', a.period_month,
                      'applied_amount', a.applied_amount,
                      'description', rt.description) ORDER BY a.id)
             FROM recurring_transfer_applications a
             JOIN recurring_transfers rt ON rt.id = a.recurring_transfer_id
             WHERE a.payment_transfer_id = $1), '[]'::json)
         ) AS detail",
    )
    .bind(transfer_id)
    .fetch_one(pool)
    .await?;

    Ok(row.try_get::<Value, _>("detail")?)
}
