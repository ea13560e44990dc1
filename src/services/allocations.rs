use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::PgConnection;

use crate::{
    error::{allocation_exceeds_budget, round_cents, AppError, AppResult},
    services::budget_scope::BudgetScope,
};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockedBudget {
    pub group_id: Option<i64>,
    pub total_amount: f64,
}

impl LockedBudget {
    pub fn scope(&self) -> BudgetScope {
        BudgetScope::from_budget_group(self.group_id)
    }
}

/// Row-locks a budget so concurrent allocation changes serialize.
pub async fn lock_budget(conn: &mut PgConnection, budget_id: i64) -> AppResult<LockedBudget> {
    sqlx::query_as::<_, LockedBudget>(
        "SELECT group_id, total_amount::float8 AS total_amount
         FROM budgets WHERE id = $1 FOR UPDATE",
    )
    .bind(budget_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Budget {budget_id} not found.")))
}

/// Current allocation of every fund of a budget, locked.
pub async fn fund_allocations(
    conn: &mut PgConnection,
    budget_id: i64,
) -> AppResult<BTreeMap<i64, f64>> {
    let rows: Vec<(i64, f64)> = sqlx::query_as(
        "SELECT id, allocated_amount::float8 FROM funds WHERE budget_id = $1 ORDER BY id FOR UPDATE",
    )
    .bind(budget_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().collect())
}

pub fn check_within_budget(budget_total: f64, requested_total: f64) -> AppResult<()> {
    if round_cents(requested_total) > round_cents(budget_total) {
        return Err(allocation_exceeds_budget(
            round_cents(budget_total),
            round_cents(requested_total),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationPlan {
    pub budget_total: f64,
    pub allocated_total: f64,
    pub changes: Vec<FundAllocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FundAllocation {
    pub fund_id: i64,
    pub allocated_amount: f64,
}

/// Overlays the requested amounts on the current allocations and checks the
/// resulting sum against the budget total. Every requested fund must belong
/// to the budget and appear once.
pub fn plan_allocations(
    budget_total: f64,
    current: &BTreeMap<i64, f64>,
    requested: &[FundAllocation],
) -> AppResult<AllocationPlan> {
    let mut next = current.clone();
    let mut changes = Vec::with_capacity(requested.len());
    for entry in requested {
        if changes
            .iter()
            .any(|change: &FundAllocation| change.fund_id == entry.fund_id)
        {
            return Err(AppError::BadRequest(format!(
                "Fund {} is listed more than once.",
                entry.fund_id
            )));
        }
        let Some(slot) = next.get_mut(&entry.fund_id) else {
            return Err(AppError::BadRequest(format!(
                "Fund {} does not belong to this budget.",
                entry.fund_id
            )));
        };
        *slot = round_cents(entry.allocated_amount);
        changes.push(FundAllocation {
            fund_id: entry.fund_id,
            allocated_amount: round_cents(entry.allocated_amount),
        });
    }

    let allocated_total = round_cents(next.values().sum());
    check_within_budget(budget_total, allocated_total)?;
    Ok(AllocationPlan {
        budget_total: round_cents(budget_total),
        allocated_total,
        changes,
    })
}

pub async fn apply_allocations(conn: &mut PgConnection, plan: &AllocationPlan) -> AppResult<()> {
    for change in &plan.changes {
        sqlx::query("UPDATE funds SET allocated_amount = $1, updated_at = now() WHERE id = $2")
            .bind(change.allocated_amount)
            .bind(change.fund_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
