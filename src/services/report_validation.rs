use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    error::{round_cents, AppResult},
    services::{
        budget_scope::ScopeSet,
        reports::{monthly_series, monthly_totals, FlowTotals},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationCheck {
    pub name: String,
    pub entity_type: &'static str,
    pub entity_id: Option<i64>,
    pub expected: f64,
    pub actual: f64,
    pub difference: f64,
    pub severity: Severity,
    pub passed: bool,
}

impl ValidationCheck {
    /// `actual` must match `expected` within `tolerance`.
    pub fn equality(
        name: impl Into<String>,
        entity_type: &'static str,
        entity_id: Option<i64>,
        expected: f64,
        actual: f64,
        tolerance: f64,
    ) -> Self {
        let difference = round_cents(actual - expected);
        Self {
            name: name.into(),
            entity_type,
            entity_id,
            expected: round_cents(expected),
            actual: round_cents(actual),
            difference,
            severity: Severity::Error,
            passed: difference.abs() <= tolerance,
        }
    }

    /// `actual` must not exceed `limit` by more than `tolerance`.
    pub fn at_most(
        name: impl Into<String>,
        entity_type: &'static str,
        entity_id: Option<i64>,
        limit: f64,
        actual: f64,
        tolerance: f64,
    ) -> Self {
        let difference = round_cents(actual - limit);
        Self {
            name: name.into(),
            entity_type,
            entity_id,
            expected: round_cents(limit),
            actual: round_cents(actual),
            difference,
            severity: Severity::Error,
            passed: difference <= tolerance,
        }
    }

    pub fn as_warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub valid: bool,
    pub tolerance: f64,
    pub error_count: usize,
    pub warning_count: usize,
    pub checks: Vec<ValidationCheck>,
}

impl ValidationSummary {
    /// Failed warnings are counted but never make the report invalid.
    pub fn from_checks(checks: Vec<ValidationCheck>, tolerance: f64) -> Self {
        let failed = |severity: Severity| {
            checks
                .iter()
                .filter(|check| !check.passed && check.severity == severity)
                .count()
        };
        let error_count = failed(Severity::Error);
        let warning_count = failed(Severity::Warning);
        Self {
            valid: error_count == 0,
            tolerance,
            error_count,
            warning_count,
            checks,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransferAudit {
    id: i64,
    stored_total: f64,
    stored_count: i64,
    computed_total: f64,
    computed_count: i64,
}

async fn audit_transfers(
    pool: &PgPool,
    scopes: &ScopeSet,
    status: &'static str,
) -> AppResult<Vec<TransferAudit>> {
    let item_status = if status == "executed" { "paid" } else { "approved" };
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT pt.id,
                pt.total_amount::float8 AS stored_total,
                pt.reimbursement_count::bigint AS stored_count,
                (COALESCE((SELECT SUM(r.amount) FROM reimbursements r
                           WHERE r.payment_transfer_id = pt.id AND r.status = ",
    );
    builder
        .push_bind(item_status)
        .push(
            "), 0)
                 - COALESCE((SELECT SUM(c.amount) FROM charges c
                             WHERE c.payment_transfer_id = pt.id AND c.status = ",
        )
        .push_bind(item_status)
        .push(
            "), 0)
                 + COALESCE((SELECT SUM(a.applied_amount) FROM recurring_transfer_applications a
                             WHERE a.payment_transfer_id = pt.id), 0))::float8 AS computed_total,
                ((SELECT COUNT(*) FROM reimbursements r
                  WHERE r.payment_transfer_id = pt.id AND r.status = ",
        )
        .push_bind(item_status)
        .push(
            ")
                 + (SELECT COUNT(*) FROM charges c
                    WHERE c.payment_transfer_id = pt.id AND c.status = ",
        )
        .push_bind(item_status)
        .push(
            ")
                 + (SELECT COUNT(*) FROM recurring_transfer_applications a
                    WHERE a.payment_transfer_id = pt.id))::bigint AS computed_count
         FROM payment_transfers pt
         WHERE pt.status = ",
        )
        .push_bind(status);
    scopes.push_group_clause(&mut builder, "pt.group_id");
    builder.push(" ORDER BY pt.id");

    let rows = builder
        .build_query_as::<TransferAudit>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

async fn transfer_checks(
    pool: &PgPool,
    scopes: &ScopeSet,
    tolerance: f64,
) -> AppResult<Vec<ValidationCheck>> {
    let mut checks = Vec::new();

    for audit in audit_transfers(pool, scopes, "pending").await? {
        checks.push(ValidationCheck::equality(
            "pending_transfer_total",
            "payment_transfer",
            Some(audit.id),
            audit.computed_total,
            audit.stored_total,
            tolerance,
        ));
        checks.push(ValidationCheck::equality(
            "pending_transfer_count",
            "payment_transfer",
            Some(audit.id),
            audit.computed_count as f64,
            audit.stored_count as f64,
            0.0,
        ));
    }

    for audit in audit_transfers(pool, scopes, "executed").await? {
        checks.push(ValidationCheck::equality(
            "executed_transfer_total",
            "payment_transfer",
            Some(audit.id),
            audit.computed_total,
            audit.stored_total,
            tolerance,
        ));
    }

    Ok(checks)
}

#[derive(Debug, sqlx::FromRow)]
struct BudgetAllocation {
    id: i64,
    total_amount: f64,
    allocated: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct FundSpending {
    id: i64,
    allocated_amount: f64,
    spent: f64,
}

async fn allocation_checks(
    pool: &PgPool,
    scopes: &ScopeSet,
    year: i32,
    tolerance: f64,
) -> AppResult<Vec<ValidationCheck>> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT b.id, b.total_amount::float8 AS total_amount,
                COALESCE((SELECT SUM(f.allocated_amount) FROM funds f
                          WHERE f.budget_id = b.id), 0)::float8 AS allocated
         FROM budgets b
         WHERE b.fiscal_year = ",
    );
    builder.push_bind(year);
    scopes.push_group_clause(&mut builder, "b.group_id");
    builder.push(" ORDER BY b.id");
    let budgets = builder
        .build_query_as::<BudgetAllocation>()
        .fetch_all(pool)
        .await?;

    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT f.id, f.allocated_amount::float8 AS allocated_amount,
                COALESCE((SELECT SUM(r.amount) FROM reimbursements r
                          WHERE r.fund_id = f.id AND r.status IN ('approved', 'paid')), 0)::float8 AS spent
         FROM funds f
         JOIN budgets b ON b.id = f.budget_id
         WHERE b.fiscal_year = ",
    );
    builder.push_bind(year);
    scopes.push_group_clause(&mut builder, "b.group_id");
    builder.push(" ORDER BY f.id");
    let funds = builder
        .build_query_as::<FundSpending>()
        .fetch_all(pool)
        .await?;

    let mut checks = Vec::with_capacity(budgets.len() + funds.len());
    for budget in budgets {
        checks.push(ValidationCheck::at_most(
            "budget_allocations_within_total",
            "budget",
            Some(budget.id),
            budget.total_amount,
            budget.allocated,
            tolerance,
        ));
    }
    for fund in funds {
        checks.push(
            ValidationCheck::at_most(
                "fund_spending_within_allocation",
                "fund",
                Some(fund.id),
                fund.allocated_amount,
                fund.spent,
                tolerance,
            )
            .as_warning(),
        );
    }
    Ok(checks)
}

/// Compares annual totals with the sum of the monthly rows, flow by flow.
pub fn annual_consistency_checks(
    annual: &FlowTotals,
    months: &[FlowTotals],
    tolerance: f64,
) -> Vec<ValidationCheck> {
    let summed = FlowTotals::sum(months);
    [
        ("annual_income", annual.income, summed.income),
        ("annual_expenses", annual.expenses, summed.expenses),
        ("annual_charges", annual.charges, summed.charges),
        ("annual_recurring", annual.recurring, summed.recurring),
        ("annual_net", annual.net, summed.net),
    ]
    .into_iter()
    .map(|(name, expected, actual)| {
        ValidationCheck::equality(name, "report", None, expected, actual, tolerance)
    })
    .collect()
}

/// Recomputes derived aggregates for the caller's scopes and compares them
/// with what is stored or reported.
pub async fn validate_reports(
    pool: &PgPool,
    scopes: &ScopeSet,
    year: i32,
    tolerance: f64,
) -> AppResult<ValidationSummary> {
    let mut checks = transfer_checks(pool, scopes, tolerance).await?;
    checks.extend(allocation_checks(pool, scopes, year, tolerance).await?);

    let annual = monthly_totals(pool, scopes, year, None).await?;
    let months = monthly_series(pool, scopes, year)
        .await?
        .into_iter()
        .map(|row| row.totals)
        .collect::<Vec<_>>();
    checks.extend(annual_consistency_checks(&annual, &months, tolerance));

    let summary = ValidationSummary::from_checks(checks, tolerance);
    if summary.valid {
        tracing::info!(
            year,
            checks = summary.checks.len(),
            warnings = summary.warning_count,
            "Report validation passed"
        );
    } else {
        tracing::warn!(
            year,
            errors = summary.error_count,
            warnings = summary.warning_count,
            "Report validation found inconsistencies"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differences_within_tolerance_pass() {
        let check = ValidationCheck::equality("t", "payment_transfer", Some(1), 100.0, 100.01, 0.01);
        assert!(check.passed);
        assert_eq!(check.difference, 0.01);

        let check = ValidationCheck::equality("t", "payment_transfer", Some(1), 100.0, 100.02, 0.01);
        assert!(!check.passed);
    }

    #[test]
    fn over_allocation_fails_and_under_allocation_passes() {
        assert!(!ValidationCheck::at_most("a", "budget", Some(1), 1000.0, 1200.0, 0.01).passed);
        assert!(ValidationCheck::at_most("a", "budget", Some(1), 1000.0, 800.0, 0.01).passed);
    }

    #[test]
    fn failed_warnings_do_not_invalidate() {
        let checks = vec![
            ValidationCheck::equality("ok", "report", None, 1.0, 1.0, 0.01),
            ValidationCheck::at_most("spend", "fund", Some(3), 10.0, 25.0, 0.01).as_warning(),
        ];
        let summary = ValidationSummary::from_checks(checks, 0.01);
        assert!(summary.valid);
        assert_eq!(summary.error_count, 0);
        assert_eq!(summary.warning_count, 1);
    }

    #[test]
    fn failed_errors_invalidate() {
        let checks = vec![ValidationCheck::equality(
            "pending_transfer_total",
            "payment_transfer",
            Some(9),
            150.0,
            -150.0,
            0.01,
        )];
        let summary = ValidationSummary::from_checks(checks, 0.01);
        assert!(!summary.valid);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.checks[0].difference, -300.0);
    }

    #[test]
    fn annual_totals_match_their_months() {
        let months = vec![
            FlowTotals::new(500.0, 100.0, 0.0, 50.0),
            FlowTotals::new(250.5, 20.25, 10.0, 50.0),
        ];
        let annual = FlowTotals::new(750.5, 120.25, 10.0, 100.0);
        let checks = annual_consistency_checks(&annual, &months, 0.01);
        assert_eq!(checks.len(), 5);
        assert!(checks.iter().all(|check| check.passed));

        let drifted = FlowTotals::new(760.5, 120.25, 10.0, 100.0);
        let checks = annual_consistency_checks(&drifted, &months, 0.01);
        assert_eq!(checks.iter().filter(|check| !check.passed).count(), 2);
    }
}
