use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    error::{round_cents, AppError, AppResult},
    services::budget_scope::ScopeSet,
};

/// Money flows a report aggregates. Dated sources filter on their own date
/// column; recurring applications filter on their period key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSource {
    Income,
    Expenses,
    Charges,
    Recurring,
}

impl FlowSource {
    fn from_clause(self) -> &'static str {
        match self {
            Self::Income => "FROM incomes x JOIN budgets b ON b.id = x.budget_id",
            Self::Expenses => {
                "FROM reimbursements x JOIN funds f ON f.id = x.fund_id JOIN budgets b ON b.id = f.budget_id"
            }
            Self::Charges => {
                "FROM charges x JOIN funds f ON f.id = x.fund_id JOIN budgets b ON b.id = f.budget_id"
            }
            Self::Recurring => {
                "FROM recurring_transfer_applications x
                 JOIN recurring_transfers rt ON rt.id = x.recurring_transfer_id
                 JOIN funds f ON f.id = rt.fund_id
                 JOIN budgets b ON b.id = f.budget_id"
            }
        }
    }

    fn amount_column(self) -> &'static str {
        match self {
            Self::Recurring => "x.applied_amount",
            _ => "x.amount",
        }
    }

    fn date_column(self) -> Option<&'static str> {
        match self {
            Self::Income => Some("x.income_date"),
            Self::Expenses => Some("x.expense_date"),
            Self::Charges => Some("x.charge_date"),
            Self::Recurring => None,
        }
    }

    fn month_expression(self) -> &'static str {
        match self {
            Self::Income => "EXTRACT(MONTH FROM x.income_date)::int",
            Self::Expenses => "EXTRACT(MONTH FROM x.expense_date)::int",
            Self::Charges => "EXTRACT(MONTH FROM x.charge_date)::int",
            Self::Recurring => "x.period_month",
        }
    }

    fn counts_settled_only(self) -> bool {
        matches!(self, Self::Expenses | Self::Charges)
    }

    /// Carried-forward debt re-bills charges that were already counted.
    fn skips_carried_debt(self) -> bool {
        self == Self::Charges
    }
}

/// Half-open date range covering a month, or the whole year when `month` is
/// `None`.
pub fn period_bounds(year: i32, month: Option<u32>) -> AppResult<(NaiveDate, NaiveDate)> {
    let invalid = || AppError::BadRequest(format!("Invalid report period {year}/{month:?}."));
    let (start, end) = match month {
        Some(month) => {
            let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
            let end = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)
            }
            .ok_or_else(invalid)?;
            (start, end)
        }
        None => (
            NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?,
            NaiveDate::from_ymd_opt(year + 1, 1, 1).ok_or_else(invalid)?,
        ),
    };
    Ok((start, end))
}

fn push_flow_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    source: FlowSource,
    scopes: &ScopeSet,
    year: i32,
    month: Option<u32>,
) -> AppResult<()> {
    builder.push(" ").push(source.from_clause()).push(" WHERE TRUE");
    match source.date_column() {
        Some(column) => {
            let (start, end) = period_bounds(year, month)?;
            builder
                .push(" AND ")
                .push(column)
                .push(" >= ")
                .push_bind(start)
                .push(" AND ")
                .push(column)
                .push(" < ")
                .push_bind(end);
        }
        None => {
            builder.push(" AND x.period_year = ").push_bind(year);
            if let Some(month) = month {
                builder.push(" AND x.period_month = ").push_bind(month as i32);
            }
        }
    }
    if source.counts_settled_only() {
        builder.push(" AND x.status IN ('approved', 'paid')");
    }
    if source.skips_carried_debt() {
        builder.push(" AND x.carried_forward_from IS NULL");
    }
    scopes.push_group_clause(builder, "b.group_id");
    Ok(())
}

/// Sum of one flow over a month or a year.
pub async fn sum_flow(
    pool: &PgPool,
    source: FlowSource,
    scopes: &ScopeSet,
    year: i32,
    month: Option<u32>,
) -> AppResult<f64> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT COALESCE(SUM(");
    builder.push(source.amount_column()).push("), 0)::float8");
    push_flow_filter(&mut builder, source, scopes, year, month)?;

    let total: f64 = builder.build_query_scalar().fetch_one(pool).await?;
    Ok(round_cents(total))
}

/// Per-month sums of one flow over a year, indexed `0..12`.
pub async fn sum_flow_by_month(
    pool: &PgPool,
    source: FlowSource,
    scopes: &ScopeSet,
    year: i32,
) -> AppResult<[f64; 12]> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
    builder
        .push(source.month_expression())
        .push(" AS month, COALESCE(SUM(")
        .push(source.amount_column())
        .push("), 0)::float8 AS total");
    push_flow_filter(&mut builder, source, scopes, year, None)?;
    builder.push(" GROUP BY 1");

    let rows: Vec<(i32, f64)> = builder.build_query_as().fetch_all(pool).await?;
    let mut months = [0.0; 12];
    for (month, total) in rows {
        if let Some(slot) = usize::try_from(month - 1).ok().and_then(|i| months.get_mut(i)) {
            *slot = round_cents(total);
        }
    }
    Ok(months)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FlowTotals {
    pub income: f64,
    pub expenses: f64,
    pub charges: f64,
    pub recurring: f64,
    pub net: f64,
}

impl FlowTotals {
    /// Charges are money owed back to the treasury, so they add to net.
    pub fn new(income: f64, expenses: f64, charges: f64, recurring: f64) -> Self {
        Self {
            income,
            expenses,
            charges,
            recurring,
            net: round_cents(income - expenses + charges - recurring),
        }
    }

    pub fn sum<'a>(rows: impl IntoIterator<Item = &'a FlowTotals>) -> Self {
        let (mut income, mut expenses, mut charges, mut recurring) = (0.0, 0.0, 0.0, 0.0);
        for row in rows {
            income += row.income;
            expenses += row.expenses;
            charges += row.charges;
            recurring += row.recurring;
        }
        Self::new(
            round_cents(income),
            round_cents(expenses),
            round_cents(charges),
            round_cents(recurring),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct FundBreakdown {
    pub fund_id: i64,
    pub fund_name: String,
    pub budget_id: i64,
    pub budget_name: String,
    pub group_id: Option<i64>,
    pub allocated: f64,
    pub income: f64,
    pub expenses: f64,
    pub charges: f64,
    pub recurring: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyReport {
    pub year: i32,
    pub month: u32,
    #[serde(flatten)]
    pub totals: FlowTotals,
    pub funds: Vec<FundBreakdown>,
}

pub async fn monthly_totals(
    pool: &PgPool,
    scopes: &ScopeSet,
    year: i32,
    month: Option<u32>,
) -> AppResult<FlowTotals> {
    Ok(FlowTotals::new(
        sum_flow(pool, FlowSource::Income, scopes, year, month).await?,
        sum_flow(pool, FlowSource::Expenses, scopes, year, month).await?,
        sum_flow(pool, FlowSource::Charges, scopes, year, month).await?,
        sum_flow(pool, FlowSource::Recurring, scopes, year, month).await?,
    ))
}

async fn fund_breakdown(
    pool: &PgPool,
    scopes: &ScopeSet,
    year: i32,
    month: u32,
) -> AppResult<Vec<FundBreakdown>> {
    let (start, end) = period_bounds(year, Some(month))?;
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT f.id AS fund_id, f.name AS fund_name, b.id AS budget_id, b.name AS budget_name,
                b.group_id, f.allocated_amount::float8 AS allocated,
                COALESCE((SELECT SUM(i.amount) FROM incomes i
                          WHERE i.fund_id = f.id AND i.income_date >= ",
    );
    builder
        .push_bind(start)
        .push(" AND i.income_date < ")
        .push_bind(end)
        .push(
            "), 0)::float8 AS income,
                COALESCE((SELECT SUM(r.amount) FROM reimbursements r
                          WHERE r.fund_id = f.id AND r.status IN ('approved', 'paid')
                            AND r.expense_date >= ",
        )
        .push_bind(start)
        .push(" AND r.expense_date < ")
        .push_bind(end)
        .push(
            "), 0)::float8 AS expenses,
                COALESCE((SELECT SUM(c.amount) FROM charges c
                          WHERE c.fund_id = f.id AND c.status IN ('approved', 'paid')
                            AND c.carried_forward_from IS NULL
                            AND c.charge_date >= ",
        )
        .push_bind(start)
        .push(" AND c.charge_date < ")
        .push_bind(end)
        .push(
            "), 0)::float8 AS charges,
                COALESCE((SELECT SUM(a.applied_amount) FROM recurring_transfer_applications a
                          JOIN recurring_transfers rt ON rt.id = a.recurring_transfer_id
                          WHERE rt.fund_id = f.id AND a.period_year = ",
        )
        .push_bind(year)
        .push(" AND a.period_month = ")
        .push_bind(month as i32)
        .push(
            "), 0)::float8 AS recurring
         FROM funds f
         JOIN budgets b ON b.id = f.budget_id
         WHERE TRUE",
        );
    scopes.push_group_clause(&mut builder, "b.group_id");
    builder.push(" ORDER BY b.id, f.id");

    let rows = builder
        .build_query_as::<FundBreakdown>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn monthly_report(
    pool: &PgPool,
    scopes: &ScopeSet,
    year: i32,
    month: u32,
) -> AppResult<MonthlyReport> {
    let totals = monthly_totals(pool, scopes, year, Some(month)).await?;
    let funds = fund_breakdown(pool, scopes, year, month).await?;
    Ok(MonthlyReport {
        year,
        month,
        totals,
        funds,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthRow {
    pub month: u32,
    #[serde(flatten)]
    pub totals: FlowTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct BudgetSummary {
    pub budget_id: i64,
    pub name: String,
    pub group_id: Option<i64>,
    pub total_amount: f64,
    pub allocated: f64,
    pub spent: f64,
    pub income: f64,
    pub remaining: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnualReport {
    pub year: i32,
    pub months: Vec<MonthRow>,
    pub totals: FlowTotals,
    pub budgets: Vec<BudgetSummary>,
}

pub async fn monthly_series(pool: &PgPool, scopes: &ScopeSet, year: i32) -> AppResult<Vec<MonthRow>> {
    let income = sum_flow_by_month(pool, FlowSource::Income, scopes, year).await?;
    let expenses = sum_flow_by_month(pool, FlowSource::Expenses, scopes, year).await?;
    let charges = sum_flow_by_month(pool, FlowSource::Charges, scopes, year).await?;
    let recurring = sum_flow_by_month(pool, FlowSource::Recurring, scopes, year).await?;

    Ok((0..12)
        .map(|i| MonthRow {
            month: i as u32 + 1,
            totals: FlowTotals::new(income[i], expenses[i], charges[i], recurring[i]),
        })
        .collect())
}

pub async fn budget_summaries(
    pool: &PgPool,
    scopes: &ScopeSet,
    year: i32,
) -> AppResult<Vec<BudgetSummary>> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT s.*, (s.total_amount - s.spent) AS remaining FROM (
           SELECT b.id AS budget_id, b.name, b.group_id,
                  b.total_amount::float8 AS total_amount,
                  COALESCE((SELECT SUM(f.allocated_amount) FROM funds f
                            WHERE f.budget_id = b.id), 0)::float8 AS allocated,
                  COALESCE((SELECT SUM(r.amount) FROM reimbursements r
                            JOIN funds f ON f.id = r.fund_id
                            WHERE f.budget_id = b.id AND r.status IN ('approved', 'paid')), 0)::float8 AS spent,
                  COALESCE((SELECT SUM(i.amount) FROM incomes i
                            WHERE i.budget_id = b.id), 0)::float8 AS income
           FROM budgets b
           WHERE b.fiscal_year = ",
    );
    builder.push_bind(year);
    scopes.push_group_clause(&mut builder, "b.group_id");
    builder.push(") s ORDER BY s.budget_id");

    let rows = builder
        .build_query_as::<BudgetSummary>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn annual_report(pool: &PgPool, scopes: &ScopeSet, year: i32) -> AppResult<AnnualReport> {
    let months = monthly_series(pool, scopes, year).await?;
    let totals = monthly_totals(pool, scopes, year, None).await?;
    let budgets = budget_summaries(pool, scopes, year).await?;
    Ok(AnnualReport {
        year,
        months,
        totals,
        budgets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn december_bounds_roll_into_next_year() {
        let (start, end) = period_bounds(2025, Some(12)).expect("valid period");
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 12, 1).expect("date"));
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"));
        assert!(period_bounds(2025, Some(13)).is_err());
    }

    #[test]
    fn whole_year_bounds() {
        let (start, end) = period_bounds(2026, None).expect("valid year");
        assert_eq!(start, NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"));
        assert_eq!(end, NaiveDate::from_ymd_opt(2027, 1, 1).expect("date"));
    }

    #[test]
    fn net_adds_charges_back() {
        let totals = FlowTotals::new(1000.0, 400.0, 50.0, 100.0);
        assert_eq!(totals.net, 550.0);
    }

    #[test]
    fn summing_month_rows_rounds_to_cents() {
        let rows = [
            FlowTotals::new(0.1, 0.0, 0.0, 0.0),
            FlowTotals::new(0.2, 0.0, 0.0, 0.0),
        ];
        let total = FlowTotals::sum(rows.iter());
        assert_eq!(total.income, 0.3);
        assert_eq!(total.net, 0.3);
    }

    #[test]
    fn scope_filter_is_applied_to_flow_queries() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1");
        let scopes = ScopeSet {
            circle: true,
            group_ids: vec![4],
        };
        push_flow_filter(&mut builder, FlowSource::Recurring, &scopes, 2026, Some(4))
            .expect("valid period");
        let sql = builder.sql();
        assert!(sql.contains("x.period_year = $1"));
        assert!(sql.contains("x.period_month = $2"));
        assert!(sql.contains("(b.group_id IS NULL OR b.group_id = ANY($3))"));
        assert!(!sql.contains("status IN"));
    }

    #[test]
    fn carried_debt_is_left_out_of_charge_flows() {
        let scopes = ScopeSet {
            circle: true,
            group_ids: Vec::new(),
        };
        let mut charges = QueryBuilder::<Postgres>::new("SELECT 1");
        push_flow_filter(&mut charges, FlowSource::Charges, &scopes, 2026, Some(3))
            .expect("valid period");
        assert!(charges.sql().contains("x.carried_forward_from IS NULL"));

        let mut expenses = QueryBuilder::<Postgres>::new("SELECT 1");
        push_flow_filter(&mut expenses, FlowSource::Expenses, &scopes, 2026, Some(3))
            .expect("valid period");
        assert!(!expenses.sql().contains("carried_forward_from"));
    }
}
