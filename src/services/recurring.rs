//! Recurring transfers: period keys, application rows and the generation
//! run that folds due obligations into open payment transfers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use sqlx::PgConnection;

use crate::{
    access::AccessProfile,
    error::{AppError, AppResult},
    services::{
        budget_scope::BudgetScope,
        payment_transfers::{
            get_or_create_open_transfer, lock_open_transfer_slot, update_transfer_totals,
        },
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Monthly,
    Quarterly,
    Annual,
}

impl Frequency {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "annual" => Ok(Self::Annual),
            other => Err(AppError::BadRequest(format!(
                "Invalid frequency '{other}'. Expected monthly, quarterly or annual."
            ))),
        }
    }

    /// First month of the period containing `month` (1-based).
    pub fn period_month(self, month: u32) -> u32 {
        match self {
            Self::Monthly => month,
            Self::Quarterly => ((month - 1) / 3) * 3 + 1,
            Self::Annual => 1,
        }
    }

    pub fn period_for(self, date: NaiveDate) -> PeriodKey {
        PeriodKey {
            year: date.year(),
            month: self.period_month(date.month()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurringStatus {
    Active,
    Paused,
    Cancelled,
}

impl RecurringStatus {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::BadRequest(format!(
                "Invalid recurring transfer status '{other}'."
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Cancelled is terminal; everything else can move freely.
    pub fn check_change(self, next: Self) -> AppResult<()> {
        if self == next {
            return Err(AppError::Conflict(format!(
                "Recurring transfer is already {}.",
                self.as_str()
            )));
        }
        if self == Self::Cancelled {
            return Err(AppError::Conflict(
                "Cancelled recurring transfers cannot be reactivated.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Year plus frequency-normalized month identifying one materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PeriodKey {
    pub year: i32,
    pub month: u32,
}

/// Date window check: started on or before `today` and not yet ended.
pub fn is_within_window(start_date: NaiveDate, end_date: Option<NaiveDate>, today: NaiveDate) -> bool {
    start_date <= today && end_date.map_or(true, |end| end >= today)
}

/// Inserts the application row for `period` unless it already exists.
/// Returns whether a row was created.
pub async fn ensure_recurring_application(
    conn: &mut PgConnection,
    recurring_transfer_id: i64,
    period: PeriodKey,
    transfer_id: i64,
    applied_amount: f64,
) -> AppResult<bool> {
    let inserted: Option<i64> = sqlx::query_scalar(
        "INSERT INTO recurring_transfer_applications
           (recurring_transfer_id, payment_transfer_id, period_year, period_month, applied_amount)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (recurring_transfer_id, period_year, period_month) DO NOTHING
         RETURNING id",
    )
    .bind(recurring_transfer_id)
    .bind(transfer_id)
    .bind(period.year)
    .bind(period.month as i32)
    .bind(applied_amount)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(inserted.is_some())
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StaleApplication {
    id: i64,
    recipient_user_id: i64,
    group_id: Option<i64>,
}

/// Deletes applications that still sit in pending transfers and recomputes
/// those transfers. The open-transfer slots are taken first, in key order,
/// so this never waits on a row an execution already holds.
async fn remove_applications(
    conn: &mut PgConnection,
    stale: &[StaleApplication],
) -> AppResult<usize> {
    if stale.is_empty() {
        return Ok(0);
    }

    let slots = stale
        .iter()
        .map(|row| (row.recipient_user_id, row.group_id))
        .collect::<BTreeSet<_>>();
    for (recipient_user_id, group_id) in slots {
        let scope = BudgetScope::from_budget_group(group_id);
        lock_open_transfer_slot(conn, recipient_user_id, &scope).await?;
    }

    let ids = stale.iter().map(|row| row.id).collect::<Vec<_>>();
    let removed: Vec<(i64, i64)> = sqlx::query_as(
        "DELETE FROM recurring_transfer_applications a
         USING payment_transfers pt
         WHERE a.id = ANY($1)
           AND pt.id = a.payment_transfer_id
           AND pt.status = 'pending'
         RETURNING a.id, a.payment_transfer_id",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let transfers = removed
        .iter()
        .map(|(_, transfer_id)| *transfer_id)
        .collect::<BTreeSet<_>>();
    for transfer_id in transfers {
        update_transfer_totals(conn, transfer_id).await?;
    }
    Ok(removed.len())
}

/// Removes a recurring transfer's applications that still sit in pending
/// transfers and recomputes those transfers. Used when the recurring
/// transfer is cancelled or deleted.
pub async fn remove_pending_applications(
    conn: &mut PgConnection,
    recurring_transfer_id: i64,
) -> AppResult<usize> {
    let stale = sqlx::query_as::<_, StaleApplication>(
        "SELECT a.id, pt.recipient_user_id, pt.group_id
         FROM recurring_transfer_applications a
         JOIN payment_transfers pt ON pt.id = a.payment_transfer_id
         WHERE a.recurring_transfer_id = $1 AND pt.status = 'pending'",
    )
    .bind(recurring_transfer_id)
    .fetch_all(&mut *conn)
    .await?;

    remove_applications(conn, &stale).await
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct DueCandidate {
    id: i64,
    recipient_user_id: i64,
    amount: f64,
    frequency: String,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    group_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationReport {
    #[serde(rename = "period_year")]
    pub year: i32,
    #[serde(rename = "period_month")]
    pub month: u32,
    pub removed_applications: usize,
    pub created_applications: usize,
    pub transfers_updated: usize,
    pub skipped_out_of_scope: usize,
}

/// Two phases in the caller's transaction:
/// 1. drop applications of inactive budgets still sitting in pending transfers;
/// 2. materialize the current period of every due recurring transfer.
///
/// Only scopes the actor may act on are touched.
pub async fn generate_recurring_transfers(
    conn: &mut PgConnection,
    actor: &AccessProfile,
    today: NaiveDate,
) -> AppResult<GenerationReport> {
    let scopes = actor.treasury_scopes();
    if scopes.is_empty() {
        return Err(AppError::Forbidden(
            "Forbidden: treasurer role required.".to_string(),
        ));
    }

    let mut report = GenerationReport {
        year: today.year(),
        month: today.month(),
        ..GenerationReport::default()
    };

    let stale = sqlx::query_as::<_, StaleApplication>(
        "SELECT a.id, pt.recipient_user_id, pt.group_id
         FROM recurring_transfer_applications a
         JOIN recurring_transfers rt ON rt.id = a.recurring_transfer_id
         JOIN funds f ON f.id = rt.fund_id
         JOIN budgets b ON b.id = f.budget_id
         JOIN payment_transfers pt ON pt.id = a.payment_transfer_id
         WHERE b.is_active = FALSE AND pt.status = 'pending'",
    )
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .filter(|row| scopes.contains(&BudgetScope::from_budget_group(row.group_id)))
    .collect::<Vec<_>>();
    report.removed_applications = remove_applications(conn, &stale).await?;

    let candidates = sqlx::query_as::<_, DueCandidate>(
        "SELECT rt.id, rt.recipient_user_id, rt.amount::float8 AS amount, rt.frequency,
                rt.start_date, rt.end_date, b.group_id
         FROM recurring_transfers rt
         JOIN funds f ON f.id = rt.fund_id
         JOIN budgets b ON b.id = f.budget_id
         WHERE rt.status = 'active'
           AND b.is_active = TRUE
           AND NOT EXISTS (
             SELECT 1 FROM recurring_transfer_applications a
             WHERE a.recurring_transfer_id = rt.id
               AND a.period_year = $1
               AND a.period_month = CASE rt.frequency
                                      WHEN 'monthly' THEN $2
                                      WHEN 'quarterly' THEN $3
                                      ELSE 1
                                    END
           )
         ORDER BY rt.recipient_user_id, rt.id",
    )
    .bind(today.year())
    .bind(Frequency::Monthly.period_month(today.month()) as i32)
    .bind(Frequency::Quarterly.period_month(today.month()) as i32)
    .fetch_all(&mut *conn)
    .await?;

    // One open transfer per (recipient, scope); BTreeMap keeps lock order stable.
    let mut grouped: BTreeMap<(i64, Option<i64>), Vec<DueCandidate>> = BTreeMap::new();
    for candidate in candidates {
        if !is_within_window(candidate.start_date, candidate.end_date, today) {
            continue;
        }
        let scope = BudgetScope::from_budget_group(candidate.group_id);
        if !scopes.contains(&scope) {
            report.skipped_out_of_scope += 1;
            continue;
        }
        grouped
            .entry((candidate.recipient_user_id, candidate.group_id))
            .or_default()
            .push(candidate);
    }

    for ((recipient_user_id, group_id), due) in grouped {
        let scope = BudgetScope::from_budget_group(group_id);
        let transfer_id = get_or_create_open_transfer(conn, recipient_user_id, &scope).await?;

        let mut created = 0;
        for candidate in &due {
            let period = Frequency::parse(&candidate.frequency)?.period_for(today);
            if ensure_recurring_application(conn, candidate.id, period, transfer_id, candidate.amount)
                .await?
            {
                created += 1;
            }
        }

        if created > 0 {
            update_transfer_totals(conn, transfer_id).await?;
            report.transfers_updated += 1;
            report.created_applications += created;
        }
    }

    tracing::info!(
        year = report.year,
        month = report.month,
        removed = report.removed_applications,
        created = report.created_applications,
        transfers = report.transfers_updated,
        actor = actor.user_id,
        "Generated recurring transfers"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn period_months_are_normalized_per_frequency() {
        assert_eq!(Frequency::Monthly.period_month(8), 8);
        assert_eq!(Frequency::Quarterly.period_month(1), 1);
        assert_eq!(Frequency::Quarterly.period_month(3), 1);
        assert_eq!(Frequency::Quarterly.period_month(5), 4);
        assert_eq!(Frequency::Quarterly.period_month(9), 7);
        assert_eq!(Frequency::Quarterly.period_month(12), 10);
        assert_eq!(Frequency::Annual.period_month(11), 1);
    }

    #[test]
    fn same_month_yields_same_period_key() {
        let first = Frequency::Monthly.period_for(date(2026, 10, 1));
        let second = Frequency::Monthly.period_for(date(2026, 10, 31));
        assert_eq!(first, second);
        assert_ne!(first, Frequency::Monthly.period_for(date(2026, 11, 1)));
    }

    #[test]
    fn quarterly_and_annual_keys_span_their_period() {
        assert_eq!(
            Frequency::Quarterly.period_for(date(2026, 11, 19)),
            PeriodKey { year: 2026, month: 10 }
        );
        assert_eq!(
            Frequency::Annual.period_for(date(2026, 6, 30)),
            PeriodKey { year: 2026, month: 1 }
        );
    }

    #[test]
    fn window_respects_start_and_end_dates() {
        let today = date(2026, 10, 19);
        assert!(is_within_window(date(2026, 1, 1), None, today));
        assert!(is_within_window(date(2026, 1, 1), Some(today), today));
        assert!(!is_within_window(date(2026, 1, 1), Some(date(2026, 10, 18)), today));
        assert!(!is_within_window(date(2026, 10, 20), None, today));
    }

    #[test]
    fn cancelled_is_terminal() {
        assert!(RecurringStatus::Active
            .check_change(RecurringStatus::Paused)
            .is_ok());
        assert!(RecurringStatus::Paused
            .check_change(RecurringStatus::Active)
            .is_ok());
        assert!(RecurringStatus::Cancelled
            .check_change(RecurringStatus::Active)
            .is_err());
        assert!(RecurringStatus::Active
            .check_change(RecurringStatus::Active)
            .is_err());
    }

    #[test]
    fn frequency_parsing_is_case_insensitive() {
        assert_eq!(Frequency::parse("Quarterly").ok(), Some(Frequency::Quarterly));
        assert!(Frequency::parse("weekly").is_err());
    }

    mod database {
        use sqlx::PgPool;

        use super::*;
        use crate::services::{
            lifecycle::{ItemKind, StatusAction},
            review::apply_status_action,
            test_support::*,
        };

        async fn generate(pool: &PgPool, actor: &AccessProfile) -> GenerationReport {
            let mut tx = pool.begin().await.expect("begin");
            let report = generate_recurring_transfers(&mut tx, actor, day(2026, 3, 15))
                .await
                .expect("generate");
            tx.commit().await.expect("commit");
            report
        }

        async fn application_count(pool: &PgPool, recurring_id: i64) -> i64 {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM recurring_transfer_applications WHERE recurring_transfer_id = $1",
            )
            .bind(recurring_id)
            .fetch_one(pool)
            .await
            .expect("application count")
        }

        #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
        async fn generating_twice_in_a_month_applies_once(pool: PgPool) {
            let recurring_id = insert_recurring(&pool, CIRCLE_FUND, MEMBER, 75.0).await;

            let outside = generate(&pool, &group_treasurer()).await;
            assert_eq!(outside.created_applications, 0);
            assert_eq!(outside.skipped_out_of_scope, 1);

            let first = generate(&pool, &circle_treasurer()).await;
            assert_eq!((first.year, first.month), (2026, 3));
            assert_eq!(first.created_applications, 1);
            assert_eq!(first.transfers_updated, 1);
            let second = generate(&pool, &circle_treasurer()).await;
            assert_eq!(second.created_applications, 0);
            assert_eq!(second.transfers_updated, 0);

            assert_eq!(application_count(&pool, recurring_id).await, 1);
            let transfers = pending_transfer_ids(&pool, MEMBER).await;
            assert_eq!(transfers.len(), 1);
            let (stored, derived) = stored_and_derived(&pool, transfers[0]).await;
            assert_eq!(stored, (75.0, 1));
            assert_eq!(stored, derived);
        }

        #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
        async fn cancelled_recurring_leaves_pending_transfers(pool: PgPool) {
            let recurring_id = insert_recurring(&pool, CIRCLE_FUND, MEMBER, 75.0).await;
            let reimbursement = insert_reimbursement(&pool, CIRCLE_FUND, MEMBER, 30.0).await;
            generate(&pool, &circle_treasurer()).await;
            let mut tx = pool.begin().await.expect("begin");
            apply_status_action(
                &mut tx,
                ItemKind::Reimbursement,
                reimbursement,
                StatusAction::Approve,
                &circle_treasurer(),
                None,
            )
            .await
            .expect("approve");
            tx.commit().await.expect("commit");
            let transfer_id = pending_transfer_ids(&pool, MEMBER).await[0];
            assert_eq!(stored_and_derived(&pool, transfer_id).await.0, (105.0, 2));

            let mut tx = pool.begin().await.expect("begin");
            let removed = remove_pending_applications(&mut tx, recurring_id)
                .await
                .expect("remove applications");
            tx.commit().await.expect("commit");

            assert_eq!(removed, 1);
            assert_eq!(application_count(&pool, recurring_id).await, 0);
            let (stored, derived) = stored_and_derived(&pool, transfer_id).await;
            assert_eq!(stored, (30.0, 1));
            assert_eq!(stored, derived);
        }

        #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
        async fn deactivated_budgets_drop_their_pending_applications(pool: PgPool) {
            let recurring_id = insert_recurring(&pool, GROUP_FUND, MEMBER, 40.0).await;
            generate(&pool, &group_treasurer()).await;
            let transfer_id = pending_transfer_ids(&pool, MEMBER).await[0];

            sqlx::query("UPDATE budgets SET is_active = FALSE WHERE id = 2")
                .execute(&pool)
                .await
                .expect("deactivate budget");
            let report = generate(&pool, &group_treasurer()).await;

            assert_eq!(report.removed_applications, 1);
            assert_eq!(report.created_applications, 0);
            assert_eq!(application_count(&pool, recurring_id).await, 0);
            let (stored, derived) = stored_and_derived(&pool, transfer_id).await;
            assert_eq!(stored, (0.0, 0));
            assert_eq!(stored, derived);
        }
    }
}

