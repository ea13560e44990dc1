//! Rows and profiles for the database tests. The seed fixture provides
//! users 1 (circle treasurer), 2 (member of group 1) and 3 (treasurer of
//! group 1), circle fund 1 and group fund 2.

use chrono::NaiveDate;
use sqlx::PgPool;

use crate::access::AccessProfile;

pub const CIRCLE_FUND: i64 = 1;
pub const GROUP_FUND: i64 = 2;
pub const MEMBER: i64 = 2;

pub fn circle_treasurer() -> AccessProfile {
    AccessProfile {
        user_id: 1,
        is_circle_treasurer: true,
        is_group_treasurer: false,
        group_ids: Vec::new(),
    }
}

pub fn group_treasurer() -> AccessProfile {
    AccessProfile {
        user_id: 3,
        is_circle_treasurer: false,
        is_group_treasurer: true,
        group_ids: vec![1],
    }
}

pub fn member() -> AccessProfile {
    AccessProfile {
        user_id: MEMBER,
        is_circle_treasurer: false,
        is_group_treasurer: false,
        group_ids: vec![1],
    }
}

pub fn day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub async fn insert_reimbursement(pool: &PgPool, fund_id: i64, user_id: i64, amount: f64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO reimbursements (fund_id, user_id, amount, description, expense_date, status)
         VALUES ($1, $2, $3, 'Receipt', DATE '2026-03-10', 'pending')
         RETURNING id",
    )
    .bind(fund_id)
    .bind(user_id)
    .bind(amount)
    .fetch_one(pool)
    .await
    .expect("insert reimbursement")
}

pub async fn insert_charge(pool: &PgPool, fund_id: i64, user_id: i64, amount: f64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO charges (fund_id, user_id, amount, description, charge_date, status, created_by)
         VALUES ($1, $2, $3, 'Dues', DATE '2026-03-12', 'pending', 1)
         RETURNING id",
    )
    .bind(fund_id)
    .bind(user_id)
    .bind(amount)
    .fetch_one(pool)
    .await
    .expect("insert charge")
}

pub async fn insert_recurring(pool: &PgPool, fund_id: i64, recipient: i64, amount: f64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO recurring_transfers
           (fund_id, recipient_user_id, amount, description, frequency, start_date, status, created_by)
         VALUES ($1, $2, $3, 'Stipend', 'monthly', DATE '2026-01-01', 'active', 1)
         RETURNING id",
    )
    .bind(fund_id)
    .bind(recipient)
    .bind(amount)
    .fetch_one(pool)
    .await
    .expect("insert recurring transfer")
}

pub async fn item_status(pool: &PgPool, table: &str, id: i64) -> (String, Option<i64>) {
    let sql = format!("SELECT status, payment_transfer_id FROM {table} WHERE id = $1");
    sqlx::query_as(&sql)
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("item row")
}

pub async fn pending_transfer_ids(pool: &PgPool, recipient: i64) -> Vec<i64> {
    sqlx::query_scalar(
        "SELECT id FROM payment_transfers
         WHERE recipient_user_id = $1 AND status = 'pending'
         ORDER BY id",
    )
    .bind(recipient)
    .fetch_all(pool)
    .await
    .expect("pending transfers")
}

/// Stored (total, count) next to the values recomputed from linked rows.
pub async fn stored_and_derived(pool: &PgPool, transfer_id: i64) -> ((f64, i64), (f64, i64)) {
    sqlx::query_as::<_, (f64, i64, f64, i64)>(
        "SELECT pt.total_amount::float8, pt.reimbursement_count::bigint,
                (COALESCE((SELECT SUM(amount) FROM reimbursements
                           WHERE payment_transfer_id = pt.id AND status = 'approved'), 0)
                 - COALESCE((SELECT SUM(amount) FROM charges
                             WHERE payment_transfer_id = pt.id AND status = 'approved'), 0)
                 + COALESCE((SELECT SUM(applied_amount) FROM recurring_transfer_applications
                             WHERE payment_transfer_id = pt.id), 0))::float8,
                ((SELECT COUNT(*) FROM reimbursements
                  WHERE payment_transfer_id = pt.id AND status = 'approved')
                 + (SELECT COUNT(*) FROM charges
                    WHERE payment_transfer_id = pt.id AND status = 'approved')
                 + (SELECT COUNT(*) FROM recurring_transfer_applications
                    WHERE payment_transfer_id = pt.id))::bigint
         FROM payment_transfers pt
         WHERE pt.id = $1",
    )
    .bind(transfer_id)
    .fetch_one(pool)
    .await
    .map(|(total, count, derived_total, derived_count)| {
        ((total, count), (derived_total, derived_count))
    })
    .expect("transfer totals")
}
