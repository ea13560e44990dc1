use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    error::{AppError, AppResult},
    services::budget_scope::BudgetScope,
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_zero_amount() -> f64 {
    0.0
}
fn default_limit_200() -> i64 {
    200
}
fn default_limit_500() -> i64 {
    500
}

fn known_frequency(value: &str) -> Result<(), ValidationError> {
    if matches!(value.trim(), "monthly" | "quarterly" | "annual") {
        return Ok(());
    }
    Err(ValidationError::new("unknown_frequency"))
}

// Budgets

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateBudgetInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub group_id: Option<i64>,
    #[validate(range(min = 2000, max = 2100))]
    pub fiscal_year: i32,
    #[validate(range(min = 0.0))]
    pub total_amount: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateBudgetInput {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(range(min = 2000, max = 2100))]
    pub fiscal_year: Option<i32>,
    #[validate(range(min = 0.0))]
    pub total_amount: Option<f64>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AllocationEntry {
    pub fund_id: i64,
    #[validate(range(min = 0.0))]
    pub allocated_amount: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SetAllocationsInput {
    #[validate(length(min = 1, max = 500), nested)]
    pub allocations: Vec<AllocationEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetsQuery {
    pub group_id: Option<i64>,
    pub fiscal_year: Option<i32>,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetPath {
    pub budget_id: i64,
}

// Funds

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateFundInput {
    pub budget_id: i64,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_zero_amount")]
    #[validate(range(min = 0.0))]
    pub allocated_amount: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateFundInput {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(range(min = 0.0))]
    pub allocated_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundsQuery {
    pub budget_id: Option<i64>,
    #[serde(default = "default_limit_500")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundPath {
    pub fund_id: i64,
}

// Incomes

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateIncomeInput {
    pub budget_id: i64,
    pub fund_id: Option<i64>,
    #[validate(range(exclusive_min = 0.0))]
    pub amount: f64,
    #[validate(length(min = 1, max = 255))]
    pub source: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    pub income_date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateIncomeInput {
    pub fund_id: Option<i64>,
    #[validate(range(exclusive_min = 0.0))]
    pub amount: Option<f64>,
    #[validate(length(min = 1, max = 255))]
    pub source: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    pub income_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomesQuery {
    pub budget_id: Option<i64>,
    pub fund_id: Option<i64>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    #[serde(default = "default_limit_500")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomePath {
    pub income_id: i64,
}

// Reimbursements

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateReimbursementInput {
    pub fund_id: i64,
    #[validate(range(exclusive_min = 0.0))]
    pub amount: f64,
    #[validate(length(min = 1, max = 1000))]
    pub description: String,
    pub expense_date: NaiveDate,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateReimbursementInput {
    pub fund_id: Option<i64>,
    #[validate(range(exclusive_min = 0.0))]
    pub amount: Option<f64>,
    #[validate(length(min = 1, max = 1000))]
    pub description: Option<String>,
    pub expense_date: Option<NaiveDate>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReimbursementsQuery {
    pub status: Option<String>,
    pub fund_id: Option<i64>,
    pub budget_id: Option<i64>,
    pub user_id: Option<i64>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReimbursementPath {
    pub reimbursement_id: i64,
}

// Charges

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateChargeInput {
    pub fund_id: i64,
    pub user_id: i64,
    #[validate(range(exclusive_min = 0.0))]
    pub amount: f64,
    #[validate(length(min = 1, max = 1000))]
    pub description: String,
    pub charge_date: NaiveDate,
    #[serde(default = "default_false", skip_serializing)]
    pub approve_immediately: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateChargeInput {
    #[validate(range(exclusive_min = 0.0))]
    pub amount: Option<f64>,
    #[validate(length(min = 1, max = 1000))]
    pub description: Option<String>,
    pub charge_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargesQuery {
    pub status: Option<String>,
    pub fund_id: Option<i64>,
    pub budget_id: Option<i64>,
    pub user_id: Option<i64>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargePath {
    pub charge_id: i64,
}

// Status changes shared by reimbursements and charges

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ReviewInput {
    #[validate(length(max = 2000))]
    pub review_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchIdsInput {
    pub ids: Vec<i64>,
}

// Recurring transfers

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_recurring_window"))]
pub struct CreateRecurringTransferInput {
    pub fund_id: i64,
    pub recipient_user_id: i64,
    #[validate(range(exclusive_min = 0.0))]
    pub amount: f64,
    #[validate(length(min = 1, max = 1000))]
    pub description: String,
    #[validate(custom(function = "known_frequency"))]
    pub frequency: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

fn validate_recurring_window(input: &CreateRecurringTransferInput) -> Result<(), ValidationError> {
    match input.end_date {
        Some(end) if end < input.start_date => {
            Err(ValidationError::new("end_date_before_start_date"))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateRecurringTransferInput {
    #[validate(range(exclusive_min = 0.0))]
    pub amount: Option<f64>,
    #[validate(length(min = 1, max = 1000))]
    pub description: Option<String>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurringStatusInput {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurringTransfersQuery {
    pub status: Option<String>,
    pub fund_id: Option<i64>,
    pub recipient_user_id: Option<i64>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurringTransferPath {
    pub recurring_transfer_id: i64,
}

// Payment transfers

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentTransfersQuery {
    pub status: Option<String>,
    pub budget_type: Option<String>,
    pub group_id: Option<i64>,
    pub recipient_user_id: Option<i64>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentTransferPath {
    pub transfer_id: i64,
}

// Reports

#[derive(Debug, Clone, Deserialize)]
pub struct MonthlyReportQuery {
    pub year: i32,
    pub month: u32,
    pub budget_type: Option<String>,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnualReportQuery {
    pub year: i32,
    pub budget_type: Option<String>,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateReportQuery {
    pub year: Option<i32>,
    pub budget_type: Option<String>,
    pub group_id: Option<i64>,
}

/// Optional `budget_type` / `group_id` query pair. A lone `group_id`
/// implies a group scope.
pub fn requested_scope(
    budget_type: Option<&str>,
    group_id: Option<i64>,
) -> AppResult<Option<BudgetScope>> {
    match (budget_type.map(str::trim).filter(|t| !t.is_empty()), group_id) {
        (None, None) => Ok(None),
        (None, Some(group_id)) => Ok(Some(BudgetScope::group(group_id))),
        (Some(budget_type), group_id) => BudgetScope::from_parts(budget_type, group_id).map(Some),
    }
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::services::budget_scope::BudgetType;

    #[test]
    fn reimbursement_amount_must_be_positive() {
        let input: CreateReimbursementInput = serde_json::from_value(json!({
            "fund_id": 3,
            "amount": 0,
            "description": "Train tickets",
            "expense_date": "2026-03-14"
        }))
        .expect("deserializes");
        assert!(matches!(
            validate_input(&input),
            Err(AppError::UnprocessableEntity(_))
        ));
    }

    #[test]
    fn recurring_window_must_not_end_before_start() {
        let input: CreateRecurringTransferInput = serde_json::from_value(json!({
            "fund_id": 1,
            "recipient_user_id": 2,
            "amount": 120.0,
            "description": "Rent share",
            "frequency": "quarterly",
            "start_date": "2026-04-01",
            "end_date": "2026-03-01"
        }))
        .expect("deserializes");
        assert!(validate_input(&input).is_err());

        let mut fixed = input.clone();
        fixed.end_date = None;
        assert!(validate_input(&fixed).is_ok());

        fixed.frequency = "weekly".to_string();
        assert!(validate_input(&fixed).is_err());
    }

    #[test]
    fn allocations_validate_each_entry() {
        let input: SetAllocationsInput = serde_json::from_value(json!({
            "allocations": [
                {"fund_id": 1, "allocated_amount": 100.0},
                {"fund_id": 2, "allocated_amount": -5.0}
            ]
        }))
        .expect("deserializes");
        assert!(validate_input(&input).is_err());

        let empty: SetAllocationsInput =
            serde_json::from_value(json!({"allocations": []})).expect("deserializes");
        assert!(validate_input(&empty).is_err());
    }

    #[test]
    fn approve_immediately_is_not_persisted() {
        let input: CreateChargeInput = serde_json::from_value(json!({
            "fund_id": 1,
            "user_id": 9,
            "amount": 40.0,
            "description": "Lost key",
            "charge_date": "2026-05-02",
            "approve_immediately": true
        }))
        .expect("deserializes");
        let record = remove_nulls(serialize_to_map(&input));
        assert!(input.approve_immediately);
        assert!(!record.contains_key("approve_immediately"));
        assert_eq!(record.get("charge_date"), Some(&json!("2026-05-02")));
    }

    #[test]
    fn scope_query_pairs() {
        assert_eq!(requested_scope(None, None).ok(), Some(None));
        let group = requested_scope(None, Some(5)).ok().flatten().expect("group scope");
        assert_eq!(group.budget_type, BudgetType::Group);
        assert_eq!(group.group_id, Some(5));
        let circle = requested_scope(Some("circle"), None)
            .ok()
            .flatten()
            .expect("circle scope");
        assert_eq!(circle, BudgetScope::circle());
        assert!(requested_scope(Some("group"), None).is_err());
    }
}
