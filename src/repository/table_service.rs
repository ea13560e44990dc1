use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, PgExecutor, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "budgets",
    "charges",
    "funds",
    "group_memberships",
    "groups",
    "incomes",
    "payment_transfers",
    "recurring_transfer_applications",
    "recurring_transfers",
    "reimbursements",
    "users",
];

/// Lists rows as JSON. Filter keys are column names, optionally suffixed
/// with `__gt`, `__gte`, `__lt`, `__lte`, `__ilike` or `__is_null`; array
/// values become `= ANY(...)`.
pub async fn list_rows<'e, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError>
where
    E: PgExecutor<'e>,
{
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "id"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    query
        .push(", t.id LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query
        .build()
        .fetch_all(executor)
        .await?;
    Ok(read_rows(rows))
}

pub async fn get_row<'e, E>(executor: E, table: &str, row_id: i64) -> Result<Value, AppError>
where
    E: PgExecutor<'e>,
{
    let table_name = validate_table(table)?;
    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query
        .push(table_name)
        .push(" t WHERE t.id = ")
        .push_bind(row_id);

    let row = query
        .build()
        .fetch_optional(executor)
        .await?;

    read_row(row).ok_or_else(|| not_found(table_name, row_id))
}

pub async fn create_row<'e, E>(
    executor: E,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError>
where
    E: PgExecutor<'e>,
{
    let table_name = validate_table(table)?;
    let mut query = build_insert(table_name, payload)?;

    let row = query
        .build()
        .fetch_optional(executor)
        .await?;

    read_row(row)
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row<'e, E>(
    executor: E,
    table: &str,
    row_id: i64,
    payload: &Map<String, Value>,
) -> Result<Value, AppError>
where
    E: PgExecutor<'e>,
{
    let table_name = validate_table(table)?;
    let mut query = build_update(table_name, row_id, payload)?;

    let row = query
        .build()
        .fetch_optional(executor)
        .await?;

    read_row(row).ok_or_else(|| not_found(table_name, row_id))
}

/// Deletes a row and returns it as it was.
pub async fn delete_row<'e, E>(executor: E, table: &str, row_id: i64) -> Result<Value, AppError>
where
    E: PgExecutor<'e>,
{
    let table_name = validate_table(table)?;
    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query
        .push(table_name)
        .push(" t WHERE t.id = ")
        .push_bind(row_id)
        .push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await?;

    read_row(row).ok_or_else(|| not_found(table_name, row_id))
}

pub async fn count_rows<'e, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError>
where
    E: PgExecutor<'e>,
{
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    let row = query
        .build()
        .fetch_one(executor)
        .await?;
    Ok(row.try_get::<i64, _>("total")?)
}

fn sorted_columns(payload: &Map<String, Value>) -> Result<Vec<&str>, AppError> {
    let mut keys = payload
        .keys()
        .map(|key| validate_identifier(key))
        .collect::<Result<Vec<_>, _>>()?;
    keys.sort_unstable();
    Ok(keys)
}

// jsonb_populate_record lets PostgreSQL coerce JSON values to the column
// types (numeric, date, boolean) from the table definition.
fn build_insert<'a>(
    table_name: &'a str,
    payload: &'a Map<String, Value>,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let columns = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for column in &columns {
            separated.push(*column);
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for column in &columns {
            separated.push("r.");
            separated.push_unseparated(*column);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    Ok(query)
}

fn build_update<'a>(
    table_name: &'a str,
    row_id: i64,
    payload: &'a Map<String, Value>,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let columns = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for column in &columns {
            separated.push(*column);
            separated.push_unseparated(" = r.");
            separated.push_unseparated(*column);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r WHERE t.id = ")
        .push_bind(row_id)
        .push(" RETURNING row_to_json(t) AS row");
    Ok(query)
}

fn read_row(row: Option<PgRow>) -> Option<Value> {
    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn not_found(table_name: &str, row_id: i64) -> AppError {
    AppError::NotFound(format!("{table_name} record {row_id} not found."))
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    let well_formed = trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) && !trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit());
    if !well_formed {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, PartialEq)]
enum ScalarFilter {
    Text(String),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    ILike,
    IsNull,
}

impl FilterOperator {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => " = ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
            Self::ILike => " ILIKE ",
            Self::IsNull => " IS NULL",
        }
    }
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let Some((column, suffix)) = filter_key.rsplit_once("__") else {
        return Ok((validate_identifier(filter_key)?, FilterOperator::Eq));
    };
    let operator = match suffix {
        "gt" => FilterOperator::Gt,
        "gte" => FilterOperator::Gte,
        "lt" => FilterOperator::Lt,
        "lte" => FilterOperator::Lte,
        "ilike" => FilterOperator::ILike,
        "is_null" => FilterOperator::IsNull,
        "in" => FilterOperator::Eq,
        _ => return Ok((validate_identifier(filter_key)?, FilterOperator::Eq)),
    };
    Ok((validate_identifier(column)?, operator))
}

fn push_filter_clause(
    query: &mut QueryBuilder<'_, Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if operator == FilterOperator::IsNull {
        let should_be_null = value.as_bool().unwrap_or(true);
        query.push(" AND t.").push(column);
        query.push(if should_be_null {
            " IS NULL"
        } else {
            " IS NOT NULL"
        });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if operator != FilterOperator::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            query.push(" AND t.").push(column);
            if let Some(ids) = items.iter().map(Value::as_i64).collect::<Option<Vec<_>>>() {
                query.push(" = ANY(").push_bind(ids).push(")");
            } else {
                let texts = items.iter().map(render_scalar).collect::<Vec<_>>();
                query.push("::text = ANY(").push_bind(texts).push(")");
            }
            Ok(())
        }
        _ => {
            query.push(" AND t.").push(column);
            if operator == FilterOperator::ILike {
                query.push("::text ILIKE ").push_bind(render_scalar(value));
                return Ok(());
            }
            match infer_scalar_filter(column, value) {
                ScalarFilter::Text(text) => {
                    query.push("::text").push(operator.sql()).push_bind(text);
                }
                ScalarFilter::Bool(flag) => {
                    query.push(operator.sql()).push_bind(flag);
                }
                ScalarFilter::I64(number) => {
                    query.push(operator.sql()).push_bind(number);
                }
                ScalarFilter::F64(number) => {
                    query.push(operator.sql()).push_bind(number);
                }
                ScalarFilter::Date(date) => {
                    query.push(operator.sql()).push_bind(date);
                }
            }
            Ok(())
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn infer_scalar_filter(column: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(ScalarFilter::I64)
            .or_else(|| number.as_f64().map(ScalarFilter::F64))
            .unwrap_or_else(|| ScalarFilter::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if column.ends_with("_date") {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            if column == "id" || column.ends_with("_id") {
                if let Ok(parsed) = trimmed.parse::<i64>() {
                    return ScalarFilter::I64(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        other => ScalarFilter::Text(render_scalar(other)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let payload = payload(json!({
            "name": "Food",
            "budget_id": 4,
            "allocated_amount": 250.0,
        }));
        let query = build_insert("funds", &payload).expect("valid insert");
        let sql = query.sql();
        assert!(
            sql.starts_with("INSERT INTO funds (allocated_amount, budget_id, name) SELECT r.allocated_amount, r.budget_id, r.name"),
            "unexpected SQL: {sql}"
        );
        assert!(sql.contains("jsonb_populate_record(NULL::funds, $1)"));
    }

    #[test]
    fn update_sql_targets_numeric_id() {
        let payload = payload(json!({"status": "paused", "amount": 80.0}));
        let query = build_update("recurring_transfers", 12, &payload).expect("valid update");
        let sql = query.sql();
        assert!(
            sql.contains("SET amount = r.amount, status = r.status"),
            "unexpected SQL: {sql}"
        );
        assert!(sql.contains("WHERE t.id = $2"));
    }

    #[test]
    fn empty_payloads_are_rejected() {
        let empty = Map::new();
        assert!(matches!(
            build_update("funds", 1, &empty),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            build_insert("funds", &empty),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn unknown_tables_and_bad_identifiers_are_refused() {
        assert!(matches!(validate_table("sessions"), Err(AppError::Forbidden(_))));
        assert!(validate_identifier("amount; drop table funds").is_err());
        assert!(validate_identifier("1st").is_err());
        assert_eq!(validate_identifier(" fund_id ").ok(), Some("fund_id"));
    }

    #[test]
    fn filter_suffixes_map_to_operators() {
        assert_eq!(
            parse_filter_key("income_date__gte").ok(),
            Some(("income_date", FilterOperator::Gte))
        );
        assert_eq!(
            parse_filter_key("group_id__is_null").ok(),
            Some(("group_id", FilterOperator::IsNull))
        );
        assert_eq!(
            parse_filter_key("fund_id").ok(),
            Some(("fund_id", FilterOperator::Eq))
        );
    }

    #[test]
    fn filter_clauses_bind_typed_values() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM incomes t WHERE 1=1");
        push_filter_clause(&mut query, "budget_id", &json!("7")).expect("filter");
        push_filter_clause(&mut query, "income_date__lt", &json!("2026-02-01")).expect("filter");
        push_filter_clause(&mut query, "status", &json!(["approved", "paid"])).expect("filter");
        push_filter_clause(&mut query, "fund_id__is_null", &json!(true)).expect("filter");
        push_filter_clause(&mut query, "notes", &Value::Null).expect("filter");

        let sql = query.sql();
        assert!(sql.contains("t.budget_id = $1"), "unexpected SQL: {sql}");
        assert!(sql.contains("t.income_date < $2"), "unexpected SQL: {sql}");
        assert!(sql.contains("t.status::text = ANY($3)"), "unexpected SQL: {sql}");
        assert!(sql.contains("t.fund_id IS NULL"), "unexpected SQL: {sql}");
        assert!(!sql.contains("notes"));
    }

    #[test]
    fn id_like_strings_become_integers() {
        assert_eq!(infer_scalar_filter("fund_id", &json!("42")), ScalarFilter::I64(42));
        assert_eq!(
            infer_scalar_filter("charge_date", &json!("2026-03-01")),
            ScalarFilter::Date(NaiveDate::from_ymd_opt(2026, 3, 1).expect("date"))
        );
        assert_eq!(
            infer_scalar_filter("description", &json!("42")),
            ScalarFilter::Text("42".to_string())
        );
    }
}
