use serde::Serialize;
use sqlx::{PgExecutor, Postgres, QueryBuilder};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetType {
    Circle,
    Group,
}

impl BudgetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Circle => "circle",
            Self::Group => "group",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "circle" => Ok(Self::Circle),
            "group" => Ok(Self::Group),
            other => Err(AppError::BadRequest(format!(
                "Invalid budget_type '{other}'. Expected 'circle' or 'group'."
            ))),
        }
    }
}

/// Partition key for payment transfers: the circle, or one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BudgetScope {
    pub budget_type: BudgetType,
    pub group_id: Option<i64>,
}

impl BudgetScope {
    pub fn circle() -> Self {
        Self {
            budget_type: BudgetType::Circle,
            group_id: None,
        }
    }

    pub fn group(group_id: i64) -> Self {
        Self {
            budget_type: BudgetType::Group,
            group_id: Some(group_id),
        }
    }

    /// Scope of a budget row: `group_id IS NULL` means circle level.
    pub fn from_budget_group(group_id: Option<i64>) -> Self {
        match group_id {
            Some(id) => Self::group(id),
            None => Self::circle(),
        }
    }

    /// Scope as stored on a payment transfer row.
    pub fn from_parts(budget_type: &str, group_id: Option<i64>) -> AppResult<Self> {
        match (BudgetType::parse(budget_type)?, group_id) {
            (BudgetType::Circle, _) => Ok(Self::circle()),
            (BudgetType::Group, Some(id)) => Ok(Self::group(id)),
            (BudgetType::Group, None) => Err(AppError::BadRequest(
                "group_id is required when budget_type is 'group'.".to_string(),
            )),
        }
    }

    pub fn label(&self) -> String {
        match self.group_id {
            Some(id) => format!("group:{id}"),
            None => "circle".to_string(),
        }
    }
}

/// A fund together with the budget it draws from.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct FundRef {
    pub budget_id: i64,
    pub group_id: Option<i64>,
    pub budget_active: bool,
}

impl FundRef {
    pub fn scope(&self) -> BudgetScope {
        BudgetScope::from_budget_group(self.group_id)
    }
}

pub async fn fetch_fund_ref<'e, E>(executor: E, fund_id: i64) -> AppResult<FundRef>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, FundRef>(
        "SELECT f.budget_id, b.group_id, b.is_active AS budget_active
         FROM funds f
         JOIN budgets b ON b.id = f.budget_id
         WHERE f.id = $1",
    )
    .bind(fund_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Fund {fund_id} not found.")))
}

/// Whether the fund's owning budget is circle-level or group-level.
pub async fn resolve_fund_budget_scope<'e, E>(executor: E, fund_id: i64) -> AppResult<BudgetScope>
where
    E: PgExecutor<'e>,
{
    Ok(fetch_fund_ref(executor, fund_id).await?.scope())
}

pub async fn resolve_budget_scope<'e, E>(executor: E, budget_id: i64) -> AppResult<BudgetScope>
where
    E: PgExecutor<'e>,
{
    let group_id: Option<Option<i64>> =
        sqlx::query_scalar("SELECT group_id FROM budgets WHERE id = $1")
            .bind(budget_id)
            .fetch_optional(executor)
            .await?;

    group_id
        .map(BudgetScope::from_budget_group)
        .ok_or_else(|| AppError::NotFound(format!("Budget {budget_id} not found.")))
}

/// A set of scopes used to filter queries to what a caller may see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet {
    pub circle: bool,
    pub group_ids: Vec<i64>,
}

impl ScopeSet {
    pub fn single(scope: BudgetScope) -> Self {
        match scope.group_id {
            Some(id) => Self {
                circle: false,
                group_ids: vec![id],
            },
            None => Self {
                circle: true,
                group_ids: Vec::new(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.circle && self.group_ids.is_empty()
    }

    pub fn contains(&self, scope: &BudgetScope) -> bool {
        match scope.group_id {
            Some(id) => self.group_ids.contains(&id),
            None => self.circle,
        }
    }

    /// Appends ` AND <clause>` restricting `group_column` (a nullable group
    /// id, NULL meaning circle) to this set.
    pub fn push_group_clause(&self, builder: &mut QueryBuilder<'_, Postgres>, group_column: &str) {
        match (self.circle, self.group_ids.is_empty()) {
            (false, true) => {
                builder.push(" AND FALSE");
            }
            (true, true) => {
                builder.push(" AND ").push(group_column).push(" IS NULL");
            }
            (false, false) => {
                builder
                    .push(" AND ")
                    .push(group_column)
                    .push(" = ANY(")
                    .push_bind(self.group_ids.clone())
                    .push(")");
            }
            (true, false) => {
                builder
                    .push(" AND (")
                    .push(group_column)
                    .push(" IS NULL OR ")
                    .push(group_column)
                    .push(" = ANY(")
                    .push_bind(self.group_ids.clone())
                    .push("))");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_group_determines_scope() {
        assert_eq!(BudgetScope::from_budget_group(None), BudgetScope::circle());
        assert_eq!(BudgetScope::from_budget_group(Some(4)), BudgetScope::group(4));
        assert_eq!(BudgetScope::group(4).label(), "group:4");
    }

    #[test]
    fn transfer_parts_require_group_for_group_scope() {
        assert_eq!(
            BudgetScope::from_parts("circle", Some(9)).ok(),
            Some(BudgetScope::circle())
        );
        assert!(BudgetScope::from_parts("group", None).is_err());
        assert!(BudgetScope::from_parts("guild", Some(1)).is_err());
    }

    #[test]
    fn scope_set_membership() {
        let set = ScopeSet {
            circle: false,
            group_ids: vec![2, 3],
        };
        assert!(set.contains(&BudgetScope::group(3)));
        assert!(!set.contains(&BudgetScope::group(5)));
        assert!(!set.contains(&BudgetScope::circle()));
        assert!(ScopeSet::default().is_empty());
    }

    #[test]
    fn group_clause_renders_each_shape() {
        let render = |set: ScopeSet| {
            let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM budgets b WHERE 1=1");
            set.push_group_clause(&mut builder, "b.group_id");
            builder.sql().to_string()
        };

        assert!(render(ScopeSet::default()).ends_with(" AND FALSE"));
        assert!(render(ScopeSet::single(BudgetScope::circle())).ends_with("b.group_id IS NULL"));
        assert!(render(ScopeSet::single(BudgetScope::group(1)))
            .ends_with("b.group_id = ANY($1)"));
        assert!(render(ScopeSet {
            circle: true,
            group_ids: vec![1, 2],
        })
        .ends_with("(b.group_id IS NULL OR b.group_id = ANY($1))"));
    }

    #[sqlx::test(migrations = false, fixtures("treasury_schema", "treasury_seed"))]
    async fn fund_refs_come_from_the_owning_budget(pool: sqlx::PgPool) {
        let circle = fetch_fund_ref(&pool, 1).await.expect("circle fund");
        assert_eq!((circle.budget_id, circle.group_id), (1, None));
        assert!(circle.budget_active);

        sqlx::query("UPDATE budgets SET is_active = FALSE WHERE id = 2")
            .execute(&pool)
            .await
            .expect("deactivate budget");
        let garden = fetch_fund_ref(&pool, 2).await.expect("group fund");
        assert_eq!((garden.budget_id, garden.group_id), (2, Some(1)));
        assert!(!garden.budget_active);
        assert_eq!(
            resolve_fund_budget_scope(&pool, 2).await.ok(),
            Some(BudgetScope::group(1))
        );

        assert!(matches!(
            fetch_fund_ref(&pool, 99).await,
            Err(AppError::NotFound(_))
        ));
    }
}

