use serde::Serialize;
use sqlx::{PgExecutor, PgPool};

use crate::{
    error::{AppError, AppResult},
    services::budget_scope::{fetch_fund_ref, BudgetScope, BudgetType, FundRef, ScopeSet},
    state::AppState,
};

/// Role flags and group memberships of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessProfile {
    pub user_id: i64,
    pub is_circle_treasurer: bool,
    pub is_group_treasurer: bool,
    pub group_ids: Vec<i64>,
}

impl AccessProfile {
    pub fn is_treasurer(&self) -> bool {
        self.is_circle_treasurer || self.is_group_treasurer
    }

    /// Scopes whose payment transfers and treasury actions this user may touch.
    pub fn treasury_scopes(&self) -> ScopeSet {
        ScopeSet {
            circle: self.is_circle_treasurer,
            group_ids: if self.is_group_treasurer {
                self.group_ids.clone()
            } else {
                Vec::new()
            },
        }
    }

    /// Resolves the scope filter for a request: an explicit scope must pass
    /// the access gate, otherwise every treasury scope of the caller is used.
    pub fn requested_scopes(&self, requested: Option<BudgetScope>) -> AppResult<ScopeSet> {
        match requested {
            Some(scope) => {
                require_budget_type_access(self, &scope)?;
                Ok(ScopeSet::single(scope))
            }
            None => {
                if !self.is_treasurer() {
                    return Err(AppError::Forbidden(
                        "Forbidden: treasurer role required.".to_string(),
                    ));
                }
                Ok(self.treasury_scopes())
            }
        }
    }
}

/// Circle scope needs the circle treasurer flag; a group scope needs the
/// group treasurer flag and membership of that group.
pub fn can_access_budget_type(profile: &AccessProfile, scope: &BudgetScope) -> bool {
    match scope.budget_type {
        BudgetType::Circle => profile.is_circle_treasurer,
        BudgetType::Group => {
            profile.is_group_treasurer
                && scope
                    .group_id
                    .is_some_and(|group_id| profile.group_ids.contains(&group_id))
        }
    }
}

pub fn require_budget_type_access(profile: &AccessProfile, scope: &BudgetScope) -> AppResult<()> {
    if can_access_budget_type(profile, scope) {
        return Ok(());
    }
    Err(AppError::Forbidden(format!(
        "Forbidden: no treasurer access to {} budgets.",
        scope.label()
    )))
}

/// Read visibility of a budget: circle treasurers see everything, everyone
/// sees circle budgets, group budgets are visible to group members.
pub fn can_view_budget_group(profile: &AccessProfile, group_id: Option<i64>) -> bool {
    if profile.is_circle_treasurer {
        return true;
    }
    match group_id {
        None => true,
        Some(id) => profile.group_ids.contains(&id),
    }
}

/// Read-visibility filter for budget-derived rows; `None` means unrestricted.
pub fn visible_scopes(profile: &AccessProfile) -> Option<ScopeSet> {
    if profile.is_circle_treasurer {
        return None;
    }
    Some(ScopeSet {
        circle: true,
        group_ids: profile.group_ids.clone(),
    })
}

pub async fn load_access_profile(state: &AppState, user_id: i64) -> AppResult<AccessProfile> {
    if let Some(profile) = state.access_cache.get(&user_id).await {
        return Ok(profile);
    }

    let pool = state.db_pool()?;
    let profile = fetch_access_profile(pool, user_id).await?;
    state.access_cache.insert(user_id, profile.clone()).await;
    Ok(profile)
}

async fn fetch_access_profile(pool: &PgPool, user_id: i64) -> AppResult<AccessProfile> {
    let row = sqlx::query_as::<_, (bool, bool, Vec<i64>)>(
        "SELECT u.is_circle_treasurer,
                u.is_group_treasurer,
                COALESCE(
                  array_agg(gm.group_id ORDER BY gm.group_id)
                    FILTER (WHERE gm.group_id IS NOT NULL),
                  '{}'
                )::bigint[] AS group_ids
         FROM users u
         LEFT JOIN group_memberships gm ON gm.user_id = u.id
         WHERE u.id = $1
         GROUP BY u.id",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let Some((is_circle_treasurer, is_group_treasurer, group_ids)) = row else {
        return Err(AppError::Unauthorized(
            "Unauthorized: unknown user.".to_string(),
        ));
    };

    Ok(AccessProfile {
        user_id,
        is_circle_treasurer,
        is_group_treasurer,
        group_ids,
    })
}

pub async fn is_circle_treasurer(state: &AppState, user_id: i64) -> AppResult<bool> {
    Ok(load_access_profile(state, user_id)
        .await?
        .is_circle_treasurer)
}

/// Every group for circle treasurers, memberships for everyone else.
pub async fn get_user_accessible_group_ids(state: &AppState, user_id: i64) -> AppResult<Vec<i64>> {
    if !is_circle_treasurer(state, user_id).await? {
        return Ok(load_access_profile(state, user_id).await?.group_ids);
    }

    let pool = state.db_pool()?;
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM groups ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

pub async fn can_access_budget(
    pool: &PgPool,
    profile: &AccessProfile,
    budget_id: i64,
) -> AppResult<bool> {
    let group_id: Option<Option<i64>> =
        sqlx::query_scalar("SELECT group_id FROM budgets WHERE id = $1")
            .bind(budget_id)
            .fetch_optional(pool)
            .await?;
    Ok(group_id.is_some_and(|group_id| can_view_budget_group(profile, group_id)))
}

pub async fn can_access_fund(
    pool: &PgPool,
    profile: &AccessProfile,
    fund_id: i64,
) -> AppResult<bool> {
    match fetch_fund_ref(pool, fund_id).await {
        Ok(fund) => Ok(can_view_budget_group(profile, fund.group_id)),
        Err(AppError::NotFound(_)) => Ok(false),
        Err(error) => Err(error),
    }
}

/// 404 for an unknown fund, 403 when the caller cannot see its budget.
pub async fn validate_fund_access(
    pool: &PgPool,
    profile: &AccessProfile,
    fund_id: i64,
) -> AppResult<FundRef> {
    let fund = fetch_fund_ref(pool, fund_id).await?;
    if !can_view_budget_group(profile, fund.group_id) {
        return Err(AppError::Forbidden(
            "Forbidden: no access to this fund.".to_string(),
        ));
    }
    Ok(fund)
}

/// The submitter may modify their own reimbursement only while it is pending.
pub async fn validate_reimbursement_ownership<'e, E>(
    executor: E,
    profile: &AccessProfile,
    reimbursement_id: i64,
) -> AppResult<()>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, (i64, String)>(
        "SELECT user_id, status FROM reimbursements WHERE id = $1",
    )
    .bind(reimbursement_id)
    .fetch_optional(executor)
    .await?;

    let Some((owner_id, status)) = row else {
        return Err(AppError::NotFound(format!(
            "Reimbursement {reimbursement_id} not found."
        )));
    };
    if owner_id != profile.user_id {
        return Err(AppError::Forbidden(
            "Forbidden: reimbursement belongs to another user.".to_string(),
        ));
    }
    if status != "pending" {
        return Err(AppError::Conflict(format!(
            "Reimbursement is {status} and can no longer be modified by its submitter."
        )));
    }
    Ok(())
}
