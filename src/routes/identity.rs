use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    access::get_user_accessible_group_ids, auth::require_access_profile, error::AppResult,
    state::AppState,
};

/// Caller's profile, the groups they can reach and their treasury scopes.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let profile = require_access_profile(&state, &headers).await?;
    let accessible_group_ids = get_user_accessible_group_ids(&state, profile.user_id).await?;
    let scopes = profile.treasury_scopes();

    Ok(Json(json!({
        "user_id": profile.user_id,
        "is_circle_treasurer": profile.is_circle_treasurer,
        "is_group_treasurer": profile.is_group_treasurer,
        "group_ids": profile.group_ids,
        "accessible_group_ids": accessible_group_ids,
        "treasury_scopes": {
            "circle": scopes.circle,
            "group_ids": scopes.group_ids,
        },
    })))
}
