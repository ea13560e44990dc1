use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{
    access::{load_access_profile, AccessProfile},
    error::{AppError, AppResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Resolves the caller's user id from the bearer token (or the dev
/// `x-user-id` override outside production).
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<i64> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(raw) = header_str(headers, "x-user-id") {
            return parse_user_id(raw);
        }
    }

    let token = bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: missing bearer token.".to_string()))?;
    let secret = state.config.jwt_secret.as_deref().ok_or_else(|| {
        AppError::Dependency("Authentication is not configured. Set JWT_SECRET.".to_string())
    })?;

    let claims = decode_claims(token, secret, state.config.jwt_issuer.as_deref())?;
    parse_user_id(&claims.sub)
}

/// Authenticated caller together with their treasurer flags and groups.
pub async fn require_access_profile(
    state: &AppState,
    headers: &HeaderMap,
) -> AppResult<AccessProfile> {
    let user_id = require_user_id(state, headers).await?;
    load_access_profile(state, user_id).await
}

fn decode_claims(token: &str, secret: &str, issuer: Option<&str>) -> AppResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }

    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|error| {
            tracing::debug!(error = %error, "Rejected bearer token");
            AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_user_id(raw: &str) -> AppResult<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: invalid user id.".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        iss: Option<String>,
    }

    fn make_jwt(sub: &str, secret: &str, iss: Option<&str>) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            iss: iss.map(ToOwned::to_owned),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode test jwt")
    }

    #[test]
    fn extracts_bearer_token_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn decodes_valid_token_and_rejects_wrong_secret() {
        let token = make_jwt("42", "s3cret", None);
        let claims = decode_claims(&token, "s3cret", None).expect("valid token");
        assert_eq!(claims.sub, "42");
        assert!(decode_claims(&token, "other", None).is_err());
    }

    #[test]
    fn enforces_issuer_when_configured() {
        let token = make_jwt("7", "s3cret", Some("treasury"));
        assert!(decode_claims(&token, "s3cret", Some("treasury")).is_ok());
        assert!(decode_claims(&token, "s3cret", Some("someone-else")).is_err());
    }

    #[test]
    fn user_ids_must_be_positive_integers() {
        assert_eq!(parse_user_id(" 12 ").ok(), Some(12));
        assert!(parse_user_id("0").is_err());
        assert!(parse_user_id("abc").is_err());
    }
}
