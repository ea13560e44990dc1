use axum::{
    extract::{Request, State},
    http::header::HOST,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, state::AppState};

/// Rejects requests whose `Host` is not in `TRUSTED_HOSTS`. A `*` entry
/// disables the check.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !is_trusted_host(&state.config.trusted_hosts, host) {
        tracing::warn!(host = %host, "Rejected request for untrusted host");
        return AppError::BadRequest("Invalid host header.".to_string()).into_response();
    }
    next.run(request).await
}

fn is_trusted_host(trusted: &[String], host: &str) -> bool {
    if trusted.iter().any(|entry| entry.trim() == "*") {
        return true;
    }
    let hostname = strip_port(host.trim()).to_ascii_lowercase();
    if hostname.is_empty() {
        return false;
    }
    trusted.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        match entry.strip_prefix("*.") {
            Some(suffix) => hostname.ends_with(&format!(".{suffix}")),
            None => entry == hostname,
        }
    })
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host
            .split_once(']')
            .map(|(address, _)| address.trim_start_matches('['))
            .unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|entry| entry.to_string()).collect()
    }

    #[test]
    fn wildcard_allows_everything() {
        assert!(is_trusted_host(&hosts(&["*"]), "anything.example"));
    }

    #[test]
    fn ports_are_ignored_and_case_folded() {
        let trusted = hosts(&["localhost", "api.circle.example"]);
        assert!(is_trusted_host(&trusted, "localhost:8000"));
        assert!(is_trusted_host(&trusted, "API.circle.example"));
        assert!(!is_trusted_host(&trusted, "evil.example"));
        assert!(!is_trusted_host(&trusted, ""));
    }

    #[test]
    fn subdomain_patterns_match_only_subdomains() {
        let trusted = hosts(&["*.circle.example"]);
        assert!(is_trusted_host(&trusted, "treasury.circle.example"));
        assert!(!is_trusted_host(&trusted, "circle.example"));
        assert_eq!(strip_port("[::1]:8000"), "::1");
    }
}
