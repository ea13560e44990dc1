use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderName, Method,
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;

pub fn build_cors_layer(config: &AppConfig) -> CorsLayer {
    let mut headers = vec![
        ACCEPT,
        AUTHORIZATION,
        CONTENT_TYPE,
        HeaderName::from_static("x-request-id"),
    ];
    if config.auth_dev_overrides_enabled() {
        headers.push(HeaderName::from_static("x-user-id"));
    }

    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(headers)
        .expose_headers([HeaderName::from_static("x-request-id")]);

    if allows_any_origin(&config.cors_origins) {
        return layer.allow_origin(Any).allow_credentials(false);
    }
    let origins = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.trim().parse().ok())
        .collect::<Vec<_>>();
    layer.allow_origin(origins).allow_credentials(true)
}

fn allows_any_origin(origins: &[String]) -> bool {
    origins.iter().any(|origin| origin.trim() == "*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_origin_means_any() {
        assert!(allows_any_origin(&["https://a.example".to_string(), " * ".to_string()]));
        assert!(!allows_any_origin(&["https://a.example".to_string()]));
    }
}
