// API password check
//
// When a password is configured, every core endpoint accepts it via the
// `api_password` query parameter, the `x-api-password` header, or (for the
// batch endpoint) the JSON body.

use std::collections::HashMap;

use axum::http::HeaderMap;
use streamgate_core::{Config, Error};

/// Verify the API password. A missing configured password disables auth.
pub fn check_password(
    config: &Config,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<(), Error> {
    check_password_with_body(config, query, headers, None)
}

/// Variant accepting a password carried in a request body (batch endpoint).
pub fn check_password_with_body(
    config: &Config,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body_password: Option<&str>,
) -> Result<(), Error> {
    let Some(expected) = config.auth.api_password.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(());
    };

    if query.get("api_password").map(String::as_str) == Some(expected) {
        return Ok(());
    }
    if headers
        .get("x-api-password")
        .and_then(|v| v.to_str().ok())
        == Some(expected)
    {
        return Ok(());
    }
    if body_password == Some(expected) {
        return Ok(());
    }

    tracing::warn!("Access denied: invalid or missing API password");
    Err(Error::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_core::config::AuthConfig;

    fn config_with_password(password: Option<&str>) -> Config {
        Config {
            auth: AuthConfig {
                api_password: password.map(str::to_string),
            },
            ..Config::default()
        }
    }

    #[test]
    fn no_configured_password_allows_everything() {
        let config = config_with_password(None);
        assert!(check_password(&config, &HashMap::new(), &HeaderMap::new()).is_ok());
    }

    #[test]
    fn query_header_and_body_are_accepted() {
        let config = config_with_password(Some("pw"));

        let mut query = HashMap::new();
        query.insert("api_password".to_string(), "pw".to_string());
        assert!(check_password(&config, &query, &HeaderMap::new()).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-password", "pw".parse().unwrap());
        assert!(check_password(&config, &HashMap::new(), &headers).is_ok());

        assert!(
            check_password_with_body(&config, &HashMap::new(), &HeaderMap::new(), Some("pw"))
                .is_ok()
        );
    }

    #[test]
    fn wrong_or_missing_password_is_rejected() {
        let config = config_with_password(Some("pw"));
        assert!(matches!(
            check_password(&config, &HashMap::new(), &HeaderMap::new()),
            Err(Error::Unauthorized)
        ));

        let mut query = HashMap::new();
        query.insert("api_password".to_string(), "nope".to_string());
        assert!(check_password(&config, &query, &HeaderMap::new()).is_err());
    }
}
