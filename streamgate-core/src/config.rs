use config::{Config as ConfigBuilder, ConfigError, Environment};
use serde::{Deserialize, Serialize};

use crate::routing::TransportRoute;

/// Application configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub egress: EgressConfig,
    pub mpd: MpdConfig,
    pub logging: LoggingConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("auth", &"<redacted>")
            .field("egress", &self.egress)
            .field("mpd", &self.mpd)
            .field("logging", &self.logging)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared API password. When unset, all endpoints are open.
    pub api_password: Option<String>,
}

impl AuthConfig {
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.api_password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Global proxy pool; one entry is picked uniformly at random when no
    /// transport route matches a destination.
    pub global_proxies: Vec<String>,
    /// Ordered substring-match route rules. First match wins.
    pub routes: Vec<TransportRoute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MpdMode {
    /// Server-side DASH→HLS conversion with optional ClearKey decryption.
    Legacy,
    /// Pass the MPD through with rewritten base URLs; no conversion.
    Ffmpeg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpdConfig {
    pub mode: MpdMode,
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            mode: MpdMode::Legacy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Output format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Structured settings use the `STREAMGATE_` prefix (e.g.
    /// `STREAMGATE_LOGGING__LEVEL`). The flat variables `HOST`, `PORT`,
    /// `API_PASSWORD`, `GLOBAL_PROXY`, `TRANSPORT_ROUTES` and `MPD_MODE`
    /// are also recognized and take precedence.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder()
            .add_source(Environment::with_prefix("STREAMGATE").separator("__"))
            .build()?;

        let mut config: Self = builder.try_deserialize()?;
        config.apply_flat_env();
        Ok(config)
    }

    fn apply_flat_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Invalid PORT value '{port}', keeping {}", self.server.port),
            }
        }
        if let Ok(password) = std::env::var("API_PASSWORD") {
            if !password.is_empty() {
                self.auth.api_password = Some(password);
            }
        }
        if let Ok(proxies) = std::env::var("GLOBAL_PROXY") {
            self.egress.global_proxies = parse_proxy_list(&proxies);
        }
        if let Ok(routes) = std::env::var("TRANSPORT_ROUTES") {
            self.egress.routes = parse_transport_routes(&routes);
        }
        if let Ok(mode) = std::env::var("MPD_MODE") {
            match mode.to_lowercase().as_str() {
                "legacy" => self.mpd.mode = MpdMode::Legacy,
                "ffmpeg" => self.mpd.mode = MpdMode::Ffmpeg,
                other => {
                    tracing::warn!("Invalid MPD_MODE '{other}', using 'legacy' as default");
                    self.mpd.mode = MpdMode::Legacy;
                }
            }
        }
    }
}

/// Parse a comma-separated proxy list (`GLOBAL_PROXY`).
#[must_use]
pub fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `TRANSPORT_ROUTES` in the format
/// `{URL=domain, PROXY=proxy, DISABLE_SSL=true}, {URL=domain2, PROXY=proxy2}`.
///
/// Malformed entries are skipped; an entry without `URL=` is ignored.
#[must_use]
pub fn parse_transport_routes(raw: &str) -> Vec<TransportRoute> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Vec::new();
    }

    let mut routes = Vec::new();
    for part in compact.split("},{") {
        let part = part.trim_matches(|c| c == '{' || c == '}');
        if part.is_empty() {
            continue;
        }

        let mut url_pattern = None;
        let mut proxy = None;
        let mut disable_tls_verify = false;

        for item in part.split(',') {
            if let Some(value) = item.strip_prefix("URL=") {
                url_pattern = Some(value.to_string());
            } else if let Some(value) = item.strip_prefix("PROXY=") {
                if !value.is_empty() {
                    proxy = Some(value.to_string());
                }
            } else if let Some(value) = item.strip_prefix("DISABLE_SSL=") {
                disable_tls_verify =
                    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
            }
        }

        if let Some(url_pattern) = url_pattern {
            routes.push(TransportRoute {
                url_pattern,
                proxy,
                disable_tls_verify,
            });
        }
    }

    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proxy_list_splits_and_trims() {
        let proxies = parse_proxy_list(" http://p1:8080 , socks5://p2:1080 ,");
        assert_eq!(proxies, vec!["http://p1:8080", "socks5://p2:1080"]);
        assert!(parse_proxy_list("").is_empty());
    }

    #[test]
    fn parse_transport_routes_full_form() {
        let routes = parse_transport_routes(
            "{URL=example.com, PROXY=socks5://p:1080, DISABLE_SSL=true}, {URL=cdn.org, PROXY=}",
        );
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].url_pattern, "example.com");
        assert_eq!(routes[0].proxy.as_deref(), Some("socks5://p:1080"));
        assert!(routes[0].disable_tls_verify);
        assert_eq!(routes[1].url_pattern, "cdn.org");
        assert!(routes[1].proxy.is_none());
        assert!(!routes[1].disable_tls_verify);
    }

    #[test]
    fn parse_transport_routes_skips_malformed() {
        assert!(parse_transport_routes("").is_empty());
        assert!(parse_transport_routes("{PROXY=socks5://p:1080}").is_empty());
        let routes = parse_transport_routes("{URL=a.com},{},{URL=b.com,DISABLE_SSL=yes}");
        assert_eq!(routes.len(), 2);
        assert!(routes[1].disable_tls_verify);
    }

    #[test]
    fn auth_enabled_only_with_nonempty_password() {
        assert!(!AuthConfig { api_password: None }.enabled());
        assert!(!AuthConfig {
            api_password: Some(String::new())
        }
        .enabled());
        assert!(AuthConfig {
            api_password: Some("secret".into())
        }
        .enabled());
    }
}
