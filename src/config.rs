//! Configuration module for PingMeDaddy.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path, or a `sqlite://` URL (default: "pingmedaddy.db")
    pub database_url: String,
    /// HTTP port for the API server (default: 6666)
    pub app_port: u16,
    /// Per-probe timeout in seconds (default: 2.0)
    pub ping_timeout: f64,
    /// Global cap on concurrently running probes (default: 50)
    pub ping_concurrency_limit: usize,
    pub admin_username: String,
    pub admin_password: String,
    /// HS256 signing key for access tokens
    pub auth_secret: String,
    /// Access-token lifetime in minutes (default: 1440)
    pub auth_token_minutes: i64,
    /// Allowed CORS origins; "*" allows any
    pub cors_origins: Vec<String>,
    /// Override for the traceroute binary; platform default when unset
    pub traceroute_binary: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "pingmedaddy.db".to_string(),
            app_port: 6666,
            ping_timeout: 2.0,
            ping_concurrency_limit: 50,
            admin_username: "admin".to_string(),
            admin_password: "changeme".to_string(),
            auth_secret: "super-secret-key".to_string(),
            auth_token_minutes: 24 * 60,
            cors_origins: vec!["http://localhost:3000".to_string()],
            traceroute_binary: None,
        }
    }
}

impl Settings {
    /// Load configuration from environment variables.
    ///
    /// Unset or malformed values fall back to the defaults above.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                cfg.database_url = url;
            }
        }

        if let Ok(port) = env::var("APP_PORT") {
            if let Ok(port) = port.parse() {
                cfg.app_port = port;
            }
        }

        if let Ok(timeout) = env::var("PING_TIMEOUT") {
            if let Ok(timeout) = timeout.parse::<f64>() {
                if timeout > 0.0 {
                    cfg.ping_timeout = timeout;
                }
            }
        }

        if let Ok(limit) = env::var("PING_CONCURRENCY_LIMIT") {
            if let Ok(limit) = limit.parse::<usize>() {
                if limit > 0 {
                    cfg.ping_concurrency_limit = limit;
                }
            }
        }

        if let Ok(username) = env::var("ADMIN_USERNAME") {
            cfg.admin_username = username;
        }
        if let Ok(password) = env::var("ADMIN_PASSWORD") {
            cfg.admin_password = password;
        }
        if let Ok(secret) = env::var("AUTH_SECRET") {
            cfg.auth_secret = secret;
        }

        if let Ok(minutes) = env::var("AUTH_TOKEN_MINUTES") {
            if let Ok(minutes) = minutes.parse::<i64>() {
                if minutes > 0 {
                    cfg.auth_token_minutes = minutes;
                }
            }
        }

        if let Ok(origins) = env::var("CORS_ORIGINS") {
            let parsed = split_origins(&origins);
            if !parsed.is_empty() {
                cfg.cors_origins = parsed;
            }
        }

        if let Ok(binary) = env::var("TRACEROUTE_BINARY") {
            let trimmed = binary.trim();
            if !trimmed.is_empty() {
                cfg.traceroute_binary = Some(trimmed.to_string());
            }
        }

        cfg
    }

    /// Filesystem path of the SQLite database, with any URL scheme stripped.
    pub fn db_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))
            .unwrap_or(&self.database_url)
    }

    pub fn ping_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.ping_timeout)
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let cfg = Settings::default();
        assert_eq!(cfg.app_port, 6666);
        assert_eq!(cfg.database_url, "pingmedaddy.db");
        assert_eq!(cfg.ping_concurrency_limit, 50);
        assert_eq!(cfg.ping_timeout_duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_db_path_strips_scheme() {
        let mut cfg = Settings::default();
        cfg.database_url = "sqlite:///var/lib/pingmedaddy.db".to_string();
        assert_eq!(cfg.db_path(), "/var/lib/pingmedaddy.db");

        cfg.database_url = "tracker.db".to_string();
        assert_eq!(cfg.db_path(), "tracker.db");
    }

    #[test]
    fn test_split_origins() {
        let origins = split_origins("http://a.example, http://b.example ,,");
        assert_eq!(origins, vec!["http://a.example", "http://b.example"]);
    }
}
