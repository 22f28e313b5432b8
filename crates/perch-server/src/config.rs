//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `PERCH_BIND_ADDR`: Listen address. Default: `0.0.0.0:3000`
//! - `PERCH_BASE_URL`: Public base URL, also the local issuer.
//!   Default: `http://localhost:3000`
//! - `PERCH_DB_PATH`: SQLite database path. Default: in-memory
//! - `PERCH_FEDERATED_AUTH`: Enable federated sign-in. Default: `true`
//! - `PERCH_TRUSTED_ISSUER`: Issuer seeded as trusted at startup
//! - `PERCH_TRUSTED_CLIENT_ID`: Pre-shared client id for that issuer
//! - `PERCH_TRUSTED_CLIENT_SECRET`: Pre-shared client secret (optional)
//! - `PERCH_HTTP_TIMEOUT_SECS`: Outbound HTTP timeout. Default: `10`

use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Pre-shared credentials for the trusted issuer, all-or-nothing.
#[derive(Debug, Clone)]
pub struct TrustedIssuerConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Public base URL; doubles as the issuer for local sign-ins.
    pub base_url: String,
    /// SQLite path, or in-memory when unset.
    pub db_path: Option<String>,
    /// Whether federated (issuer-based) sign-in is enabled.
    pub federated_auth: bool,
    /// Issuer seeded with pre-shared credentials before startup.
    pub trusted_issuer: Option<TrustedIssuerConfig>,
    /// Timeout applied to all outbound HTTP requests.
    pub http_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".parse().expect("valid default address"),
            base_url: "http://localhost:3000".to_string(),
            db_path: None,
            federated_auth: true,
            trusted_issuer: None,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("PERCH_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_addr);

        let base_url = std::env::var("PERCH_BASE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);

        let db_path = std::env::var("PERCH_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let federated_auth = std::env::var("PERCH_FEDERATED_AUTH")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        let trusted_issuer = match (
            std::env::var("PERCH_TRUSTED_ISSUER").ok(),
            std::env::var("PERCH_TRUSTED_CLIENT_ID").ok(),
        ) {
            (Some(issuer), Some(client_id)) => Some(TrustedIssuerConfig {
                issuer,
                client_id,
                client_secret: std::env::var("PERCH_TRUSTED_CLIENT_SECRET").ok(),
            }),
            _ => None,
        };

        let http_timeout = std::env::var("PERCH_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        Self {
            bind_addr,
            base_url,
            db_path,
            federated_auth,
            trusted_issuer,
            http_timeout,
        }
    }

    /// The issuer URL this server answers for locally.
    pub fn issuer(&self) -> &str {
        &self.base_url
    }

    /// Base of the provider-callback endpoints; per-issuer redirect
    /// URIs hang off this path.
    pub fn rp_redirect_base(&self) -> String {
        format!("{}/rp", self.base_url)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Listening on {}", self.bind_addr);
        info!("Base URL: {}", self.base_url);
        match &self.db_path {
            Some(path) => info!("Database: {}", path),
            None => info!("Database: in-memory"),
        }
        if self.federated_auth {
            info!("Federated sign-in: enabled");
        } else {
            info!("Federated sign-in: disabled");
        }
        if let Some(trusted) = &self.trusted_issuer {
            info!("Trusted issuer: {}", trusted.issuer);
        }
    }

    /// Create a test configuration.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            base_url: "https://perch.example".to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.base_url, "http://localhost:3000");
        assert!(config.federated_auth);
        assert!(config.db_path.is_none());
        assert!(config.trusted_issuer.is_none());
    }

    #[test]
    fn test_rp_redirect_base() {
        let config = ServerConfig::test_config();
        assert_eq!(config.rp_redirect_base(), "https://perch.example/rp");
        assert_eq!(config.issuer(), "https://perch.example");
    }
}
