//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Identity provider selection.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    /// GoTrue-compatible hosted provider.
    Remote {
        url: String,
        anon_key: SecretString,
    },
    /// In-process provider; confirmation links are logged, not mailed.
    InMemory { require_confirmation: bool },
}

/// Service configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub auth: AuthConfig,
    /// Public base URL; confirmation emails link back to `{site_url}/auth/callback`.
    pub site_url: String,
    /// Emails allowed into the admin area.
    pub admin_emails: Vec<String>,
    /// Where the callback sends the user when no registration is pending.
    pub default_next: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = match var("WAVR_BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "WAVR_BIND_ADDR".to_string(),
                message: format!("{e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let db_path = var("WAVR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/wavr.db"));

        let auth = match var("WAVR_AUTH_URL") {
            Some(url) => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::InvalidValue {
                        key: "WAVR_AUTH_URL".to_string(),
                        message: "must be an http(s) URL".to_string(),
                    });
                }
                let anon_key = var("WAVR_AUTH_ANON_KEY")
                    .ok_or_else(|| ConfigError::MissingEnvVar("WAVR_AUTH_ANON_KEY".to_string()))?;
                AuthConfig::Remote {
                    url,
                    anon_key: SecretString::from(anon_key),
                }
            }
            None => AuthConfig::InMemory {
                require_confirmation: var("WAVR_REQUIRE_EMAIL_CONFIRMATION")
                    .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                    .unwrap_or(true),
            },
        };

        let site_url = var("WAVR_SITE_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let admin_emails: Vec<String> = var("WAVR_ADMIN_EMAILS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let default_next = var("WAVR_DEFAULT_NEXT").unwrap_or_else(|| "/dashboard".to_string());
        if !default_next.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "WAVR_DEFAULT_NEXT".to_string(),
                message: "must be a path starting with '/'".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            db_path,
            auth,
            site_url,
            admin_emails,
            default_next,
        })
    }

    /// Where confirmation emails link back to.
    pub fn callback_url(&self) -> String {
        format!("{}/auth/callback", self.site_url)
    }
}
