use std::time::Duration;

use tracing::warn;

const DEFAULT_ADDR: &str = "0.0.0.0:9001";
const DEFAULT_DATABASE_PATH: &str = "murmur.db";
const DEFAULT_BLOB_DIR: &str = "blobs";
const DEFAULT_BLOB_BASE_URL: &str = "/blobs";
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;

/// Server settings, read from the environment (and `.env` when present)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    /// Shared token clients must present in `connect`; unset disables the check
    pub access_token: Option<String>,
    pub database_path: String,
    pub blob_dir: String,
    pub blob_base_url: String,
    pub auth_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            access_token: None,
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            blob_dir: DEFAULT_BLOB_DIR.to_string(),
            blob_base_url: DEFAULT_BLOB_BASE_URL.to_string(),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let auth_timeout = match lookup("MURMUR_AUTH_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!(value = %raw, "Ignoring invalid MURMUR_AUTH_TIMEOUT_SECS");
                    defaults.auth_timeout
                }
            },
            None => defaults.auth_timeout,
        };

        Self {
            addr: lookup("MURMUR_SERVER_ADDR").unwrap_or(defaults.addr),
            access_token: lookup("MURMUR_ACCESS_TOKEN").filter(|t| !t.is_empty()),
            database_path: lookup("MURMUR_DATABASE_PATH").unwrap_or(defaults.database_path),
            blob_dir: lookup("MURMUR_BLOB_DIR").unwrap_or(defaults.blob_dir),
            blob_base_url: lookup("MURMUR_BLOB_BASE_URL").unwrap_or(defaults.blob_base_url),
            auth_timeout,
        }
    }
}
