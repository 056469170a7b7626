//! Typed configuration from environment variables.
//!
//! Loads once at startup. Everything has a development default; production
//! overrides come from the environment (systemd EnvironmentFile or a local
//! `.env` loaded with `dotenvy::dotenv().ok()` before calling `from_env`).

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path. `:memory:` is not accepted here; tests use
    /// `Db::in_memory()` directly.
    pub db_path: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("INTAKE_DB").unwrap_or_else(|_| "intake.db".to_string());
        if db_path.is_empty() {
            return Err(Error::Config("INTAKE_DB is set but empty".to_string()));
        }
        Ok(Self {
            db_path,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("INTAKE_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
