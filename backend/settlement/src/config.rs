//! Application configuration loaded from environment variables.

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite location: a `sqlite:` URL or a bare file path
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Shared secret the authenticating gateway sends with every request
    pub gateway_token: String,
    /// Upper bound on pooled SQLite connections
    pub db_max_connections: u32,
    /// How long a writer waits for the SQLite lock before failing
    pub db_busy_timeout_ms: u64,
    /// How often (in seconds) to reconcile ledger invariants; 0 disables
    pub audit_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let gateway_token = env_var("GATEWAY_TOKEN").map_err(|_| {
            EngineError::Config("GATEWAY_TOKEN environment variable is required".to_string())
        })?;
        if gateway_token.trim().is_empty() {
            return Err(EngineError::Config("GATEWAY_TOKEN must not be empty".to_string()));
        }

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./settlement.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3002".to_string())
                .parse()
                .map_err(|_| EngineError::Config("Invalid API_PORT".to_string()))?,
            gateway_token,
            db_max_connections: env_var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| EngineError::Config("Invalid DB_MAX_CONNECTIONS".to_string()))?,
            db_busy_timeout_ms: env_var("DB_BUSY_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .map_err(|_| EngineError::Config("Invalid DB_BUSY_TIMEOUT_MS".to_string()))?,
            audit_interval_secs: env_var("AUDIT_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| EngineError::Config("Invalid AUDIT_INTERVAL_SECS".to_string()))?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}
