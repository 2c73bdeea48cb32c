//! Application configuration loaded from environment variables.

use event_bus::BusConfig;

/// Demo configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string; the in-memory store is
///   used when unset
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DEMO_MAX_RETRIES`: conflict retries per command (default: `5`)
/// - `EVENT_BUS_WORKERS`, `EVENT_BUS_QUEUE_CAPACITY`: see [`BusConfig`]
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub log_level: String,
    pub max_retries: u32,
    pub bus: BusConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            max_retries: std::env::var("DEMO_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            bus: BusConfig::from_env(),
        }
    }

    /// Whether events go to PostgreSQL instead of memory.
    pub fn uses_postgres(&self) -> bool {
        self.database_url.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            log_level: "info".to_string(),
            max_retries: 5,
            bus: BusConfig::default(),
        }
    }
}
