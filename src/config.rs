// ⚙️ Configuration - warehouse credentials and reconciler settings
// Loaded by the caller and injected; the core never reads the environment itself.

use crate::error::ConfigError;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_TABLE: &str = "influencer_campaign_metrics";
pub const DEFAULT_RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// WAREHOUSE CREDENTIALS
// ============================================================================

/// Opaque connection parameters. Only `database` is interpreted by the
/// bundled SQLite connector (as a file path); the rest are carried for
/// connectors that need them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct WarehouseConfig {
    pub account: String,
    pub user: String,
    pub secret: String,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
}

impl fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("account", &self.account)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .field("warehouse", &self.warehouse)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .finish()
    }
}

impl WarehouseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `METRICS_DATABASE` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).unwrap_or_default();
        let database = lookup("METRICS_DATABASE")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("METRICS_DATABASE"))?;

        Ok(WarehouseConfig {
            account: get("METRICS_ACCOUNT"),
            user: get("METRICS_USER"),
            secret: get("METRICS_SECRET"),
            warehouse: get("METRICS_WAREHOUSE"),
            database,
            schema: get("METRICS_SCHEMA"),
        })
    }
}

// ============================================================================
// RECONCILER SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Durable table name. Always a validated identifier.
    table: String,
    /// How far back `updated_rows_recent` looks.
    pub recent_window: Duration,
    /// How long a run waits for another run's write lock.
    pub busy_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            table: DEFAULT_TABLE.to_string(),
            recent_window: DEFAULT_RECENT_WINDOW,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl ReconcilerConfig {
    pub fn with_table(mut self, table: &str) -> Result<Self, ConfigError> {
        self.table = validate_table_name(table)?;
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ReconcilerConfig::default();

        if let Some(table) = lookup("METRICS_TABLE") {
            config = config.with_table(&table)?;
        }
        if let Some(secs) = lookup("METRICS_RECENT_WINDOW_SECS") {
            config.recent_window = Duration::from_secs(parse_u64("METRICS_RECENT_WINDOW_SECS", &secs)?);
        }
        if let Some(ms) = lookup("METRICS_BUSY_TIMEOUT_MS") {
            config.busy_timeout = Duration::from_millis(parse_u64("METRICS_BUSY_TIMEOUT_MS", &ms)?);
        }

        Ok(config)
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(name: &str) -> Result<String, ConfigError> {
    let name = name.trim();
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(name.to_lowercase())
    } else {
        Err(ConfigError::InvalidTableName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_warehouse_config_requires_database() {
        let err = WarehouseConfig::from_lookup(lookup_from(&[("METRICS_USER", "etl")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("METRICS_DATABASE"));

        let config = WarehouseConfig::from_lookup(lookup_from(&[
            ("METRICS_DATABASE", "/tmp/metrics.db"),
            ("METRICS_SECRET", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(config.database, "/tmp/metrics.db");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_reconciler_config_overrides() {
        let config = ReconcilerConfig::from_lookup(lookup_from(&[
            ("METRICS_TABLE", "Campaign_Metrics"),
            ("METRICS_RECENT_WINDOW_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.table(), "campaign_metrics");
        assert_eq!(config.recent_window, Duration::from_secs(60));
        assert_eq!(config.busy_timeout, DEFAULT_BUSY_TIMEOUT);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(matches!(
            validate_table_name("metrics; DROP TABLE x"),
            Err(ConfigError::InvalidTableName(_))
        ));
        assert!(validate_table_name("1metrics").is_err());
        assert!(validate_table_name("").is_err());

        let err = ReconcilerConfig::from_lookup(lookup_from(&[("METRICS_BUSY_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "METRICS_BUSY_TIMEOUT_MS", .. }));
    }
}
