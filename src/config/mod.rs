use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub consistency: ConsistencyConfig,
    pub monitor: MonitorConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub max_connections: u32,
    pub connection_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Offending rows kept per violation category
    pub sample_limit: usize,
    pub check_interval_secs: u64,
    pub scheduled_check_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub slow_query_threshold_ms: u64,
    pub alert_threshold_ms: u64,
    /// Length of the rolling latency window per operation
    pub latency_window: usize,
    pub summary_interval_secs: u64,
    pub cache_hit_rate_warning: f64,
    pub cache_hit_rate_critical: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub backup_table_prefix: String,
    pub truncate_closure_on_rollback: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        Self::for_environment(environment).with_env_overrides()
    }

    /// Profile defaults without any environment overrides
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }

        // Consistency overrides
        if let Ok(v) = env::var("CONSISTENCY_SAMPLE_LIMIT") {
            self.consistency.sample_limit = v.parse().unwrap_or(self.consistency.sample_limit);
        }
        if let Ok(v) = env::var("CONSISTENCY_CHECK_INTERVAL_SECS") {
            self.consistency.check_interval_secs = v.parse().unwrap_or(self.consistency.check_interval_secs);
        }
        if let Ok(v) = env::var("CONSISTENCY_SCHEDULED_CHECK_ENABLED") {
            self.consistency.scheduled_check_enabled =
                v.parse().unwrap_or(self.consistency.scheduled_check_enabled);
        }

        // Monitor overrides
        if let Ok(v) = env::var("MONITOR_SLOW_QUERY_THRESHOLD_MS") {
            self.monitor.slow_query_threshold_ms = v.parse().unwrap_or(self.monitor.slow_query_threshold_ms);
        }
        if let Ok(v) = env::var("MONITOR_ALERT_THRESHOLD_MS") {
            self.monitor.alert_threshold_ms = v.parse().unwrap_or(self.monitor.alert_threshold_ms);
        }
        if let Ok(v) = env::var("MONITOR_LATENCY_WINDOW") {
            self.monitor.latency_window = v.parse().unwrap_or(self.monitor.latency_window);
        }
        if let Ok(v) = env::var("MONITOR_SUMMARY_INTERVAL_SECS") {
            self.monitor.summary_interval_secs = v.parse().unwrap_or(self.monitor.summary_interval_secs);
        }
        if let Ok(v) = env::var("MONITOR_CACHE_HIT_RATE_WARNING") {
            self.monitor.cache_hit_rate_warning = v.parse().unwrap_or(self.monitor.cache_hit_rate_warning);
        }
        if let Ok(v) = env::var("MONITOR_CACHE_HIT_RATE_CRITICAL") {
            self.monitor.cache_hit_rate_critical = v.parse().unwrap_or(self.monitor.cache_hit_rate_critical);
        }

        // Migration overrides
        if let Ok(v) = env::var("MIGRATION_BACKUP_TABLE_PREFIX") {
            self.migration.backup_table_prefix = v;
        }
        if let Ok(v) = env::var("MIGRATION_TRUNCATE_CLOSURE_ON_ROLLBACK") {
            self.migration.truncate_closure_on_rollback =
                v.parse().unwrap_or(self.migration.truncate_closure_on_rollback);
        }

        self
    }

    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
                connection_timeout: 30,
            },
            consistency: ConsistencyConfig {
                sample_limit: 50,
                check_interval_secs: 24 * 60 * 60,
                scheduled_check_enabled: true,
            },
            monitor: MonitorConfig {
                slow_query_threshold_ms: 100,
                alert_threshold_ms: 500,
                latency_window: 100,
                summary_interval_secs: 60 * 60,
                cache_hit_rate_warning: 0.8,
                cache_hit_rate_critical: 0.5,
            },
            migration: MigrationConfig {
                backup_table_prefix: "org_units_backup".to_string(),
                truncate_closure_on_rollback: true,
            },
        }
    }

    pub fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig {
                url: None,
                max_connections: 20,
                connection_timeout: 10,
            },
            consistency: ConsistencyConfig {
                sample_limit: 20,
                check_interval_secs: 24 * 60 * 60,
                scheduled_check_enabled: true,
            },
            monitor: MonitorConfig {
                slow_query_threshold_ms: 100,
                alert_threshold_ms: 500,
                latency_window: 500,
                summary_interval_secs: 60 * 60,
                cache_hit_rate_warning: 0.8,
                cache_hit_rate_critical: 0.5,
            },
            migration: MigrationConfig {
                backup_table_prefix: "org_units_backup".to_string(),
                truncate_closure_on_rollback: true,
            },
        }
    }

    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                url: None,
                max_connections: 50,
                connection_timeout: 5,
            },
            consistency: ConsistencyConfig {
                sample_limit: 20,
                check_interval_secs: 24 * 60 * 60,
                scheduled_check_enabled: true,
            },
            monitor: MonitorConfig {
                slow_query_threshold_ms: 200,
                alert_threshold_ms: 1000,
                latency_window: 1000,
                summary_interval_secs: 60 * 60,
                cache_hit_rate_warning: 0.9,
                cache_hit_rate_critical: 0.6,
            },
            migration: MigrationConfig {
                backup_table_prefix: "org_units_backup".to_string(),
                // Keep the closure table around for forensics after a rollback
                truncate_closure_on_rollback: false,
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}
