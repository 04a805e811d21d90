use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the telemetry service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Picture storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Database configuration. Statuses are kept in memory when absent.
    pub database: Option<DatabaseConfig>,
    /// Access token verification
    pub auth: AuthConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Picture storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory that holds the date-partitioned picture folders
    #[serde(default = "default_uploads_root")]
    pub uploads_root: PathBuf,
    /// Public path prefix the uploads root is served under
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Access token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer
    pub jwt_secret: String,
}

// Default value functions
fn default_service_name() -> String {
    "telemetry-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_uploads_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_url_prefix() -> String {
    "/uploads".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/telemetry").required(false))
            .add_source(config::File::with_name("/etc/fleet/telemetry").required(false))
            // TELEMETRY__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("TELEMETRY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_root: default_uploads_root(),
            url_prefix: default_url_prefix(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let storage = StorageConfig::default();
        assert_eq!(storage.uploads_root, PathBuf::from("uploads"));
        assert_eq!(storage.url_prefix, "/uploads");
        assert_eq!(ApiConfig::default().port, 3000);
    }

    #[test]
    fn test_minimal_config_deserializes() {
        let json = r#"{ "auth": { "jwt_secret": "secret" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert!(config.database.is_none());
        assert_eq!(config.service.name, "telemetry-service");
        assert_eq!(config.auth.jwt_secret, "secret");
    }

    #[test]
    fn test_database_defaults() {
        let json = r#"{
            "auth": { "jwt_secret": "secret" },
            "database": { "url": "postgres://localhost/fleet" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let database = config.database.unwrap();

        assert_eq!(database.max_connections, 10);
        assert_eq!(database.connect_timeout(), Duration::from_secs(30));
        assert!(database.run_migrations);
    }
}
