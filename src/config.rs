use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Mobile-money gateway (Daraja) settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DarajaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Merchant business short code (paybill/till number).
    pub short_code: String,
    /// Shared passkey used to derive the STK push password.
    pub passkey: String,
    /// API base, e.g. "https://sandbox.safaricom.co.ke"
    #[serde(default = "default_daraja_base_url")]
    pub base_url: String,
    /// Publicly reachable base URL of this service; the callback route is
    /// appended to it.
    pub callback_base_url: String,
    /// Timeout for gateway HTTP calls (seconds).
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DarajaConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            short_code: "174379".to_string(),
            passkey: String::new(),
            base_url: default_daraja_base_url(),
            callback_base_url: "http://localhost:8080".to_string(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Third-party POS catalog (Loyverse) settings.
#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PosConfig {
    /// Loyverse API bearer token; sync is disabled when unset.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_pos_base_url")]
    pub base_url: String,
    /// Shared key callers must present on the manual sync endpoint.
    #[serde(default)]
    pub sync_api_key: Option<String>,
    /// Page size for catalog pagination.
    #[serde(default = "default_pos_page_size")]
    pub page_size: u32,
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment ("development", "test", "production")
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Daraja gateway settings
    #[serde(default)]
    #[validate]
    pub daraja: DarajaConfig,

    /// POS sync settings
    #[serde(default)]
    #[validate]
    pub pos: PosConfig,
}

impl AppConfig {
    /// Minimal constructor used by tests and tooling.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            daraja: DarajaConfig::default(),
            pos: PosConfig::default(),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Loads configuration from `config/default.toml`, an environment-specific
/// file, and `APP__*` environment overrides (e.g. `APP__DARAJA__PASSKEY`).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", environment.clone())?;

    let default_file = Path::new(CONFIG_DIR).join("default.toml");
    if default_file.exists() {
        builder = builder.add_source(File::from(default_file));
    }
    let env_file = Path::new(CONFIG_DIR).join(format!("{}.toml", environment));
    if env_file.exists() {
        builder = builder.add_source(File::from(env_file));
    }

    let cfg: AppConfig = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?
        .try_deserialize()?;

    cfg.validate()
        .map_err(|e| ConfigError::Message(format!("invalid configuration: {}", e)))?;

    Ok(cfg)
}

/// Initializes the tracing subscriber. Safe to call once at startup.
pub fn init_tracing(log_level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_gateway_timeout_secs() -> u64 {
    30
}
fn default_daraja_base_url() -> String {
    "https://sandbox.safaricom.co.ke".to_string()
}
fn default_pos_base_url() -> String {
    "https://api.loyverse.com/v1.0".to_string()
}
fn default_pos_page_size() -> u32 {
    250
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            8080,
            "test".to_string(),
        );
        assert_eq!(cfg.db_max_connections, 10);
        assert_eq!(cfg.event_channel_capacity, 1024);
        assert!(!cfg.is_development());
        assert_eq!(cfg.daraja.base_url, "https://sandbox.safaricom.co.ke");
        assert_eq!(cfg.pos.page_size, 250);
    }
}
