use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use super::server_bind_address;

pub const DEFAULT_MASTER_DATABASE_URL: &str = "sqlite://master.db";
pub const DEFAULT_TENANT_DB_PREFIX: &str = "tenant";
pub const DEFAULT_TENANT_DB_SUFFIX: &str = "db";
pub const DEFAULT_TENANT_DB_URL_PATTERN: &str = "sqlite://{database}.db";
/// Upper bound for both directory TTLs: one week.
pub const MAX_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Inputs of the tenant data-store naming template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantTemplateConfig {
    pub prefix: String,
    pub suffix: String,
    pub connection_pattern: String,
}

/// Tenant directory cache and registry lookup tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySettings {
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub retry_attempts: u32,
    pub lookup_timeout: Duration,
    pub capacity: usize,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub master_database_url: String,
    pub tenant_template: TenantTemplateConfig,
    pub directory: DirectorySettings,
    pub base_domain: Option<String>,
    pub jwt_secret: Option<String>,
    pub admin_token: Option<String>,
    pub sweep_interval: Duration,
    pub sweep_concurrency: usize,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let tenant_template = TenantTemplateConfig {
            prefix: string_or("APP_TENANT_DB_PREFIX", DEFAULT_TENANT_DB_PREFIX),
            suffix: string_or("APP_TENANT_DB_SUFFIX", DEFAULT_TENANT_DB_SUFFIX),
            connection_pattern: string_or(
                "APP_TENANT_DB_URL_PATTERN",
                DEFAULT_TENANT_DB_URL_PATTERN,
            ),
        };

        let ttl = Duration::from_secs(ttl_secs("APP_TENANT_CACHE_TTL_SECS", 300)?);
        let negative_ttl = Duration::from_secs(ttl_secs("APP_TENANT_NEGATIVE_TTL_SECS", 30)?);
        if negative_ttl > ttl {
            return Err(ConfigError::Invalid {
                name: "APP_TENANT_NEGATIVE_TTL_SECS",
                reason: "must not exceed APP_TENANT_CACHE_TTL_SECS".to_string(),
            });
        }
        let retry_attempts = parse_or("APP_REGISTRY_RETRY_ATTEMPTS", 3u32)?;
        if retry_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "APP_REGISTRY_RETRY_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        let lookup_timeout = Duration::from_millis(parse_or("APP_REGISTRY_TIMEOUT_MS", 2000u64)?);
        let capacity = parse_or("APP_TENANT_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY)?;
        if capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "APP_TENANT_CACHE_CAPACITY",
                reason: "must be at least 1".to_string(),
            });
        }

        let sweep_concurrency = parse_or("APP_TENANT_SWEEP_CONCURRENCY", 4usize)?;
        if sweep_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "APP_TENANT_SWEEP_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            environment,
            master_database_url: string_or("APP_MASTER_DATABASE_URL", DEFAULT_MASTER_DATABASE_URL),
            tenant_template,
            directory: DirectorySettings {
                ttl,
                negative_ttl,
                retry_attempts,
                lookup_timeout,
                capacity,
            },
            base_domain: optional("APP_BASE_DOMAIN"),
            jwt_secret: optional("APP_JWT_SECRET"),
            admin_token: optional("APP_ADMIN_TOKEN"),
            sweep_interval: Duration::from_secs(parse_or(
                "APP_TENANT_SWEEP_INTERVAL_SECS",
                300u64,
            )?),
            sweep_concurrency,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn string_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn ttl_secs(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let secs = parse_or(name, default)?;
    if secs > MAX_CACHE_TTL_SECS {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("{secs} exceeds the maximum of {MAX_CACHE_TTL_SECS} seconds"),
        });
    }
    Ok(secs)
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: format!("{raw:?}: {err}"),
        }),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("APP_ENV must be one of 'development', 'production', or 'test' (got {0})")]
    InvalidEnvironment(String),
    #[error("invalid APP_BIND_ADDR value: {0}")]
    BindAddress(std::net::AddrParseError),
    #[error("invalid {name} value: {reason}")]
    Invalid { name: &'static str, reason: String },
}
