//! Configuration module for recurring-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecurringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub run_on_startup: bool,
    pub concurrency: usize,
}

impl GenerationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 86_400,
            run_on_startup: true,
            concurrency: 4,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

impl RecurringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let defaults = GenerationConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "recurring-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS").unwrap_or(2),
            },
            generation: GenerationConfig {
                enabled: env_parse("GENERATION_ENABLED").unwrap_or(defaults.enabled),
                interval_secs: env_parse("GENERATION_INTERVAL_SECS")
                    .unwrap_or(defaults.interval_secs),
                run_on_startup: env_parse("GENERATION_RUN_ON_STARTUP")
                    .unwrap_or(defaults.run_on_startup),
                concurrency: env_parse::<usize>("GENERATION_CONCURRENCY")
                    .unwrap_or(defaults.concurrency)
                    .max(1),
            },
        })
    }
}
