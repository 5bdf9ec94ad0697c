use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::enrichment::EnrichmentSettings;
use crate::errors::AppError;
use crate::retry::RetryPolicy;

/// Process configuration loaded from the environment.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>, // Audit log is disabled without it
    pub platform_name: String,
    pub platform_base_url: String,
    pub platform_api_key: Option<String>,
    pub dispatch_concurrency: usize,
    pub dispatch_max_attempts: u32,
    pub dispatch_base_delay_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub request_timeout_secs: u64,
    pub cache_dir: PathBuf,
    pub cache_ttl_secs: u64,
    pub enrichment_batch_size: usize,
    pub enrichment_batch_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            port: parse_or("PORT", 3000u16)
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })
                .transpose()?,
            platform_name: std::env::var("PLATFORM_NAME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "platform".to_string()),
            platform_base_url: std::env::var("PLATFORM_BASE_URL")
                .map_err(|_| anyhow::anyhow!("PLATFORM_BASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("PLATFORM_BASE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("PLATFORM_BASE_URL must start with http:// or https://");
                    }
                    Ok(url.trim_end_matches('/').to_string())
                })?,
            platform_api_key: std::env::var("PLATFORM_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            dispatch_concurrency: parse_or("DISPATCH_CONCURRENCY", 5usize)?,
            dispatch_max_attempts: parse_or("DISPATCH_MAX_ATTEMPTS", 3u32)?,
            dispatch_base_delay_ms: parse_or("DISPATCH_BASE_DELAY_MS", 1000u64)?,
            rate_limit_cooldown_ms: parse_or("RATE_LIMIT_COOLDOWN_MS", 2000u64)?,
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", 30u64)?,
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".cache/session")),
            cache_ttl_secs: parse_or("CACHE_TTL_SECS", 300u64)?,
            enrichment_batch_size: parse_or("ENRICHMENT_BATCH_SIZE", 3usize)?,
            enrichment_batch_delay_ms: parse_or("ENRICHMENT_BATCH_DELAY_MS", 250u64)?,
        };

        if config.dispatch_concurrency == 0 {
            anyhow::bail!("DISPATCH_CONCURRENCY must be at least 1");
        }
        if config.enrichment_batch_size == 0 {
            anyhow::bail!("ENRICHMENT_BATCH_SIZE must be at least 1");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Platform: {} at {}", config.platform_name, config.platform_base_url);
        if config.platform_api_key.is_none() {
            tracing::warn!("PLATFORM_API_KEY is not set; dispatch calls will be rejected");
        }
        if config.database_url.is_none() {
            tracing::info!("DATABASE_URL not set; dispatch outcomes will only be logged");
        }
        tracing::debug!("Cache directory: {}", config.cache_dir.display());
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    /// The configured push destination.
    pub fn destination(&self) -> DestinationConfig {
        DestinationConfig {
            name: self.platform_name.clone(),
            base_url: self.platform_base_url.clone(),
            api_key: self.platform_api_key.clone(),
            concurrency: self.dispatch_concurrency,
            max_attempts: self.dispatch_max_attempts,
            base_delay_ms: self.dispatch_base_delay_ms,
            rate_limit_cooldown_ms: self.rate_limit_cooldown_ms,
            request_timeout_secs: self.request_timeout_secs,
        }
    }

    pub fn enrichment_settings(&self) -> EnrichmentSettings {
        EnrichmentSettings {
            batch_size: self.enrichment_batch_size,
            batch_delay: Duration::from_millis(self.enrichment_batch_delay_ms),
            retry: RetryPolicy::new(2, Duration::from_millis(500))
                .with_rate_limit_cooldown(Duration::from_millis(self.rate_limit_cooldown_ms)),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("platform_name", &self.platform_name)
            .field("platform_base_url", &self.platform_base_url)
            .field("platform_api_key", &self.platform_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("dispatch_concurrency", &self.dispatch_concurrency)
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

/// Settings for one push destination.
#[derive(Clone, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub request_timeout_secs: u64,
}

impl DestinationConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key,
            concurrency: 5,
            max_attempts: 3,
            base_delay_ms: 1000,
            rate_limit_cooldown_ms: 2000,
            request_timeout_secs: 30,
        }
    }

    /// Checked before any dispatch attempt; a failure here means zero network calls.
    pub fn validate(&self) -> Result<(), AppError> {
        self.api_key()?;
        if self.name.trim().is_empty() {
            return Err(AppError::Configuration(
                "destination name cannot be empty".to_string(),
            ));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(AppError::Configuration(format!(
                "base URL for destination '{}' must start with http:// or https://",
                self.name
            )));
        }
        if self.concurrency == 0 {
            return Err(AppError::Configuration(format!(
                "concurrency for destination '{}' must be at least 1",
                self.name
            )));
        }
        if self.max_attempts == 0 {
            return Err(AppError::Configuration(format!(
                "max attempts for destination '{}' must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<&str, AppError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                AppError::Configuration(format!(
                    "missing API key for destination '{}'",
                    self.name
                ))
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_rate_limit_cooldown(Duration::from_millis(self.rate_limit_cooldown_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

fn parse_or<T>(var: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number", var)),
        _ => Ok(default),
    }
}
