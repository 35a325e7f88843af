use crate::reconcile::PollPolicy;
use secrecy::Secret;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub registry: RegistryConfig,
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub iothub_connection_string: Option<Secret<String>>,
    pub dps_connection_string: Option<Secret<String>>,
    pub request_timeout_ms: u64,
    pub page_size: u32,
    pub sas_ttl_secs: i64,
    /// Host name reported by the in-memory backend.
    pub memory_host_name: String,
    /// Stale query reads before an in-memory write shows up in queries.
    pub memory_index_lag: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    Azure,
}

impl FromStr for RegistryBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(RegistryBackend::Memory),
            "azure" => Ok(RegistryBackend::Azure),
            _ => Err(format!("Invalid registry backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PollConfig {
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub deadline_ms: u64,
    pub transient_retries: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        Self {
            delay_ms: policy.initial_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
            deadline_ms: policy.deadline.as_millis() as u64,
            transient_retries: policy.transient_retries,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(self.delay_ms), self.max_attempts)
            .with_backoff(
                self.backoff_multiplier,
                Duration::from_millis(self.max_delay_ms),
            )
            .with_deadline(Duration::from_millis(self.deadline_ms))
            .with_transient_retries(self.transient_retries)
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ConsoleConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";
        let poll_defaults = PollConfig::default();

        let backend: RegistryBackend = get_env("REGISTRY_BACKEND", Some("memory"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        // Credentials are only mandatory when talking to Azure.
        let needs_credentials = backend == RegistryBackend::Azure;

        let config = ConsoleConfig {
            common: common_config,
            registry: RegistryConfig {
                iothub_connection_string: optional_secret(
                    "IOTHUB_CONNECTION_STRING",
                    needs_credentials,
                )?,
                dps_connection_string: optional_secret("DPS_CONNECTION_STRING", needs_credentials)?,
                backend,
                request_timeout_ms: parse_env("REGISTRY_REQUEST_TIMEOUT_MS", 10_000)?,
                page_size: parse_env("REGISTRY_PAGE_SIZE", 100)?,
                sas_ttl_secs: parse_env("SAS_TOKEN_TTL_SECS", 3600)?,
                memory_host_name: get_env(
                    "MEMORY_HOST_NAME",
                    Some("console-hub.azure-devices.net"),
                    false,
                )?,
                memory_index_lag: parse_env("MEMORY_INDEX_LAG", 2)?,
            },
            poll: PollConfig {
                delay_ms: parse_env("POLL_DELAY_MS", poll_defaults.delay_ms)?,
                backoff_multiplier: parse_env(
                    "POLL_BACKOFF_MULTIPLIER",
                    poll_defaults.backoff_multiplier,
                )?,
                max_delay_ms: parse_env("POLL_MAX_DELAY_MS", poll_defaults.max_delay_ms)?,
                max_attempts: parse_env("POLL_MAX_ATTEMPTS", poll_defaults.max_attempts)?,
                deadline_ms: parse_env("POLL_DEADLINE_MS", poll_defaults.deadline_ms)?,
                transient_retries: parse_env(
                    "POLL_TRANSIENT_RETRIES",
                    poll_defaults.transient_retries,
                )?,
            },
        };

        if is_prod && config.registry.backend == RegistryBackend::Memory {
            tracing::warn!("Running with the in-memory registry in production");
        }
        Ok(config)
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, val, e))
        }),
        Err(_) => Ok(default),
    }
}

fn optional_secret(key: &str, required: bool) -> Result<Option<Secret<String>>, AppError> {
    match env::var(key) {
        Ok(val) if !val.is_empty() => Ok(Some(Secret::new(val))),
        _ if required => Err(AppError::ConfigError(anyhow::anyhow!(
            "{} is required for the azure registry backend",
            key
        ))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("Memory".parse::<RegistryBackend>(), Ok(RegistryBackend::Memory));
        assert_eq!("azure".parse::<RegistryBackend>(), Ok(RegistryBackend::Azure));
        assert!("cosmos".parse::<RegistryBackend>().is_err());
    }

    #[test]
    fn test_default_poll_config_matches_default_policy() {
        assert_eq!(PollConfig::default().policy(), PollPolicy::default());
    }

    #[test]
    fn test_poll_config_builds_backoff_policy() {
        let config = PollConfig {
            delay_ms: 50,
            backoff_multiplier: 2.0,
            max_delay_ms: 400,
            max_attempts: 10,
            deadline_ms: 5_000,
            transient_retries: 2,
        };
        let policy = config.policy();

        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(3), Duration::from_millis(200));
        assert_eq!(policy.delay_after(6), Duration::from_millis(400));
        assert_eq!(policy.deadline, Duration::from_secs(5));
        assert_eq!(policy.transient_retries, 2);
    }
}
