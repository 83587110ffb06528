//! Runner settings from `MTAP_*` environment keys

use std::time::Duration;

use mtap_core::settings::{parse_var, process_env, seconds_var, string_var};
use mtap_core::ConfigError;

use crate::{ClientConfig, RunnerConfig, MAX_RETRIES};

pub const DEFAULT_BATCH_ID: &str = "BATCH-LOCAL";
pub const DEFAULT_STATION_ID: &str = "STATION-LOCAL";

/// Resolved runner settings
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerSettings {
    pub host: String,
    pub port: u16,
    /// `MTAP_TIMEOUT_S`
    pub timeout: Duration,
    /// `MTAP_RETRY_MAX`, for steps without their own budget
    pub retry_max: u32,
    /// `MTAP_WORKERS`
    pub workers: usize,
    /// `MTAP_BACKOFF_MS`
    pub backoff: Duration,
    pub batch_id: String,
    pub station_id: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        RunnerSettings {
            host: "127.0.0.1".into(),
            port: 9000,
            timeout: Duration::from_secs(2),
            retry_max: 2,
            workers: 2,
            backoff: Duration::from_millis(100),
            batch_id: DEFAULT_BATCH_ID.into(),
            station_id: DEFAULT_STATION_ID.into(),
        }
    }
}

impl RunnerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = RunnerSettings::default();

        let retry_max = parse_var(&lookup, "MTAP_RETRY_MAX", base.retry_max)?;
        if retry_max > MAX_RETRIES {
            return Err(ConfigError::InvalidValue {
                key: "MTAP_RETRY_MAX".into(),
                value: retry_max.to_string(),
                reason: format!("must be at most {}", MAX_RETRIES),
            });
        }

        let workers = parse_var(&lookup, "MTAP_WORKERS", base.workers)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MTAP_WORKERS".into(),
                value: "0".into(),
                reason: "need at least one worker".into(),
            });
        }

        let backoff_ms = parse_var(&lookup, "MTAP_BACKOFF_MS", base.backoff.as_millis() as u64)?;

        Ok(RunnerSettings {
            host: string_var(&lookup, "MTAP_HOST", &base.host),
            port: parse_var(&lookup, "MTAP_DUT_PORT", base.port)?,
            timeout: seconds_var(&lookup, "MTAP_TIMEOUT_S", base.timeout)?,
            retry_max,
            workers,
            backoff: Duration::from_millis(backoff_ms),
            batch_id: string_var(&lookup, "MTAP_BATCH_ID", &base.batch_id),
            station_id: string_var(&lookup, "MTAP_STATION_ID", &base.station_id),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<RunnerSettings> for RunnerConfig {
    fn from(s: RunnerSettings) -> Self {
        RunnerConfig {
            client: ClientConfig::new(s.addr()).with_timeout(s.timeout),
            workers: s.workers,
            default_retries: s.retry_max,
            default_backoff: s.backoff,
            batch_id: s.batch_id,
            station_id: s.station_id,
        }
    }
}
