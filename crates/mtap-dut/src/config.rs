//! DUT server configuration

use std::time::Duration;

use mtap_core::settings::{parse_var, process_env, seconds_var, string_var};
use mtap_core::{ConfigError, FaultProfile};

use crate::{DeviceDefaults, FaultTuning};

/// Default listen host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: u16 = 9000;

/// DUT server configuration
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port; 0 picks an ephemeral port
    pub port: u16,
    /// Profile active at startup and after reset
    pub profile: FaultProfile,
    /// Fault injector seed
    pub seed: u64,
    pub tuning: FaultTuning,
    pub defaults: DeviceDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            profile: FaultProfile::Clean,
            seed: 0,
            tuning: FaultTuning::default(),
            defaults: DeviceDefaults::default(),
        }
    }
}

impl ServerConfig {
    /// Loopback on an ephemeral port
    pub fn local() -> Self {
        ServerConfig {
            port: 0,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_profile(mut self, profile: FaultProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tuning(mut self, tuning: FaultTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_defaults(mut self, defaults: DeviceDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// `host:port` as given
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    /// Load from `MTAP_*` keys; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = ServerConfig::default();

        let profile = match lookup("MTAP_FAULT_PROFILE") {
            Some(raw) if !raw.trim().is_empty() => {
                raw.parse::<FaultProfile>()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "MTAP_FAULT_PROFILE".into(),
                        value: raw.clone(),
                        reason: e.to_string(),
                    })?
            }
            _ => base.profile,
        };

        let timeout_delay = seconds_var(&lookup, "MTAP_TIMEOUT_DELAY_S", base.tuning.timeout_delay)?;
        let tuning = FaultTuning {
            timeout_delay,
            ..base.tuning
        };

        Ok(ServerConfig {
            host: string_var(&lookup, "MTAP_HOST", DEFAULT_HOST),
            port: parse_var(&lookup, "MTAP_DUT_PORT", base.port)?,
            profile,
            seed: parse_var(&lookup, "MTAP_SEED", base.seed)?,
            tuning,
            defaults: base.defaults,
        })
    }

    /// Stall length under timeout-heavy
    pub fn timeout_delay(&self) -> Duration {
        self.tuning.timeout_delay
    }
}
