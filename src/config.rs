// 7.0 config.rs: exchange settings in one place. engine knobs, depth history, log filter.
// 7.1 env presets plus EXCHANGE_* overrides for the simulation binary.

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;

pub const ENV_ENVIRONMENT: &str = "EXCHANGE_ENV";
pub const ENV_RECENT_TRADES: &str = "EXCHANGE_RECENT_TRADES";
pub const ENV_DEPTH_HISTORY: &str = "EXCHANGE_DEPTH_HISTORY";
pub const ENV_LOG: &str = "EXCHANGE_LOG";

// Complete configuration for one exchange process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub engine: EngineConfig,
    // Latest trades each MarketDepth keeps for snapshots
    pub depth_trade_history: usize,
    // tracing EnvFilter directive, RUST_LOG wins when set
    pub log_filter: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            depth_trade_history: 10,
            log_filter: "info".to_string(),
        }
    }
}

impl ExchangeConfig {
    pub fn development() -> Self {
        Self {
            log_filter: "debug".to_string(),
            ..Self::default()
        }
    }

    // quiet logs, small histories
    pub fn test() -> Self {
        Self {
            engine: EngineConfig {
                recent_trade_count: 5,
                ..EngineConfig::default()
            },
            depth_trade_history: 5,
            log_filter: "warn".to_string(),
        }
    }

    pub fn production() -> Self {
        Self {
            depth_trade_history: 20,
            log_filter: "info".to_string(),
            ..Self::default()
        }
    }

    /// Preset picked by `EXCHANGE_ENV`, then individual `EXCHANGE_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup(ENV_ENVIRONMENT) {
            Some(value) => value.parse::<Environment>()?,
            None => Environment::Development,
        };
        let mut config = environment.config();

        if let Some(value) = lookup(ENV_RECENT_TRADES) {
            config.engine.recent_trade_count = parse_count(ENV_RECENT_TRADES, &value)?;
        }
        if let Some(value) = lookup(ENV_DEPTH_HISTORY) {
            config.depth_trade_history = parse_count(ENV_DEPTH_HISTORY, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            config.log_filter = value;
        }

        config.validate()?;
        Ok(config)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.submission_buffer == 0 {
            return Err(ConfigError::InvalidEngine {
                reason: "submission buffer must hold at least one order".to_string(),
            });
        }

        if self.depth_trade_history == 0 {
            return Err(ConfigError::InvalidDepth {
                reason: "depth must keep at least one trade".to_string(),
            });
        }

        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::InvalidLogging {
                reason: "log filter is empty".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_count(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid engine config: {reason}")]
    InvalidEngine { reason: String },
    #[error("Invalid depth config: {reason}")]
    InvalidDepth { reason: String },
    #[error("Invalid logging config: {reason}")]
    InvalidLogging { reason: String },
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Unknown environment {0:?}")]
    UnknownEnvironment(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn config(&self) -> ExchangeConfig {
        match self {
            Environment::Development => ExchangeConfig::development(),
            Environment::Test => ExchangeConfig::test(),
            Environment::Production => ExchangeConfig::production(),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::UnknownEnvironment(s.to_string())),
        }
    }
}
