use thiserror::Error;

/// Configuration errors are fatal at startup (spec §6/§7): the process
/// that hits one exits non-zero before doing any work.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidVar {
        var: String,
        value: String,
        reason: String,
    },
}

pub fn require_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

pub fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse::<T>().map_err(|_| ConfigError::InvalidVar {
            var: name.to_string(),
            value: v,
            reason: "failed to parse".to_string(),
        }),
        Err(_) => Ok(default),
    }
}
