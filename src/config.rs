use std::{env, str::FromStr, time::Duration};

use coview_core::{GraceExpiry, SyncConfig};
use thiserror::Error;

const DATABASE_URL: &str = "COVIEW_DATABASE_URL";
const VERBOSE: &str = "COVIEW_VERBOSE";
const DRIFT_THRESHOLD: &str = "COVIEW_DRIFT_THRESHOLD";
const DAMPING_MS: &str = "COVIEW_DAMPING_MS";
const GRACE_MS: &str = "COVIEW_GRACE_MS";
const GRACE_EXPIRY: &str = "COVIEW_GRACE_EXPIRY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got \"{value}\"")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Everything the binary reads from its environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sync: SyncConfig,
    /// Postgres is used when set, otherwise rooms only live in memory
    pub database_url: Option<String>,
    pub verbose: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut sync = SyncConfig::default();

        if let Some(value) = lookup(DRIFT_THRESHOLD) {
            let threshold: f64 = parse(DRIFT_THRESHOLD, "a number of seconds", &value)?;

            if !threshold.is_finite() || threshold < 0. {
                return Err(invalid(DRIFT_THRESHOLD, "a number of seconds", &value));
            }

            sync.drift_threshold = threshold;
        }

        if let Some(value) = lookup(DAMPING_MS) {
            sync.damping_window = millis(DAMPING_MS, &value)?;
        }

        if let Some(value) = lookup(GRACE_MS) {
            sync.join_grace_period = millis(GRACE_MS, &value)?;
        }

        if let Some(value) = lookup(GRACE_EXPIRY) {
            sync.grace_expiry = grace_expiry(&value)?;
        }

        Ok(Self {
            sync,
            database_url: lookup(DATABASE_URL).filter(|url| !url.trim().is_empty()),
            verbose: lookup(VERBOSE).is_some_and(|v| !matches!(v.as_str(), "" | "0" | "false")),
        })
    }
}

fn invalid(name: &'static str, expected: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        expected,
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(
    name: &'static str,
    expected: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(name, expected, value))
}

fn millis(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse(name, "a whole number of milliseconds", value).map(Duration::from_millis)
}

fn grace_expiry(value: &str) -> Result<GraceExpiry, ConfigError> {
    match value.trim() {
        "pause_room" => Ok(GraceExpiry::PauseRoom),
        "resume_room" => Ok(GraceExpiry::ResumeRoom),
        _ => Err(invalid(GRACE_EXPIRY, "pause_room or resume_room", value)),
    }
}
