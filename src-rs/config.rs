use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::rate_limit::LimiterSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("{name} must be a duration such as \"30s\" or \"5m\", got {value:?}")]
    InvalidDuration { name: &'static str, value: String },
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("{name} must be at most 365 days, got {value:?}")]
    DurationTooLarge { name: &'static str, value: String },
}

const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
    pub allow_origins: Vec<String>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            trust_proxy: false,
            rate_limit: 60,
            rate_window: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(30),
            allow_origins: Vec::new(),
            tls_key_path: None,
            tls_cert_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rate_window = parse_duration(
            "RATE_LIMIT_WINDOW",
            lookup("RATE_LIMIT_WINDOW"),
            defaults.rate_window,
        )?;
        if rate_window.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "RATE_LIMIT_WINDOW",
            });
        }

        let trust_proxy = match lookup("TRUST_PROXY") {
            Some(value) => {
                let normalized = value.trim().to_lowercase();
                matches!(normalized.as_str(), "true" | "1" | "on" | "yes")
            }
            None => defaults.trust_proxy,
        };

        let allow_origins = lookup("ALLOW_ORIGINS")
            .map(|raw| {
                raw.trim_matches(|c: char| c == '[' || c == ']' || c == '"')
                    .split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            port: parse_u16(lookup("PORT"), defaults.port),
            trust_proxy,
            rate_limit: parse_usize("RATE_LIMIT", lookup("RATE_LIMIT"), defaults.rate_limit)?,
            rate_window,
            idle_ttl: parse_duration(
                "RATE_LIMIT_IDLE_TTL",
                lookup("RATE_LIMIT_IDLE_TTL"),
                defaults.idle_ttl,
            )?,
            sweep_interval: parse_duration(
                "RATE_LIMIT_SWEEP_INTERVAL",
                lookup("RATE_LIMIT_SWEEP_INTERVAL"),
                defaults.sweep_interval,
            )?,
            request_timeout: parse_duration(
                "REQUEST_TIMEOUT",
                lookup("REQUEST_TIMEOUT"),
                defaults.request_timeout,
            )?,
            allow_origins,
            tls_key_path: lookup("TLS_KEY_PATH").map(PathBuf::from),
            tls_cert_path: lookup("TLS_CERT_PATH").map(PathBuf::from),
        })
    }

    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            limit: self.rate_limit,
            window: self.rate_window,
            idle_ttl: self.idle_ttl,
        }
    }
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_usize(
    name: &'static str,
    value: Option<String>,
    fallback: usize,
) -> Result<usize, ConfigError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        None => Ok(fallback),
    }
}

fn parse_duration(
    name: &'static str,
    value: Option<String>,
    fallback: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = value else {
        return Ok(fallback);
    };

    let trimmed = raw.trim();
    let duration = match trimmed.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(trimmed)
            .map_err(|_| ConfigError::InvalidDuration { name, value: raw.clone() })?,
    };

    if duration > MAX_DURATION {
        return Err(ConfigError::DurationTooLarge { name, value: raw });
    }
    Ok(duration)
}
