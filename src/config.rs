// src/config.rs
use std::env;
use std::fmt;

use chrono::Duration;

pub const TOKEN_TTL_MIN_SECONDS: i64 = 60;
pub const TOKEN_TTL_MAX_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "development" | "dev" => Some(Environment::Development),
            "test" => Some(Environment::Test),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(var) => write!(f, "Missing required environment variable {}", var),
            Self::Invalid(var, why) => write!(f, "Invalid value for {}: {}", var, why),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub token_ttl: Duration,
    pub environment: Environment,
    pub log_level: String,
    pub cors_allowed_origins: Vec<String>,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    /// Policy when the KV store is unreachable. Defaults to fail-open; flip
    /// for multi-region or high-value deployments.
    pub rate_limit_fail_closed: bool,
    pub auto_migrate: bool,
    /// Process-wide hash pepper. Mandatory in production; non-production boots
    /// without one get a random per-boot pepper (live tokens do not survive a
    /// restart in that mode).
    pub token_pepper: Option<String>,
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::Invalid(var, format!("cannot parse {:?}", raw)))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", &required("PORT")?)?;
        let database_url = required("DATABASE_URL")?;
        let redis_host = required("REDIS_HOST")?;
        let redis_port = parse_var("REDIS_PORT", &required("REDIS_PORT")?)?;

        let ttl_seconds: i64 = parse_var("TOKEN_TTL_SECONDS", &required("TOKEN_TTL_SECONDS")?)?;
        if !(TOKEN_TTL_MIN_SECONDS..=TOKEN_TTL_MAX_SECONDS).contains(&ttl_seconds) {
            return Err(ConfigError::Invalid(
                "TOKEN_TTL_SECONDS",
                format!(
                    "{} is outside {}..={}",
                    ttl_seconds, TOKEN_TTL_MIN_SECONDS, TOKEN_TTL_MAX_SECONDS
                ),
            ));
        }

        let raw_env = required("APP_ENV")?;
        let environment = Environment::parse(&raw_env)
            .ok_or_else(|| ConfigError::Invalid("APP_ENV", raw_env.clone()))?;

        let token_pepper = optional("TOKEN_PEPPER");
        if environment.is_production() && token_pepper.is_none() {
            return Err(ConfigError::Missing("TOKEN_PEPPER"));
        }

        let cors_allowed_origins = optional("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let rate_limit_window_ms = match optional("RATE_LIMIT_WINDOW_MS") {
            Some(raw) => parse_var("RATE_LIMIT_WINDOW_MS", &raw)?,
            None => 60_000,
        };
        let rate_limit_max_requests = match optional("RATE_LIMIT_MAX_REQUESTS") {
            Some(raw) => parse_var("RATE_LIMIT_MAX_REQUESTS", &raw)?,
            None => 100,
        };

        Ok(Self {
            host: optional("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            database_url,
            redis_host,
            redis_port,
            redis_password: optional("REDIS_PASSWORD"),
            token_ttl: Duration::seconds(ttl_seconds),
            environment,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            cors_allowed_origins,
            rate_limit_window_ms,
            rate_limit_max_requests,
            rate_limit_fail_closed: optional("RATE_LIMIT_FAIL_CLOSED")
                .map(|raw| raw == "true" || raw == "1")
                .unwrap_or(false),
            auto_migrate: optional("AUTO_MIGRATE")
                .map(|raw| raw == "true" || raw == "1")
                .unwrap_or(true),
            token_pepper,
        })
    }

    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => {
                format!("redis://:{}@{}:{}/", password, self.redis_host, self.redis_port)
            }
            None => format!("redis://{}:{}/", self.redis_host, self.redis_port),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
