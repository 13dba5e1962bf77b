use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::services::level_service::{ADVANCED_UNLOCK_POINTS, INTERMEDIATE_UNLOCK_POINTS};
use crate::services::scoring_service::MultiSelectRule;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the portal REST backend.
    pub api_base_url: Url,
    /// Bearer token of the learner, when authenticated.
    pub api_token: Option<String>,
    /// Directory of the durable local buffer.
    pub buffer_dir: PathBuf,
    pub session_ttl_seconds: u64,
    pub request_timeout_secs: u64,
    pub intermediate_unlock_points: u32,
    pub advanced_unlock_points: u32,
    pub multi_select_rule: MultiSelectRule,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let setting = |key: &str, var: &str| -> Option<String> {
            settings
                .get_string(key)
                .ok()
                .or_else(|| env::var(var).ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let raw_url = setting("api.base_url", "QUIZ_API_URL")
            .unwrap_or_else(|| "http://localhost:8000/api".to_string());
        let api_base_url = parse_base_url(&raw_url)?;

        let api_token = setting("api.token", "QUIZ_API_TOKEN");

        let buffer_dir = setting("buffer.dir", "QUIZ_BUFFER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_buffer_dir);

        let session_ttl_seconds = parse_or(
            setting("session.ttl_seconds", "SESSION_DURATION_SECONDS"),
            3600,
        )?;
        let request_timeout_secs =
            parse_or(setting("api.timeout_secs", "QUIZ_REQUEST_TIMEOUT_SECS"), 10)?;
        let intermediate_unlock_points = parse_or(
            setting("levels.intermediate_points", "QUIZ_INTERMEDIATE_POINTS"),
            INTERMEDIATE_UNLOCK_POINTS,
        )?;
        let advanced_unlock_points = parse_or(
            setting("levels.advanced_points", "QUIZ_ADVANCED_POINTS"),
            ADVANCED_UNLOCK_POINTS,
        )?;
        let multi_select_rule = parse_or(
            setting("scoring.multi_select_rule", "QUIZ_MULTI_SELECT_RULE"),
            MultiSelectRule::default(),
        )?;

        if session_ttl_seconds == 0 {
            return Err(config::ConfigError::Message("session ttl must be positive".to_string()));
        }

        Ok(Config {
            api_base_url,
            api_token,
            buffer_dir,
            session_ttl_seconds,
            request_timeout_secs,
            intermediate_unlock_points,
            advanced_unlock_points,
            multi_select_rule,
        })
    }

    /// Configuration pointing at `base_url` with defaults everywhere else.
    pub fn with_base_url(base_url: &str, buffer_dir: PathBuf) -> Result<Self, config::ConfigError> {
        Ok(Config {
            api_base_url: parse_base_url(base_url)?,
            api_token: None,
            buffer_dir,
            session_ttl_seconds: 3600,
            request_timeout_secs: 10,
            intermediate_unlock_points: INTERMEDIATE_UNLOCK_POINTS,
            advanced_unlock_points: ADVANCED_UNLOCK_POINTS,
            multi_select_rule: MultiSelectRule::default(),
        })
    }
}

/// Ensures a trailing slash so relative joins keep the base path.
fn parse_base_url(raw: &str) -> Result<Url, config::ConfigError> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    let url = Url::parse(&with_slash)
        .map_err(|e| config::ConfigError::Message(format!("invalid api base url {}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(config::ConfigError::Message(format!(
            "api base url must be http(s): {}",
            raw
        )));
    }
    Ok(url)
}

fn parse_or<T>(raw: Option<String>, default: T) -> Result<T, config::ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value
            .parse::<T>()
            .map_err(|e| config::ConfigError::Message(format!("invalid value {}: {}", value, e))),
        None => Ok(default),
    }
}

fn default_buffer_dir() -> PathBuf {
    env::temp_dir().join("quiz-core").join("sessions")
}
