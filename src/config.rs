//! Runtime configuration loaded from environment variables (and `.env`).

use crate::error::{InsightError, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MIXPANEL_API_URL: &str = "https://mixpanel.com/api/query";
const DEFAULT_CATALOG_DB_PATH: &str = "data/schema.db";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct MixpanelConfig {
    pub username: String,
    pub secret: String,
    pub project_id: String,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub openai: OpenAiConfig,
    pub mixpanel: MixpanelConfig,
    pub catalog_path: PathBuf,
    pub port: u16,
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Call `dotenv::dotenv().ok()` beforehand to pick up a local `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. All missing required keys
    /// are reported together.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        let mut required = |key: &'static str| {
            get(key).unwrap_or_else(|| {
                missing.push(key);
                String::new()
            })
        };

        let api_key = required("OPENAI_API_KEY");
        let username = required("MIXPANEL_USERNAME");
        let secret = required("MIXPANEL_SECRET");
        let project_id = required("MIXPANEL_PROJECT_ID");

        if !missing.is_empty() {
            return Err(InsightError::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let port = match get("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| InsightError::Config(format!("PORT is not a valid port: {}", raw)))?,
            None => DEFAULT_PORT,
        };

        let timeout_secs = match get("REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw.parse().map_err(|_| {
                InsightError::Config(format!("REQUEST_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            openai: OpenAiConfig {
                api_key,
                model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                base_url: get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            },
            mixpanel: MixpanelConfig {
                username,
                secret,
                project_id,
                api_url: get("MIXPANEL_API_URL")
                    .unwrap_or_else(|| DEFAULT_MIXPANEL_API_URL.to_string()),
            },
            catalog_path: get("CATALOG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_DB_PATH)),
            port,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}
