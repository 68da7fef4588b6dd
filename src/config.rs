use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_API_BASE: &str = "http://localhost:8000/api";
const DEFAULT_APP_ORIGIN: &str = "http://localhost:3000";
const DEFAULT_HISTORY_MAX_ENTRIES: usize = 50;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_token: Option<SecretString>,
    pub http_timeout_secs: u64,
    pub app_origin: String,
    pub loopback_host: String,
    pub oauth_state_ttl_secs: u64,
    pub oauth_success_path: String,
    pub oauth_fallback_path: String,
    pub oauth_success_delay_ms: u64,
    pub oauth_error_delay_ms: u64,
    pub history_max_entries: usize,
    pub database_file_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    pub app_origin: String,
    pub loopback_host: String,
    pub oauth_state_ttl_secs: u64,
    pub oauth_success_path: String,
    pub oauth_fallback_path: String,
    pub history_max_entries: usize,
    pub database_file_name: String,
    pub has_api_token: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            api_base_url: env::var("CLOUD_LINK_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            api_token: env::var("CLOUD_LINK_API_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            http_timeout_secs: parse_u64("CLOUD_LINK_HTTP_TIMEOUT_SECS", 30).max(1),
            app_origin: env::var("APP_ORIGIN").unwrap_or_else(|_| DEFAULT_APP_ORIGIN.to_string()),
            loopback_host: env::var("LOOPBACK_CANONICAL_HOST")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "localhost".to_string()),
            oauth_state_ttl_secs: parse_u64("OAUTH_STATE_TTL_SECS", 600).max(1),
            oauth_success_path: env::var("OAUTH_SUCCESS_PATH")
                .unwrap_or_else(|_| "/dashboard".to_string()),
            oauth_fallback_path: env::var("OAUTH_FALLBACK_PATH")
                .unwrap_or_else(|_| "/settings".to_string()),
            oauth_success_delay_ms: parse_u64("OAUTH_SUCCESS_DELAY_MS", 2_000),
            oauth_error_delay_ms: parse_u64("OAUTH_ERROR_DELAY_MS", 3_000),
            history_max_entries: parse_usize("HISTORY_MAX_ENTRIES", DEFAULT_HISTORY_MAX_ENTRIES)
                .max(1),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "cloud-link-cache.db".to_string()),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            api_base_url: self.api_base_url.clone(),
            http_timeout_secs: self.http_timeout_secs,
            app_origin: self.app_origin.clone(),
            loopback_host: self.loopback_host.clone(),
            oauth_state_ttl_secs: self.oauth_state_ttl_secs,
            oauth_success_path: self.oauth_success_path.clone(),
            oauth_fallback_path: self.oauth_fallback_path.clone(),
            history_max_entries: self.history_max_entries,
            database_file_name: self.database_file_name.clone(),
            has_api_token: self.api_token.is_some(),
        }
    }
}

#[cfg(test)]
impl AppConfig {
    pub(crate) fn for_tests() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE.to_string(),
            api_token: None,
            http_timeout_secs: 5,
            app_origin: "http://127.0.0.1:3000".to_string(),
            loopback_host: "localhost".to_string(),
            oauth_state_ttl_secs: 600,
            oauth_success_path: "/dashboard".to_string(),
            oauth_fallback_path: "/settings".to_string(),
            oauth_success_delay_ms: 2_000,
            oauth_error_delay_ms: 3_000,
            history_max_entries: 3,
            database_file_name: "test-cache.db".to_string(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
