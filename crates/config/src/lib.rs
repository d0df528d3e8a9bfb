//! Typed, validated runtime configuration (§6 "Configuration"). Discovers
//! `.env*` files by walking up from the working directory, loads them
//! non-overriding, then validates every environment variable the system
//! reads into one `AppConfig`. Any failure here is fatal at startup (§7
//! "Config/validation error").

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("environment variable {name} has an invalid integer value {value:?}")]
    InvalidInt { name: &'static str, value: String },
    #[error("environment variable {name} has an invalid boolean value {value:?}")]
    InvalidBool { name: &'static str, value: String },
    #[error("environment variable {name} has an invalid float value {value:?}")]
    InvalidFloat { name: &'static str, value: String },
    #[error("{name} must be an http(s) URL, got {value:?}")]
    InvalidUrl { name: &'static str, value: String },
    #[error("{name} is not valid JSON: {source}")]
    InvalidJson {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SinkWebhookConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct RateCacheTuning {
    pub validity_period: Duration,
    pub ttl_jitter: f64,
    pub negative_ttl: Duration,
    pub cb_failure_threshold: u32,
    pub cb_open_window: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rpc_url: String,
    pub poll_interval: Duration,
    pub resolve_input_addresses: bool,
    pub parse_raw_blocks: bool,
    pub max_event_queue_size: usize,
    pub watch_addresses_file: String,
    pub watch_addresses_csv: Option<String>,
    pub worker_id: String,
    pub worker_members: Vec<String>,
    pub coinmarketcap_api_key: Option<String>,
    pub rate_cache: RateCacheTuning,
    pub sinks_enabled: Vec<String>,
    pub sink_file_path: Option<String>,
    pub sink_webhook: Option<SinkWebhookConfig>,
    pub sink_kafka_brokers: Option<String>,
    pub sink_kafka_topic: Option<String>,
    pub sink_nats_url: Option<String>,
    pub sink_nats_subject: Option<String>,
    pub feature_flags_file: Option<String>,
    pub feature_flags_reload_ms: u64,
    pub app_env: String,
}

impl AppConfig {
    /// Discovers and loads `.env*` files, then validates the environment
    /// into an `AppConfig`. Call once at process startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv_files();
        Self::from_environment(|name| std::env::var(name).ok())
    }

    /// Testable core: reads config from any `name -> Option<String>` lookup
    /// instead of the real process environment.
    pub fn from_environment(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let rpc_url = require(&get, "BTC_RPC_API_URL")?;
        if !(rpc_url.starts_with("http://") || rpc_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl {
                name: "BTC_RPC_API_URL",
                value: rpc_url,
            });
        }

        let poll_interval_ms = int_or(&get, "BITCOIN_POLL_INTERVAL_MS", 1000)?;
        let worker_id = get("WORKER_ID").unwrap_or_else(|| "worker-1".to_string());
        let worker_members = match get("WORKER_MEMBERS") {
            Some(csv) => split_csv(&csv),
            None => vec![worker_id.clone()],
        };

        let sink_webhook = match get("SINK_WEBHOOK_URL") {
            Some(url) => {
                let headers = match get("SINK_WEBHOOK_HEADERS") {
                    Some(json) => parse_header_json(&json)?,
                    None => Vec::new(),
                };
                Some(SinkWebhookConfig {
                    url,
                    headers,
                    max_retries: int_or(&get, "SINK_WEBHOOK_MAX_RETRIES", 3)?,
                })
            }
            None => None,
        };

        Ok(AppConfig {
            rpc_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            resolve_input_addresses: bool_or(&get, "RESOLVE_INPUT_ADDRESSES", false)?,
            parse_raw_blocks: bool_or(&get, "PARSE_RAW_BLOCKS", false)?,
            max_event_queue_size: int_or(&get, "MAX_EVENT_QUEUE_SIZE", 2000)? as usize,
            watch_addresses_file: get("WATCH_ADDRESSES_FILE")
                .unwrap_or_else(|| default_watch_addresses_path()),
            watch_addresses_csv: get("WATCH_ADDRESSES"),
            worker_id,
            worker_members,
            coinmarketcap_api_key: get("API_KEY_COINMARKETCAP"),
            rate_cache: RateCacheTuning {
                validity_period: Duration::from_secs(int_or(&get, "CUR_CACHE_VALIDITY_PERIOD", 3600)?),
                ttl_jitter: float_or(&get, "CUR_CACHE_TTL_JITTER", 0.10)?.clamp(0.0, 0.5),
                negative_ttl: Duration::from_secs(int_or(&get, "CUR_NEGATIVE_CACHE_TTL_SECONDS", 120)?),
                cb_failure_threshold: int_or(&get, "CUR_CB_FAILURE_THRESHOLD", 3)? as u32,
                cb_open_window: Duration::from_millis(int_or(&get, "CUR_CB_OPEN_MS", 30_000)?),
            },
            sinks_enabled: match get("SINKS_ENABLED") {
                Some(csv) => split_csv(&csv),
                None => vec!["stdout".to_string()],
            },
            sink_file_path: get("SINK_FILE_PATH"),
            sink_webhook,
            sink_kafka_brokers: get("SINK_KAFKA_BROKERS"),
            sink_kafka_topic: get("SINK_KAFKA_TOPIC"),
            sink_nats_url: get("SINK_NATS_URL"),
            sink_nats_subject: get("SINK_NATS_SUBJECT"),
            feature_flags_file: get("FEATURE_FLAGS_FILE"),
            feature_flags_reload_ms: int_or(&get, "FEATURE_FLAGS_RELOAD_MS", 2000)?,
            app_env: get("APP_ENV")
                .or_else(|| get("NODE_ENV"))
                .unwrap_or_else(|| "development".to_string()),
        })
    }
}

fn default_watch_addresses_path() -> String {
    std::env::current_dir()
        .map(|dir| dir.join("addresses.json").to_string_lossy().into_owned())
        .unwrap_or_else(|_| "addresses.json".to_string())
}

fn require(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    get(name).ok_or(ConfigError::Missing(name))
}

fn int_or(get: &impl Fn(&str) -> Option<String>, name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match get(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidInt { name, value }),
        None => Ok(default),
    }
}

fn float_or(get: &impl Fn(&str) -> Option<String>, name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match get(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidFloat { name, value }),
        None => Ok(default),
    }
}

fn bool_or(get: &impl Fn(&str) -> Option<String>, name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match get(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool { name, value }),
        },
        None => Ok(default),
    }
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_header_json(json: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|source| ConfigError::InvalidJson {
        name: "SINK_WEBHOOK_HEADERS",
        source,
    })?;
    let object = value.as_object().cloned().unwrap_or_default();
    Ok(object
        .into_iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
        .collect())
}

/// Walks up from the current directory until it finds `Cargo.toml`, `.git`,
/// or any `.env*` file, then loads (non-overriding) `.env`, `.env.local`,
/// `.env.<env>`, `.env.<env>.local` from that directory (§6).
fn load_dotenv_files() {
    let Ok(cwd) = std::env::current_dir() else { return };
    let Some(root) = find_project_root(&cwd) else { return };

    let app_env = std::env::var("APP_ENV")
        .or_else(|_| std::env::var("NODE_ENV"))
        .unwrap_or_else(|_| "development".to_string());

    for name in [
        ".env".to_string(),
        ".env.local".to_string(),
        format!(".env.{app_env}"),
        format!(".env.{app_env}.local"),
    ] {
        let _ = dotenvy::from_path(root.join(&name));
    }
}

fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        if dir.join("Cargo.toml").is_file() || dir.join(".git").exists() || has_dot_env_entry(dir) {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

fn has_dot_env_entry(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|entry| entry.file_name().to_string_lossy().starts_with(".env"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn missing_required_rpc_url_is_fatal() {
        let err = AppConfig::from_environment(env_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BTC_RPC_API_URL")));
    }

    #[test]
    fn rejects_non_http_rpc_url() {
        let err = AppConfig::from_environment(env_from(&[("BTC_RPC_API_URL", "ftp://node")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn defaults_match_the_spec_table() {
        let config = AppConfig::from_environment(env_from(&[("BTC_RPC_API_URL", "http://127.0.0.1:8332")])).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.max_event_queue_size, 2000);
        assert_eq!(config.sinks_enabled, vec!["stdout".to_string()]);
        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.worker_members, vec!["worker-1".to_string()]);
        assert_eq!(config.rate_cache.validity_period, Duration::from_secs(3600));
        assert_eq!(config.rate_cache.cb_failure_threshold, 3);
    }

    #[test]
    fn worker_members_csv_overrides_single_member_default() {
        let config = AppConfig::from_environment(env_from(&[
            ("BTC_RPC_API_URL", "http://node"),
            ("WORKER_ID", "worker-2"),
            ("WORKER_MEMBERS", "worker-1, worker-2 ,worker-3"),
        ]))
        .unwrap();
        assert_eq!(config.worker_members, vec!["worker-1", "worker-2", "worker-3"]);
    }

    #[test]
    fn webhook_headers_parsed_from_json_object() {
        let config = AppConfig::from_environment(env_from(&[
            ("BTC_RPC_API_URL", "http://node"),
            ("SINK_WEBHOOK_URL", "https://example.com/hook"),
            ("SINK_WEBHOOK_HEADERS", r#"{"X-Api-Key":"secret"}"#),
        ]))
        .unwrap();
        let webhook = config.sink_webhook.unwrap();
        assert_eq!(webhook.headers, vec![("X-Api-Key".to_string(), "secret".to_string())]);
        assert_eq!(webhook.max_retries, 3);
    }

    #[test]
    fn invalid_bool_value_is_rejected() {
        let err = AppConfig::from_environment(env_from(&[
            ("BTC_RPC_API_URL", "http://node"),
            ("PARSE_RAW_BLOCKS", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }
}
