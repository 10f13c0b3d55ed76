// Configuration module for the harvest proxy

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

static CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

pub const CONFIG_PATH_ENV: &str = "HARVEST_PROXY_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,

    #[serde(default = "default_models_file")]
    pub models_file: String,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            api_keys: Vec::new(),
            debug: false,
            credentials_file: default_credentials_file(),
            models_file: default_models_file(),
            upstream: UpstreamConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    7860
}

fn default_credentials_file() -> String {
    "~/.harvest-proxy/credentials.json".to_string()
}

fn default_models_file() -> String {
    "models.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_connections: default_max_connections(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    120
}

fn default_max_connections() -> usize {
    100
}

fn default_max_idle_per_host() -> usize {
    20
}

/// Credential freshness and refresh wait policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RefreshConfig {
    #[serde(default = "default_stale_warn")]
    pub stale_warn_secs: u64,
    #[serde(default = "default_proactive_refresh")]
    pub proactive_refresh_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_wait_timeout")]
    pub credential_timeout_secs: u64,
    #[serde(default = "default_wait_timeout")]
    pub ui_settled_timeout_secs: u64,
    #[serde(default = "default_grace_delay")]
    pub grace_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            stale_warn_secs: default_stale_warn(),
            proactive_refresh_secs: default_proactive_refresh(),
            keep_alive_secs: default_keep_alive(),
            credential_timeout_secs: default_wait_timeout(),
            ui_settled_timeout_secs: default_wait_timeout(),
            grace_delay_ms: default_grace_delay(),
        }
    }
}

impl RefreshConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

fn default_stale_warn() -> u64 {
    30 * 60
}

fn default_proactive_refresh() -> u64 {
    50 * 60
}

fn default_keep_alive() -> u64 {
    45 * 60
}

fn default_wait_timeout() -> u64 {
    60
}

fn default_grace_delay() -> u64 {
    1000
}

impl AppConfig {
    /// Apply `PORT`, `HOST` and `API_KEY` from the environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var("PORT").ok(),
            std::env::var("HOST").ok(),
            std::env::var("API_KEY").ok(),
        );
    }

    fn apply_overrides(&mut self, port: Option<String>, host: Option<String>, api_key: Option<String>) {
        if let Some(port) = port {
            match port.trim().parse::<u16>() {
                Ok(p) => self.port = p,
                Err(_) => tracing::warn!("Ignoring invalid PORT value: {}", port),
            }
        }
        if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            let key = key.trim().to_string();
            if !self.api_keys.contains(&key) {
                self.api_keys.push(key);
            }
        }
    }

    pub fn bind_address(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        };
        format!("{}:{}", host, self.port)
    }

    pub fn credentials_path(&self) -> PathBuf {
        expand_home(&self.credentials_file)
    }

    pub fn models_path(&self) -> PathBuf {
        expand_home(&self.models_file)
    }
}

/// Load the YAML config, writing defaults when missing. Records the path for `get_config_path`.
pub fn init_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config_path = path
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let mut config = load_or_create(&config_path)?;
    config.apply_env_overrides();

    CONFIG_PATH.set(config_path).ok();
    Ok(config)
}

fn load_or_create(config_path: &Path) -> Result<AppConfig> {
    if config_path.exists() {
        let content = std::fs::read_to_string(config_path)?;
        return Ok(serde_yaml::from_str(&content)?);
    }

    let default_config = AppConfig::default();
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_yaml::to_string(&default_config)?;
    std::fs::write(config_path, content)?;
    Ok(default_config)
}

pub fn get_config_path() -> Option<PathBuf> {
    CONFIG_PATH.get().cloned()
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
