//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (`COLDFRONT_*`)
//! 2. Config file (TOML, `~/.config/coldfront/config.toml` or
//!    `COLDFRONT_CONFIG`)
//! 3. An orchestrator-supplied key/value map (`Config::from_map`, the
//!    configmap path in-cluster)
//!
//! Validation failures exit the process with code 1. Model configuration is
//! an immutable per-process snapshot; keys the proxy does not interpret ride
//! along in `model.extra` and are forwarded to the backend untouched.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub use crate::version::VERSION;

const DEFAULT_IDLE_TIMEOUT: &str = "5m";
const DEFAULT_WARM_TIMEOUT: &str = "10m";
const DEFAULT_SCHEDULE_TIMEOUT: &str = "30s";
const DEFAULT_PORT: &str = "8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required configuration key `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("`{key}` is not a valid duration: {value:?}")]
    InvalidDuration { key: &'static str, value: String },
    #[error("`port` is not a valid port number: {0:?}")]
    InvalidPort(String),
    #[error("could not read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    FileParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub deployment: String,
    pub config_map_name: Option<String>,
    pub idle_timeout: Duration,
    pub schedule_timeout: Duration,
    pub warm_timeout: Duration,
    pub port: u16,
    /// Base URL of the backend service.
    pub backend_url: String,
    /// Abort a streaming response when upstream goes quiet this long.
    pub upstream_read_idle: Option<Duration>,
    pub model: ModelConfig,
    pub log_level: String,
}

/// Immutable snapshot of the model the backend serves. The proxy interprets
/// only what it needs; everything else is opaque.
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    pub model_id: String,
    pub served_name: Option<String>,
    pub tensor_parallel_size: Option<u32>,
    pub max_model_len: Option<u32>,
    pub dtype: Option<String>,
    pub tool_call_parser: Option<String>,
    pub extra: BTreeMap<String, String>,
}

// ============================================================================
// Raw (pre-validation) Shapes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    deployment: Option<String>,
    #[serde(default)]
    config_map_name: Option<String>,
    #[serde(default)]
    idle_timeout: Option<String>,
    #[serde(default)]
    schedule_timeout: Option<String>,
    #[serde(default)]
    warm_timeout: Option<String>,
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    backend_url: Option<String>,
    #[serde(default)]
    upstream_read_idle: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    model: RawModelConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawModelConfig {
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    served_name: Option<String>,
    #[serde(default)]
    tensor_parallel_size: Option<u32>,
    #[serde(default)]
    max_model_len: Option<u32>,
    #[serde(default)]
    dtype: Option<String>,
    #[serde(default)]
    tool_call_parser: Option<String>,
    #[serde(default)]
    extra: BTreeMap<String, String>,
}

impl RawConfig {
    /// Overlay environment variables onto whatever the file provided.
    fn apply_env(&mut self) {
        let overlay = |slot: &mut Option<String>, var: &str| {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *slot = Some(value);
                }
            }
        };
        overlay(&mut self.namespace, "COLDFRONT_NAMESPACE");
        overlay(&mut self.deployment, "COLDFRONT_DEPLOYMENT");
        overlay(&mut self.config_map_name, "COLDFRONT_CONFIG_MAP");
        overlay(&mut self.idle_timeout, "COLDFRONT_IDLE_TIMEOUT");
        overlay(&mut self.schedule_timeout, "COLDFRONT_SCHEDULE_TIMEOUT");
        overlay(&mut self.warm_timeout, "COLDFRONT_WARM_TIMEOUT");
        overlay(&mut self.port, "COLDFRONT_PORT");
        overlay(&mut self.backend_url, "COLDFRONT_BACKEND_URL");
        overlay(&mut self.upstream_read_idle, "COLDFRONT_UPSTREAM_READ_IDLE");
        overlay(&mut self.log_level, "COLDFRONT_LOG_LEVEL");
        overlay(&mut self.model.model_id, "COLDFRONT_MODEL_ID");
        overlay(&mut self.model.served_name, "COLDFRONT_SERVED_NAME");
    }

    fn validate(self) -> Result<Config, ConfigError> {
        let namespace = require(self.namespace, "namespace")?;
        let deployment = require(self.deployment, "deployment")?;
        let model_id = require(self.model.model_id, "model_id")?;

        let idle_timeout = parse_duration(
            self.idle_timeout.as_deref().unwrap_or(DEFAULT_IDLE_TIMEOUT),
            "idle_timeout",
        )?;
        let schedule_timeout = parse_duration(
            self.schedule_timeout
                .as_deref()
                .unwrap_or(DEFAULT_SCHEDULE_TIMEOUT),
            "schedule_timeout",
        )?;
        let warm_timeout = parse_duration(
            self.warm_timeout.as_deref().unwrap_or(DEFAULT_WARM_TIMEOUT),
            "warm_timeout",
        )?;

        let port_raw = self.port.unwrap_or_else(|| DEFAULT_PORT.to_string());
        let port: u16 = port_raw
            .parse()
            .map_err(|_| ConfigError::InvalidPort(port_raw))?;

        let upstream_read_idle = self
            .upstream_read_idle
            .as_deref()
            .map(|v| parse_duration(v, "upstream_read_idle"))
            .transpose()?;

        let backend_url = self.backend_url.unwrap_or_else(|| {
            format!(
                "http://{}.{}.svc.cluster.local:8000",
                deployment, namespace
            )
        });

        Ok(Config {
            namespace,
            deployment,
            config_map_name: self.config_map_name,
            idle_timeout,
            schedule_timeout,
            warm_timeout,
            port,
            backend_url,
            upstream_read_idle,
            model: ModelConfig {
                model_id,
                served_name: self.model.served_name,
                tensor_parallel_size: self.model.tensor_parallel_size,
                max_model_len: self.model.max_model_len,
                dtype: self.model.dtype,
                tool_call_parser: self.model.tool_call_parser,
                extra: self.model.extra,
            },
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn require(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingField(key))
}

fn parse_duration(value: &str, key: &'static str) -> Result<Duration, ConfigError> {
    duration_str::parse(value).map_err(|_| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
    })
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Path of the config file: `COLDFRONT_CONFIG` or the platform config
    /// directory.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("COLDFRONT_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("coldfront").join("config.toml"))
    }

    /// Load configuration: file (if present) overlaid with environment
    /// variables, then validated. In-cluster, a mounted configmap directory
    /// (one file per key, `COLDFRONT_CONFIG_MAP_DIR`) is the base layer
    /// instead.
    pub fn load() -> Result<Config, ConfigError> {
        if let Ok(dir) = std::env::var("COLDFRONT_CONFIG_MAP_DIR") {
            let map = read_key_value_dir(PathBuf::from(dir))?;
            return Self::from_map(&map);
        }

        let mut raw = match Self::config_path() {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    }
                })?;
                toml::from_str::<RawConfig>(&text)
                    .map_err(|source| ConfigError::FileParse { path, source })?
            }
            _ => RawConfig::default(),
        };
        raw.apply_env();
        raw.validate()
    }

    /// Build configuration from an orchestrator-supplied key/value map (the
    /// configmap contents). Recognized keys are consumed; unrecognized ones
    /// land in `model.extra` and are forwarded to the backend.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Config, ConfigError> {
        let mut raw = RawConfig::default();
        let get = |key: &str| map.get(key).cloned().filter(|v| !v.is_empty());

        raw.namespace = get("namespace");
        raw.deployment = get("deployment");
        raw.config_map_name = get("config_map_name");
        raw.idle_timeout = get("idle_timeout");
        raw.schedule_timeout = get("schedule_timeout");
        raw.warm_timeout = get("warm_timeout");
        raw.port = get("port");
        raw.backend_url = get("backend_url");
        raw.upstream_read_idle = get("upstream_read_idle");
        raw.log_level = get("log_level");
        raw.model.model_id = get("model_id");
        raw.model.served_name = get("served_name");
        raw.model.tensor_parallel_size =
            get("tensor_parallel_size").and_then(|v| v.parse().ok());
        raw.model.max_model_len = get("max_model_len").and_then(|v| v.parse().ok());
        raw.model.dtype = get("dtype");
        raw.model.tool_call_parser = get("tool_call_parser");

        let recognized = [
            "namespace",
            "deployment",
            "config_map_name",
            "idle_timeout",
            "schedule_timeout",
            "warm_timeout",
            "port",
            "backend_url",
            "upstream_read_idle",
            "log_level",
            "model_id",
            "served_name",
            "tensor_parallel_size",
            "max_model_len",
            "dtype",
            "tool_call_parser",
        ];
        for (key, value) in map {
            if !recognized.contains(&key.as_str()) {
                raw.model.extra.insert(key.clone(), value.clone());
            }
        }

        raw.apply_env();
        raw.validate()
    }
}

/// Read a configmap volume: each file is a key, its contents the value.
/// Kubernetes maintains `..data`/`..2024_*` bookkeeping entries; skip them.
fn read_key_value_dir(dir: PathBuf) -> Result<BTreeMap<String, String>, ConfigError> {
    let entries = std::fs::read_dir(&dir).map_err(|source| ConfigError::FileRead {
        path: dir.clone(),
        source,
    })?;

    let mut map = BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("..") || !path.is_file() {
            continue;
        }
        let value = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
            path: path.clone(),
            source,
        })?;
        map.insert(name.to_string(), value.trim().to_string());
    }
    Ok(map)
}
