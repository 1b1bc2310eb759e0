use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::CliArgs;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_NODE_OPERATION_IMAGE: &str = "busybox:latest";
const DEFAULT_NODE_OPERATION_NAMESPACE: &str = "kube-system";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub kubeconfig: Option<PathBuf>,
    pub disable_cache: bool,
    pub node_operation_image: String,
    pub node_operation_namespace: String,
    pub timeouts: Timeouts,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub request: Duration,
    pub batch: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            batch: Duration::from_secs(DEFAULT_BATCH_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct KiteConfigFile {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    kubeconfig: Option<PathBuf>,
    #[serde(default)]
    disable_cache: Option<bool>,
    #[serde(default, alias = "node_image")]
    node_operation_image: Option<String>,
    #[serde(default)]
    node_operation_namespace: Option<String>,
    #[serde(default, alias = "timeout_secs")]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    batch_timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Command line and environment win over the settings file, which wins
    /// over built-in defaults.
    pub fn resolve(args: &CliArgs) -> Result<Self> {
        let path = args.config.clone().or_else(discover_config_path);
        let file = match &path {
            Some(path) => load_config_file(path)?,
            None => KiteConfigFile::default(),
        };
        Ok(Self::merge(args, file, path))
    }

    fn merge(args: &CliArgs, file: KiteConfigFile, path: Option<PathBuf>) -> Self {
        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            request: file
                .request_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.request),
            batch: file
                .batch_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.batch),
        };

        Self {
            port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
            kubeconfig: args.kubeconfig.clone().or(file.kubeconfig),
            disable_cache: args.disable_cache || file.disable_cache.unwrap_or(false),
            node_operation_image: non_empty(args.node_operation_image.clone())
                .or_else(|| non_empty(file.node_operation_image))
                .unwrap_or_else(|| DEFAULT_NODE_OPERATION_IMAGE.to_string()),
            node_operation_namespace: non_empty(args.node_operation_namespace.clone())
                .or_else(|| non_empty(file.node_operation_namespace))
                .unwrap_or_else(|| DEFAULT_NODE_OPERATION_NAMESPACE.to_string()),
            timeouts,
            source: path.map(|path| path.display().to_string()),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::merge(&CliArgs::default(), KiteConfigFile::default(), None)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn load_config_file(path: &Path) -> Result<KiteConfigFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn parse_config(raw: &str) -> Result<KiteConfigFile> {
    if raw.trim().is_empty() {
        return Ok(KiteConfigFile::default());
    }
    Ok(serde_yaml::from_str(raw)?)
}

fn discover_config_path() -> Option<PathBuf> {
    let cwd_candidates = [PathBuf::from("kite.yaml"), PathBuf::from("kite.yml")];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/kite/config.yaml"),
            PathBuf::from(&home).join(".config/kite/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}
