// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration Types
//
// Defines the configuration schema for a boxvol engine node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Registry endpoint and credentials
// - Local storage layout and image sizing
// - Lease refresh / backup cadence and release policy
// - Orphan scanner and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::lease::ReleasePolicy;
use crate::domain::volume::DEFAULT_SIZE_MULTIPLIER;

pub const API_VERSION: &str = "boxvol.dev/v1";
pub const KIND: &str = "EngineConfig";

/// Top-level Kubernetes-style engine configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfigManifest {
    /// API version (must be "boxvol.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "EngineConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: EngineConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfigSpec {
    pub registry: RegistryConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the remote API (e.g. "https://api.example.com")
    pub url: String,

    /// Bearer token (supports "env:VAR_NAME")
    #[serde(default)]
    pub token: String,

    /// Box this node acts for, sent with mount requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_id: Option<String>,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Parent of all volume directories
    #[serde(default = "default_volumes_root")]
    pub volumes_root: PathBuf,

    /// Image capacity relative to the declared quota
    #[serde(default = "default_size_multiplier")]
    pub size_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    #[serde(default = "default_backup_interval", with = "humantime_serde")]
    pub backup_interval: Duration,

    /// Delay before retrying after a failed periodic backup
    #[serde(default = "default_backup_retry_interval", with = "humantime_serde")]
    pub backup_retry_interval: Duration,

    #[serde(default = "default_final_backup_attempts")]
    pub final_backup_attempts: u32,

    #[serde(default)]
    pub release_policy: ReleasePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_restic_binary")]
    pub restic_binary: PathBuf,

    /// Listen address of the local object-store proxy
    #[serde(default = "default_proxy_bind")]
    pub proxy_bind: String,

    /// Upper bound for one backup or restore run
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Images younger than this are never reclaimed
    #[serde(default = "default_min_age", with = "humantime_serde")]
    pub min_age: Duration,

    #[serde(default = "default_scan_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus listener address
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_volumes_root() -> PathBuf {
    PathBuf::from("/var/lib/boxvol/volumes")
}

fn default_size_multiplier() -> f64 {
    DEFAULT_SIZE_MULTIPLIER
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_backup_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_backup_retry_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_final_backup_attempts() -> u32 {
    3
}

fn default_restic_binary() -> PathBuf {
    PathBuf::from("restic")
}

fn default_proxy_bind() -> String {
    "127.0.0.1:0".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_min_age() -> Duration {
    Duration::from_secs(120)
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_bind() -> String {
    "127.0.0.1:9464".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volumes_root: default_volumes_root(),
            size_multiplier: default_size_multiplier(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            backup_interval: default_backup_interval(),
            backup_retry_interval: default_backup_retry_interval(),
            final_backup_attempts: default_final_backup_attempts(),
            release_policy: ReleasePolicy::default(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            restic_binary: default_restic_binary(),
            proxy_bind: default_proxy_bind(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            min_age: default_min_age(),
            interval: default_scan_interval(),
        }
    }
}

impl Default for EngineConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "boxvol-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: EngineConfigSpec {
                registry: RegistryConfig {
                    url: "http://127.0.0.1:8080".to_string(),
                    token: String::new(),
                    box_id: None,
                    request_timeout: default_request_timeout(),
                },
                storage: StorageConfig::default(),
                scheduler: SchedulerConfig::default(),
                backup: BackupConfig::default(),
                scanner: ScannerConfig::default(),
                observability: None,
            },
        }
    }
}

impl EngineConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. BOXVOL_CONFIG_PATH environment variable
    /// 2. ./boxvol-config.yaml (working directory)
    /// 3. ~/.boxvol/config.yaml (user home)
    /// 4. /etc/boxvol/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BOXVOL_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./boxvol-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".boxvol").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/boxvol/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    /// This allows container deployments to override config via env vars
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BOXVOL_REGISTRY_URL") {
            tracing::info!("Environment override: BOXVOL_REGISTRY_URL={}", val);
            self.spec.registry.url = val;
        }

        if let Ok(val) = std::env::var("BOXVOL_REGISTRY_TOKEN") {
            tracing::info!("Environment override: BOXVOL_REGISTRY_TOKEN=<redacted>");
            self.spec.registry.token = val;
        }

        if let Ok(val) = std::env::var("BOXVOL_VOLUMES_ROOT") {
            tracing::info!("Environment override: BOXVOL_VOLUMES_ROOT={}", val);
            self.spec.storage.volumes_root = PathBuf::from(val);
        }
    }

    /// Registry token with "env:VAR" indirection resolved
    pub fn resolved_token(&self) -> anyhow::Result<String> {
        resolve_secret(&self.spec.registry.token)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let url = &self.spec.registry.url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("spec.registry.url must start with http:// or https://, got '{}'", url);
        }

        if self.spec.storage.size_multiplier < 1.0 || !self.spec.storage.size_multiplier.is_finite() {
            anyhow::bail!(
                "spec.storage.size_multiplier must be >= 1.0, got {}",
                self.spec.storage.size_multiplier
            );
        }

        let scheduler = &self.spec.scheduler;
        if scheduler.refresh_interval.is_zero() || scheduler.backup_interval.is_zero() {
            anyhow::bail!("spec.scheduler intervals must be non-zero");
        }
        if scheduler.refresh_interval >= scheduler.backup_interval {
            anyhow::bail!(
                "spec.scheduler.refresh_interval ({:?}) must be shorter than backup_interval ({:?})",
                scheduler.refresh_interval,
                scheduler.backup_interval
            );
        }
        if scheduler.final_backup_attempts == 0 {
            anyhow::bail!("spec.scheduler.final_backup_attempts must be at least 1");
        }

        Ok(())
    }
}

/// Resolve "env:VAR_NAME" to the variable's value; other strings pass through
pub fn resolve_secret(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map_err(|_| anyhow::anyhow!("Environment variable '{}' is not set", var)),
        None => Ok(value.to_string()),
    }
}
