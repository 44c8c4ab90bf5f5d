// ABOUTME: Runtime configuration for sandkeep loaded from environment variables
// ABOUTME: Plain values injected into the reconciler; no business logic lives here

pub mod constants;

use serde::{Deserialize, Serialize};
use std::env;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("Invalid boolean for {name}: {value}")]
    InvalidBool { name: &'static str, value: String },
    #[error("Invalid network mode: {0}")]
    InvalidNetworkMode(String),
    #[error("Container mount path must be absolute: {0}")]
    RelativeContainerPath(String),
    #[error("Value for {0} must be greater than zero")]
    Zero(&'static str),
    #[error("Could not resolve working directory: {0}")]
    WorkingDir(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://sandkeep.db?mode=rwc";
pub const DEFAULT_BASE_IMAGE: &str = "python:3.10-slim-bookworm";
pub const DEFAULT_NETWORK_MODE: &str = "sandbox_network";
pub const DEFAULT_SHARED_DIR_HOST_PATH: &str = "shared_files";
pub const DEFAULT_SHARED_DIR_CONTAINER_PATH: &str = "/share_area";
pub const DEFAULT_CONTAINER_LABEL: &str = "sandkeep.managed";

/// Resource limits applied to every sandbox container.
///
/// A snapshot of this value is stored on each session record when its
/// container is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_period: i64,
    /// 50000 with the default period is half a CPU.
    pub cpu_quota: i64,
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_period: 100_000,
            cpu_quota: 50_000,
            pids_limit: 50,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }
}

/// Host directory bind-mounted read-write into every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

#[derive(Debug, Clone)]
pub struct SandkeepConfig {
    pub database_url: String,
    pub default_base_image: String,
    pub resource_limits: ResourceLimits,
    pub network_mode: String,
    pub shared_mount: SharedMount,
    pub exec_timeout: Duration,
    pub sweep_interval: Duration,
    pub stop_grace: Duration,
    pub image_pull_timeout: Duration,
    pub serialize_callers: bool,
    pub container_label: String,
}

impl SandkeepConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|name| env::var(name).ok())?;
        tracing::debug!(
            image = %config.default_base_image,
            network = %config.network_mode,
            shared_dir = %config.shared_mount.host_path.display(),
            "Loaded sandkeep configuration"
        );
        Ok(config)
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        use constants::*;

        let get = |name: &str, default: &str| -> String {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let resource_limits = ResourceLimits {
            memory_mb: parse_positive(SANDKEEP_MEMORY_LIMIT_MB, &get(SANDKEEP_MEMORY_LIMIT_MB, "2048"))?,
            cpu_period: parse_positive(SANDKEEP_CPU_PERIOD, &get(SANDKEEP_CPU_PERIOD, "100000"))? as i64,
            cpu_quota: parse_positive(SANDKEEP_CPU_QUOTA, &get(SANDKEEP_CPU_QUOTA, "50000"))? as i64,
            pids_limit: parse_positive(SANDKEEP_PIDS_LIMIT, &get(SANDKEEP_PIDS_LIMIT, "50"))? as i64,
        };

        let network_mode = get(SANDKEEP_NETWORK_MODE, DEFAULT_NETWORK_MODE);
        if network_mode.eq_ignore_ascii_case("host") || network_mode.contains(char::is_whitespace)
        {
            return Err(ConfigError::InvalidNetworkMode(network_mode));
        }

        let container_path = get(
            SANDKEEP_SHARED_DIR_CONTAINER_PATH,
            DEFAULT_SHARED_DIR_CONTAINER_PATH,
        );
        if !container_path.starts_with('/') {
            return Err(ConfigError::RelativeContainerPath(container_path));
        }
        let host_path = absolutize(Path::new(&get(
            SANDKEEP_SHARED_DIR_HOST_PATH,
            DEFAULT_SHARED_DIR_HOST_PATH,
        )))?;

        let serialize_callers = parse_bool(
            SANDKEEP_SERIALIZE_CALLERS,
            &get(SANDKEEP_SERIALIZE_CALLERS, "false"),
        )?;

        Ok(Self {
            database_url: get(SANDKEEP_DATABASE_URL, DEFAULT_DATABASE_URL),
            default_base_image: get(SANDKEEP_BASE_IMAGE, DEFAULT_BASE_IMAGE),
            resource_limits,
            network_mode,
            shared_mount: SharedMount {
                host_path,
                container_path,
            },
            exec_timeout: secs(SANDKEEP_EXEC_TIMEOUT_SECS, &get(SANDKEEP_EXEC_TIMEOUT_SECS, "60"))?,
            sweep_interval: secs(SANDKEEP_SWEEP_INTERVAL_SECS, &get(SANDKEEP_SWEEP_INTERVAL_SECS, "30"))?,
            stop_grace: secs(SANDKEEP_STOP_GRACE_SECS, &get(SANDKEEP_STOP_GRACE_SECS, "5"))?,
            image_pull_timeout: secs(
                SANDKEEP_IMAGE_PULL_TIMEOUT_SECS,
                &get(SANDKEEP_IMAGE_PULL_TIMEOUT_SECS, "600"),
            )?,
            serialize_callers,
            container_label: get(SANDKEEP_CONTAINER_LABEL, DEFAULT_CONTAINER_LABEL),
        })
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<u64> {
    let parsed = value
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber { name, source })?;
    if parsed == 0 {
        return Err(ConfigError::Zero(name));
    }
    Ok(parsed)
}

fn secs(name: &'static str, value: &str) -> Result<Duration> {
    parse_positive(name, value).map(Duration::from_secs)
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<SandkeepConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SandkeepConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.default_base_image, DEFAULT_BASE_IMAGE);
        assert_eq!(config.resource_limits, ResourceLimits::default());
        assert_eq!(config.network_mode, "sandbox_network");
        assert_eq!(config.shared_mount.container_path, "/share_area");
        assert!(config.shared_mount.host_path.is_absolute());
        assert_eq!(config.exec_timeout, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert!(!config.serialize_callers);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            (constants::SANDKEEP_BASE_IMAGE, "node:18"),
            (constants::SANDKEEP_MEMORY_LIMIT_MB, "512"),
            (constants::SANDKEEP_NETWORK_MODE, "none"),
            (constants::SANDKEEP_SHARED_DIR_HOST_PATH, "/srv/share"),
            (constants::SANDKEEP_SERIALIZE_CALLERS, "yes"),
            (constants::SANDKEEP_EXEC_TIMEOUT_SECS, "5"),
        ])
        .unwrap();
        assert_eq!(config.default_base_image, "node:18");
        assert_eq!(config.resource_limits.memory_mb, 512);
        assert_eq!(config.resource_limits.memory_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.network_mode, "none");
        assert_eq!(config.shared_mount.host_path, PathBuf::from("/srv/share"));
        assert!(config.serialize_callers);
        assert_eq!(config.exec_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            config_from(&[(constants::SANDKEEP_PIDS_LIMIT, "many")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            config_from(&[(constants::SANDKEEP_EXEC_TIMEOUT_SECS, "0")]),
            Err(ConfigError::Zero(_))
        ));
        assert!(matches!(
            config_from(&[(constants::SANDKEEP_NETWORK_MODE, "host")]),
            Err(ConfigError::InvalidNetworkMode(_))
        ));
        assert!(matches!(
            config_from(&[(constants::SANDKEEP_SHARED_DIR_CONTAINER_PATH, "share")]),
            Err(ConfigError::RelativeContainerPath(_))
        ));
        assert!(matches!(
            config_from(&[(constants::SANDKEEP_SERIALIZE_CALLERS, "maybe")]),
            Err(ConfigError::InvalidBool { .. })
        ));
    }
}
