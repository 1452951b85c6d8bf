use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location, overridable with `PROCWARDEN_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "config/procwarden.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// JSON list of managed applications.
    pub applications_path: PathBuf,
    pub supervisor: SupervisorConfig,
    pub launch: LaunchConfig,
    pub terminate: TerminateConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub restart_cooldown_secs: u64,
    pub probe_timeout_ms: u64,
    /// 설정에서 제거된 애플리케이션이 실행 중이면 종료할지 여부
    pub terminate_on_removal: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LaunchConfig {
    pub settle_delay_ms: u64,
    pub shell: PathBuf,
    /// Variables filled in only when absent from the ambient environment.
    /// Empty means the built-in session defaults.
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TerminateConfig {
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            applications_path: PathBuf::from("applications.json"),
            supervisor: SupervisorConfig::default(),
            launch: LaunchConfig::default(),
            terminate: TerminateConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            restart_cooldown_secs: 5,
            probe_timeout_ms: 3000,
            terminate_on_removal: false,
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            shell: PathBuf::from("/bin/sh"),
            env: BTreeMap::new(),
        }
    }
}

impl Default for TerminateConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl LaunchConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl TerminateConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl GlobalConfig {
    /// Path from `PROCWARDEN_CONFIG`, or [`DEFAULT_CONFIG_PATH`].
    pub fn resolve_path() -> PathBuf {
        std::env::var("PROCWARDEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        Self::parse(&s).map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
