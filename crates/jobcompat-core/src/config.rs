use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::BackendKind;

/// Platform version assumed when the config does not name one.
pub const DEFAULT_PLATFORM_VERSION: u32 = 26;
/// First backoff delay after a job asks to be rescheduled.
pub const DEFAULT_BACKOFF_MS: u64 = 30_000;
/// Upper bound for any backoff delay (5 hours).
pub const MAX_BACKOFF_MS: u64 = 5 * 60 * 60 * 1000;
/// Poll cadence of the simulated platform driver.
pub const DEFAULT_TICK_SECS: u64 = 1;

/// Top-level config (jobcompat.toml + JOBCOMPAT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCompatConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Platform API level handed to the capability prober.
    #[serde(default = "default_platform_version")]
    pub version: u32,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_PLATFORM_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Diagnostic override. Only meant for verification flows.
    #[serde(default)]
    pub force_backend: ForcedBackend,
    /// Backends dropped from the prober's output even if the platform has them.
    #[serde(default)]
    pub disabled_backends: Vec<BackendKind>,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            force_backend: ForcedBackend::Auto,
            disabled_backends: Vec::new(),
            tick_secs: DEFAULT_TICK_SECS,
        }
    }
}

/// `"auto"` or the name of a backend, e.g. `"job_scheduler_21"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ForcedBackend {
    #[default]
    Auto,
    Backend(BackendKind),
}

impl ForcedBackend {
    pub fn as_override(self) -> Option<BackendKind> {
        match self {
            ForcedBackend::Auto => None,
            ForcedBackend::Backend(kind) => Some(kind),
        }
    }
}

impl TryFrom<String> for ForcedBackend {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s == "auto" {
            return Ok(ForcedBackend::Auto);
        }
        s.parse().map(ForcedBackend::Backend)
    }
}

impl From<ForcedBackend> for String {
    fn from(f: ForcedBackend) -> Self {
        match f {
            ForcedBackend::Auto => "auto".to_string(),
            ForcedBackend::Backend(kind) => kind.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_ms")]
    pub initial_ms: u64,
    #[serde(default)]
    pub policy: BackoffPolicy,
    #[serde(default = "default_max_backoff_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_BACKOFF_MS,
            policy: BackoffPolicy::Exponential,
            max_ms: MAX_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_platform_version() -> u32 {
    DEFAULT_PLATFORM_VERSION
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}
fn default_max_backoff_ms() -> u64 {
    MAX_BACKOFF_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobcompat/jobs.db", home)
}

impl JobCompatConfig {
    /// Load config from a TOML file with JOBCOMPAT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.jobcompat/jobcompat.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading configuration");

        Self::from_figment(Figment::new().merge(Toml::file(&path)))
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .merge(Env::prefixed("JOBCOMPAT_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobcompat/jobcompat.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> JobCompatConfig {
        JobCompatConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse("");
        assert_eq!(cfg.platform.version, DEFAULT_PLATFORM_VERSION);
        assert_eq!(cfg.scheduler.force_backend, ForcedBackend::Auto);
        assert_eq!(cfg.backoff.initial_ms, DEFAULT_BACKOFF_MS);
        assert_eq!(cfg.backoff.policy, BackoffPolicy::Exponential);
    }

    #[test]
    fn forced_backend_parses_name_and_auto() {
        let cfg = parse("[scheduler]\nforce_backend = \"job_scheduler_21\"\n");
        assert_eq!(
            cfg.scheduler.force_backend.as_override(),
            Some(BackendKind::JobScheduler21)
        );

        let cfg = parse("[scheduler]\nforce_backend = \"auto\"\n");
        assert_eq!(cfg.scheduler.force_backend.as_override(), None);
    }

    #[test]
    fn disabled_backends_and_backoff() {
        let cfg = parse(
            "[scheduler]\ndisabled_backends = [\"alarm_14\"]\n\
             [backoff]\ninitial_ms = 1000\npolicy = \"linear\"\n",
        );
        assert_eq!(cfg.scheduler.disabled_backends, vec![BackendKind::Alarm14]);
        assert_eq!(cfg.backoff.initial_ms, 1000);
        assert_eq!(cfg.backoff.policy, BackoffPolicy::Linear);
    }

    #[test]
    fn unknown_backend_is_a_config_error() {
        let res = JobCompatConfig::from_figment(
            Figment::new().merge(Toml::string("[scheduler]\nforce_backend = \"gcm\"\n")),
        );
        assert!(res.is_err());
    }
}
