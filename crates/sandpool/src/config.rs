//! Settings
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `SANDPOOL_`-prefixed environment variables (`__` separates nesting, e.g.
//! `SANDPOOL_DISPATCHER__MAX_WORKERS=8`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::types::{Error, Limits, Result};

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server socket; worker sockets are derived from it
    pub socket: PathBuf,
    /// Root of per-tenant database directories
    pub storage_root: PathBuf,
    pub dispatcher: DispatcherSettings,
    pub execution: ExecutionSettings,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket: std::env::temp_dir().join("sandpool").join("sandpool.sock"),
            storage_root: PathBuf::from("./storage"),
            dispatcher: DispatcherSettings::default(),
            execution: ExecutionSettings::default(),
            log: LogSettings::default(),
        }
    }
}

/// How work is spread over processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Everything runs in the server process
    Single,
    /// One child process per tenant, bounded by `max_workers`
    Pooled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub mode: DispatchMode,
    pub max_workers: usize,
    pub prewarm: usize,
    pub readiness_timeout_ms: u64,
    pub metrics_interval_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Pooled,
            max_workers: 4,
            prewarm: 1,
            readiness_timeout_ms: 10_000,
            metrics_interval_ms: 15_000,
        }
    }
}

impl DispatcherSettings {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Delay between repeated interrupts of a script that has not yielded
    pub retry_interval_ms: u64,
    /// V8 heap cap per execution
    pub heap_limit_mb: Option<usize>,
    /// Limits applied to orders submitted from the command line
    pub default_limits: Limits,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 25,
            heap_limit_mb: Some(128),
            default_limits: Limits::default(),
        }
    }
}

impl ExecutionSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "sandpool=info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SANDPOOL_").split("__"));

        let settings: Settings = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.dispatcher.max_workers == 0 {
            return Err(Error::Config("dispatcher.max_workers must be at least 1".into()));
        }
        if self.execution.retry_interval_ms == 0 {
            return Err(Error::Config("execution.retry_interval_ms must be positive".into()));
        }
        if self.dispatcher.metrics_interval_ms == 0 {
            return Err(Error::Config("dispatcher.metrics_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load(None).map_err(|e| e.to_string())?;
            assert_eq!(settings.dispatcher.mode, DispatchMode::Pooled);
            assert_eq!(settings.execution.retry_interval(), Duration::from_millis(25));
            assert_eq!(settings.log.filter, "sandpool=info");
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sandpool.toml",
                r#"
                socket = "/run/sandpool/sandpool.sock"

                [dispatcher]
                mode = "single"
                max_workers = 2

                [execution.default_limits]
                max_execution_ms = 250
                "#,
            )?;
            jail.set_env("SANDPOOL_DISPATCHER__MAX_WORKERS", "9");

            let settings =
                Settings::load(Some(Path::new("sandpool.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(settings.socket, PathBuf::from("/run/sandpool/sandpool.sock"));
            assert_eq!(settings.dispatcher.mode, DispatchMode::Single);
            assert_eq!(settings.dispatcher.max_workers, 9);
            assert_eq!(settings.execution.default_limits.max_execution_ms, 250);
            assert_eq!(settings.execution.default_limits.max_startup_ms, 1_000);
            Ok(())
        });
    }

    #[test]
    fn test_rejects_zero_workers() {
        Jail::expect_with(|jail| {
            jail.set_env("SANDPOOL_DISPATCHER__MAX_WORKERS", "0");
            assert!(matches!(Settings::load(None), Err(Error::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_an_error() {
        Jail::expect_with(|_jail| {
            let result = Settings::load(Some(Path::new("absent.toml")));
            assert!(matches!(result, Err(Error::Config(_))));
            Ok(())
        });
    }
}
