use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::launcher::SecretChannel;
use crate::logs::DEFAULT_MAX_BYTES;

/// Configuration for the control plane itself
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the registry, config store, logs and runtime files
    pub home: PathBuf,
    pub grace_period: Duration,
    pub kill_timeout: Duration,
    pub log_max_bytes: u64,
    /// Interpreter used to run the bundled worker scripts
    pub python: String,
    pub scripts_dir: PathBuf,
    pub secret_channel: SecretChannel,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            home: env::var("SHEPHERD_HOME")
                .map(PathBuf::from)
                .unwrap_or(defaults.home),
            grace_period: env::var("SHEPHERD_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.grace_period),
            kill_timeout: env::var("SHEPHERD_KILL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.kill_timeout),
            log_max_bytes: env::var("SHEPHERD_LOG_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_max_bytes),
            python: env::var("SHEPHERD_PYTHON").unwrap_or(defaults.python),
            scripts_dir: env::var("SHEPHERD_SCRIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scripts_dir),
            secret_channel: match env::var("SHEPHERD_SECRET_CHANNEL") {
                Ok(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!("Unknown SHEPHERD_SECRET_CHANNEL {:?}, using stdin", raw);
                    SecretChannel::Stdin
                }),
                Err(_) => defaults.secret_channel,
            },
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home.join("state").join("registry.json")
    }

    pub fn config_store_path(&self) -> PathBuf {
        self.home.join("config").join("shepherd.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Per-launch credential files live here
    pub fn runtime_dir(&self) -> PathBuf {
        self.home.join("run")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::from(".shepherd"),
            grace_period: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            log_max_bytes: DEFAULT_MAX_BYTES,
            python: "python3".to_string(),
            scripts_dir: PathBuf::from("scripts"),
            secret_channel: SecretChannel::Stdin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_home() {
        let config = Config {
            home: PathBuf::from("/srv/shepherd"),
            ..Config::default()
        };
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/srv/shepherd/state/registry.json")
        );
        assert_eq!(config.log_dir(), PathBuf::from("/srv/shepherd/logs"));
        assert_eq!(config.runtime_dir(), PathBuf::from("/srv/shepherd/run"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(config.kill_timeout, Duration::from_secs(5));
        assert_eq!(config.log_max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.secret_channel, SecretChannel::Stdin);
    }
}
