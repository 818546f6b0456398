use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::section::ConfigSection;

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(2);

/// Command to start workers and supervise them until they exit or Ctrl-C
pub struct RunCommand {
    names: Vec<String>,
    config_json: Option<String>,
}

impl RunCommand {
    pub fn new(names: Vec<String>, config_json: Option<String>) -> Self {
        Self { names, config_json }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::from_env();
        let supplied = parse_supplied(self.config_json.as_deref())?;
        let orchestrator = Orchestrator::open(&config).await?;

        let names = if self.names.is_empty() {
            orchestrator.worker_names()
        } else {
            self.names.clone()
        };

        let mut printers = Vec::new();
        let mut started = Vec::new();
        for name in &names {
            let rx = orchestrator.subscribe_logs(name)?;
            printers.push(tokio::spawn(print_lines(name.clone(), rx)));

            let section = supplied.get(name).cloned().unwrap_or_default();
            match orchestrator.start(name, section).await {
                Ok(report) => {
                    info!("✅ {} is running (pid {})", name, report.pid);
                    started.push(name.clone());
                }
                Err(e) => error!("Failed to start {}: {}", name, e),
            }
        }

        if started.is_empty() {
            printers.iter().for_each(|p| p.abort());
            return Err(anyhow!("no worker could be started"));
        }
        info!(
            "Supervising {} worker(s). Press Ctrl-C to stop.",
            started.len()
        );

        tokio::pin! {
            let shutdown_signal = signal::ctrl_c();
        }
        let mut ticker = tokio::time::interval(SUPERVISE_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("🛑 Shutdown signal received. Stopping workers.");
                    for (name, result) in orchestrator.stop_all().await {
                        match result {
                            Ok(report) => info!("{} stopped ({})", name, report.termination),
                            Err(e) => error!("Failed to stop {}: {}", name, e),
                        }
                    }
                    break;
                }

                _ = ticker.tick() => {
                    let mut active = 0;
                    for name in &started {
                        match orchestrator.status(name).await {
                            Ok(report) if report.status.is_active() => active += 1,
                            Ok(report) => debug!("{} is {}", name, report.status),
                            Err(e) => warn!("Status check for {} failed: {}", name, e),
                        }
                    }
                    if active == 0 {
                        info!("All workers have exited");
                        break;
                    }
                }
            }
        }

        printers.iter().for_each(|p| p.abort());
        Ok(())
    }
}

/// `--config` is a JSON object keyed by worker name
fn parse_supplied(raw: Option<&str>) -> Result<BTreeMap<String, ConfigSection>> {
    let Some(raw) = raw else {
        return Ok(BTreeMap::new());
    };

    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(map) = value else {
        return Err(anyhow!("--config must be a JSON object keyed by worker name"));
    };

    map.into_iter()
        .map(|(name, section)| {
            ConfigSection::from_value(section)
                .map(|s| (name.clone(), s))
                .ok_or_else(|| anyhow!("config for {name} must be a JSON object"))
        })
        .collect()
}

pub(crate) async fn print_lines(name: String, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(line) => println!("[{name}] {line}"),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Skipped {} log line(s) of {}", skipped, name)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_supplied() {
        assert!(parse_supplied(None).unwrap().is_empty());

        let parsed = parse_supplied(Some(
            r#"{"news_collection": {"display_count": 50}, "row_deletion": {}}"#,
        ))
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed["news_collection"].get("display_count"),
            Some(&json!(50))
        );

        assert!(parse_supplied(Some("[1, 2]")).is_err());
        assert!(parse_supplied(Some(r#"{"news_collection": 3}"#)).is_err());
        assert!(parse_supplied(Some("not json")).is_err());
    }
}
