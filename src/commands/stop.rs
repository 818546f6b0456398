use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{error, info};

use super::print_json;
use crate::config::Config;
use crate::error::ErrorBody;
use crate::orchestrator::{Orchestrator, StopReport};

/// Command to stop one worker or every active worker
pub struct StopCommand {
    name: Option<String>,
}

#[derive(Serialize)]
struct StopAllEntry {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<StopReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl StopCommand {
    pub fn new(name: String) -> Self {
        Self { name: Some(name) }
    }

    pub fn all() -> Self {
        Self { name: None }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::from_env();
        let orchestrator = Orchestrator::open(&config).await?;

        if let Some(name) = &self.name {
            let report = orchestrator.stop(name).await?;
            return print_json(&report);
        }

        let results = orchestrator.stop_all().await;
        info!("Stopped {} worker(s)", results.len());

        let mut failures = 0;
        let entries: Vec<StopAllEntry> = results
            .into_iter()
            .map(|(name, result)| match result {
                Ok(report) => StopAllEntry {
                    name,
                    result: Some(report),
                    error: None,
                },
                Err(e) => {
                    error!("Failed to stop {}: {}", name, e);
                    failures += 1;
                    StopAllEntry {
                        name,
                        result: None,
                        error: Some(e.to_body()),
                    }
                }
            })
            .collect();
        print_json(&entries)?;

        if failures > 0 {
            return Err(anyhow!("{failures} worker(s) could not be stopped"));
        }
        Ok(())
    }
}
