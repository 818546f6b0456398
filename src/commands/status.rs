use anyhow::Result;
use tracing::debug;

use super::print_json;
use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Command to report worker status
pub struct StatusCommand {
    name: Option<String>,
}

impl StatusCommand {
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::from_env();
        let orchestrator = Orchestrator::open(&config).await?;

        match &self.name {
            Some(name) => {
                let report = orchestrator.status(name).await?;
                debug!("Status of {}: {}", name, report.status);
                print_json(&report)
            }
            None => print_json(&orchestrator.status_all().await),
        }
    }
}
