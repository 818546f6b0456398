use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Command to print (or clear) a worker's log
pub struct LogsCommand {
    name: String,
    lines: usize,
    clear: bool,
}

impl LogsCommand {
    pub fn new(name: String, lines: usize, clear: bool) -> Self {
        Self { name, lines, clear }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::from_env();
        let orchestrator = Orchestrator::open(&config).await?;

        if self.clear {
            orchestrator.clear_logs(&self.name).await?;
            info!("🧹 Cleared logs of {}", self.name);
            return Ok(());
        }

        for line in orchestrator.tail_logs(&self.name, self.lines).await? {
            println!("{line}");
        }
        Ok(())
    }
}
