use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::print_json;
use crate::config::Config;
use crate::error::{MaskError, OrchestratorError};
use crate::masking::ConfigMasker;
use crate::section::ConfigSection;
use crate::store::JsonConfigStore;

/// What to do with the stored worker configuration
#[derive(Debug, Clone)]
pub enum ConfigAction {
    /// Print one section, or all of them, with secrets masked
    Show { section: Option<String> },
    /// Print one section in clear text
    Reveal { section: String },
    /// Set one (dotted) field
    Set {
        section: String,
        path: String,
        value: String,
    },
    /// Overlay a JSON object on a section. Masked values keep the stored secret.
    Apply { section: String, json: String },
}

/// Command to inspect and edit worker configuration
pub struct ConfigCommand {
    action: ConfigAction,
}

/// Rejected values surface as structured request errors
fn rejected(e: MaskError) -> anyhow::Error {
    match e {
        MaskError::InvalidValue { .. } => OrchestratorError::InvalidRequest(e.to_string()).into(),
        MaskError::Store(e) => OrchestratorError::from(e).into(),
        other => other.into(),
    }
}

/// Values that are not valid JSON are taken as plain strings
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl ConfigCommand {
    pub fn new(action: ConfigAction) -> Self {
        Self { action }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::from_env();
        let store = JsonConfigStore::open(config.config_store_path()).await?;
        let masker = ConfigMasker::new(Arc::new(store));

        match &self.action {
            ConfigAction::Show { section: Some(name) } => {
                print_json(&masker.masked_section(name).await?)
            }
            ConfigAction::Show { section: None } => print_json(&masker.masked_all().await?),
            ConfigAction::Reveal { section } => print_json(&masker.reveal(section).await?),
            ConfigAction::Set {
                section,
                path,
                value,
            } => {
                masker
                    .set_field(section, path, parse_value(value))
                    .await
                    .map_err(rejected)?;
                info!("✅ Updated {}.{}", section, path);
                print_json(&masker.masked_section(section).await?)
            }
            ConfigAction::Apply { section, json } => {
                let supplied = ConfigSection::from_value(serde_json::from_str(json)?)
                    .ok_or_else(|| anyhow!("config for {section} must be a JSON object"))?;
                let masked = masker
                    .update_section(section, &supplied)
                    .await
                    .map_err(rejected)?;
                print_json(&masked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("30"), json!(30));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(parse_value("hunter2"), json!("hunter2"));
    }
}
