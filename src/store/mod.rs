use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::error::StoreError;
use crate::section::ConfigSection;

/// Durable key/value configuration grouped into named sections
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch a section. Unknown sections come back empty.
    async fn get_section(&self, name: &str) -> Result<ConfigSection, StoreError>;

    async fn section_names(&self) -> Result<Vec<String>, StoreError>;

    /// Set one (dotted) field and persist
    async fn set_field(&self, section: &str, path: &str, value: Value) -> Result<(), StoreError>;

    /// Overwrite a whole section and persist
    async fn replace_section(&self, section: &str, data: ConfigSection) -> Result<(), StoreError>;
}

fn validate_path(section: &str, path: &str) -> Result<(), StoreError> {
    if path.is_empty() || path.split('.').any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath {
            section: section.to_string(),
            path: path.to_string(),
        });
    }
    Ok(())
}

/// First-run contents of the store
pub fn default_sections() -> BTreeMap<String, ConfigSection> {
    let defaults = json!({
        "news_collection": {
            "display_count": 30,
            "max_workers": 10,
            "sort": "date",
            "sheet_url": "",
            "naver_client_id": "",
            "naver_client_secret": ""
        },
        "upload_monitor": {
            "check_interval": 30,
            "completed_column": 8,
            "concurrent_uploads": 1,
            "sheet_url": "",
            "site_id": "",
            "site_pw": ""
        },
        "row_deletion": {
            "delete_interval": 60,
            "max_delete_count": 10,
            "completed_column": 8,
            "sheet_url": ""
        },
        "news_schedule": {
            "enabled": false,
            "interval_hours": 3,
            "last_run": null
        },
        "naver_api": {
            "client_id": "",
            "client_secret": ""
        },
        "newstown": {
            "site_id": "",
            "site_pw": ""
        },
        "golftimes": {
            "site_id": "thegolftimes",
            "site_pw": ""
        }
    });

    match defaults {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(name, value)| ConfigSection::from_value(value).map(|s| (name, s)))
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[derive(Debug, Clone, Copy)]
enum EnvKind {
    Text,
    Integer,
}

/// Environment variables that override stored values at load time
const ENV_OVERRIDES: &[(&str, &str, &str, EnvKind)] = &[
    ("NAVER_CLIENT_ID", "news_collection", "naver_client_id", EnvKind::Text),
    ("NAVER_CLIENT_SECRET", "news_collection", "naver_client_secret", EnvKind::Text),
    ("NAVER_CLIENT_ID", "naver_api", "client_id", EnvKind::Text),
    ("NAVER_CLIENT_SECRET", "naver_api", "client_secret", EnvKind::Text),
    ("NEWSTOWN_ID", "upload_monitor", "site_id", EnvKind::Text),
    ("NEWSTOWN_PW", "upload_monitor", "site_pw", EnvKind::Text),
    ("NEWSTOWN_ID", "newstown", "site_id", EnvKind::Text),
    ("NEWSTOWN_PW", "newstown", "site_pw", EnvKind::Text),
    ("GOOGLE_SHEET_URL", "news_collection", "sheet_url", EnvKind::Text),
    ("GOOGLE_SHEET_URL", "upload_monitor", "sheet_url", EnvKind::Text),
    ("GOOGLE_SHEET_URL", "row_deletion", "sheet_url", EnvKind::Text),
    ("NEWS_DISPLAY_COUNT", "news_collection", "display_count", EnvKind::Integer),
    ("NEWS_MAX_WORKERS", "news_collection", "max_workers", EnvKind::Integer),
    ("UPLOAD_CHECK_INTERVAL", "upload_monitor", "check_interval", EnvKind::Integer),
    ("UPLOAD_COMPLETED_COLUMN", "upload_monitor", "completed_column", EnvKind::Integer),
    ("DELETE_INTERVAL", "row_deletion", "delete_interval", EnvKind::Integer),
    ("DELETE_MAX_COUNT", "row_deletion", "max_delete_count", EnvKind::Integer),
];

/// One value taken from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct EnvOverride {
    pub var: &'static str,
    pub section: &'static str,
    pub path: &'static str,
    pub value: Value,
}

/// Read [`ENV_OVERRIDES`] using `lookup`
pub fn env_overrides<F>(lookup: F) -> Vec<EnvOverride>
where
    F: Fn(&str) -> Option<String>,
{
    let mut found = Vec::new();
    for &(var, section, path, kind) in ENV_OVERRIDES {
        let raw = match lookup(var) {
            Some(raw) if !raw.is_empty() => raw,
            _ => continue,
        };
        let value = match kind {
            EnvKind::Text => Value::String(raw),
            EnvKind::Integer => match raw.trim().parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => {
                    warn!("Ignoring non-numeric {}={:?}", var, raw);
                    continue;
                }
            },
        };
        found.push(EnvOverride {
            var,
            section,
            path,
            value,
        });
    }
    found
}

fn overlay(section_name: &str, section: &mut ConfigSection, overrides: &[EnvOverride]) {
    for o in overrides.iter().filter(|o| o.section == section_name) {
        section.set_path(o.path, o.value.clone());
    }
}

/// Config store persisted as one JSON document, replaced atomically on every write.
///
/// Environment overrides sit in a layer on top of the file. Reads see them,
/// writes never carry them to disk.
pub struct JsonConfigStore {
    path: PathBuf,
    sections: Mutex<BTreeMap<String, ConfigSection>>,
    overrides: Vec<EnvOverride>,
}

impl JsonConfigStore {
    /// Load the store at `path`, creating it from defaults on first run
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_env(path, |var| env::var(var).ok()).await
    }

    pub async fn open_with_env<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref().to_path_buf();

        let mut sections = if path.exists() {
            let raw = tokio::fs::read(&path).await.map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let loaded: BTreeMap<String, ConfigSection> =
                serde_json::from_slice(&raw).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?;
            info!("Loaded config store: {:?}", path);
            loaded
        } else {
            info!("No config file found, creating defaults at {:?}", path);
            let defaults = default_sections();
            persist(&path, &defaults).await?;
            defaults
        };

        // First-run defaults for sections added after the file was created
        for (name, section) in default_sections() {
            sections.entry(name).or_insert(section);
        }
        let overrides = env_overrides(lookup);
        for o in &overrides {
            debug!("Overriding {}.{} from {}", o.section, o.path, o.var);
        }

        Ok(Self {
            path,
            sections: Mutex::new(sections),
            overrides,
        })
    }

    /// `data` with every value that came from the environment put back to what is on file
    fn strip_overrides(&self, name: &str, mut data: ConfigSection, on_file: Option<&ConfigSection>) -> ConfigSection {
        for o in self.overrides.iter().filter(|o| o.section == name) {
            if data.get_path(o.path) != Some(&o.value) {
                continue;
            }
            match on_file.and_then(|s| s.get_path(o.path)) {
                Some(original) => data.set_path(o.path, original.clone()),
                None => {
                    data.remove_path(o.path);
                }
            }
        }
        data
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn persist(path: &Path, sections: &BTreeMap<String, ConfigSection>) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(sections).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &body).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn get_section(&self, name: &str) -> Result<ConfigSection, StoreError> {
        let sections = self.sections.lock().await;
        let mut section = sections.get(name).cloned().unwrap_or_default();
        overlay(name, &mut section, &self.overrides);
        Ok(section)
    }

    async fn section_names(&self) -> Result<Vec<String>, StoreError> {
        let sections = self.sections.lock().await;
        let mut names: Vec<String> = sections.keys().cloned().collect();
        for o in &self.overrides {
            if !names.iter().any(|n| n == o.section) {
                names.push(o.section.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn set_field(&self, section: &str, path: &str, value: Value) -> Result<(), StoreError> {
        validate_path(section, path)?;
        let mut sections = self.sections.lock().await;
        let mut updated = sections.clone();
        updated
            .entry(section.to_string())
            .or_default()
            .set_path(path, value);

        // Only swap the in-memory copy once the file is on disk
        persist(&self.path, &updated).await?;
        *sections = updated;
        Ok(())
    }

    async fn replace_section(&self, section: &str, data: ConfigSection) -> Result<(), StoreError> {
        let mut sections = self.sections.lock().await;
        let data = self.strip_overrides(section, data, sections.get(section));
        let mut updated = sections.clone();
        updated.insert(section.to_string(), data);

        persist(&self.path, &updated).await?;
        *sections = updated;
        Ok(())
    }
}

/// Non-durable store for tests and embedding
#[derive(Default)]
pub struct MemoryConfigStore {
    sections: StdMutex<BTreeMap<String, ConfigSection>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sections(sections: BTreeMap<String, ConfigSection>) -> Self {
        Self {
            sections: StdMutex::new(sections),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_section(&self, name: &str) -> Result<ConfigSection, StoreError> {
        let sections = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sections.get(name).cloned().unwrap_or_default())
    }

    async fn section_names(&self) -> Result<Vec<String>, StoreError> {
        let sections = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sections.keys().cloned().collect())
    }

    async fn set_field(&self, section: &str, path: &str, value: Value) -> Result<(), StoreError> {
        validate_path(section, path)?;
        let mut sections = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        sections
            .entry(section.to_string())
            .or_default()
            .set_path(path, value);
        Ok(())
    }

    async fn replace_section(&self, section: &str, data: ConfigSection) -> Result<(), StoreError> {
        let mut sections = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        sections.insert(section.to_string(), data);
        Ok(())
    }
}
