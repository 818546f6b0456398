use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{MaskError, StoreError};
use crate::section::ConfigSection;
use crate::store::ConfigStore;

/// Sentinel handed out in place of a secret
pub const MASKED_VALUE: &str = "***MASKED***";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Safe to show to any authenticated caller
    Plain,
    /// Never leaves the boundary in clear form
    Secret,
}

/// Static declaration of one field of a section
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    /// Dotted path inside the section. A `*` segment matches any key at that level.
    pub path: &'static str,
    pub kind: FieldKind,
    /// A worker cannot be launched without this field
    pub required: bool,
}

/// Accepted shape of a field value
#[derive(Debug, Clone, Copy)]
pub enum ValueRule {
    Integer { min: i64, max: i64 },
    OneOf(&'static [&'static str]),
    Flag,
}

#[derive(Debug, Clone, Copy)]
pub struct Constraint {
    pub path: &'static str,
    pub rule: ValueRule,
}

#[derive(Debug)]
pub struct SectionSchema {
    pub section: &'static str,
    pub fields: &'static [FieldRule],
    pub constraints: &'static [Constraint],
}

const fn secret(path: &'static str, required: bool) -> FieldRule {
    FieldRule {
        path,
        kind: FieldKind::Secret,
        required,
    }
}

const fn plain(path: &'static str, required: bool) -> FieldRule {
    FieldRule {
        path,
        kind: FieldKind::Plain,
        required,
    }
}

const fn int(path: &'static str, min: i64, max: i64) -> Constraint {
    Constraint {
        path,
        rule: ValueRule::Integer { min, max },
    }
}

const fn flag(path: &'static str) -> Constraint {
    Constraint {
        path,
        rule: ValueRule::Flag,
    }
}

/// Every known section. Fields absent from this table are plain, optional
/// and unchecked.
pub static SCHEMAS: &[SectionSchema] = &[
    SectionSchema {
        section: "news_collection",
        fields: &[
            secret("naver_client_id", true),
            secret("naver_client_secret", true),
            plain("sheet_url", false),
        ],
        constraints: &[
            int("display_count", 1, 100),
            int("max_workers", 1, 50),
            Constraint {
                path: "sort",
                rule: ValueRule::OneOf(&["date", "relevance"]),
            },
            int("keywords.*", 1, 100),
        ],
    },
    SectionSchema {
        section: "upload_monitor",
        fields: &[
            plain("site_id", true),
            secret("site_pw", true),
            secret("platforms.*.site_pw", false),
            plain("sheet_url", false),
        ],
        constraints: &[
            int("check_interval", 10, 3600),
            int("completed_column", 1, 26),
            int("concurrent_uploads", 1, 10),
            flag("platforms.*.enabled"),
            int("platforms.*.title_column", 1, 26),
            int("platforms.*.content_column", 1, 26),
            int("platforms.*.completed_column", 1, 26),
        ],
    },
    SectionSchema {
        section: "row_deletion",
        fields: &[plain("sheet_url", false)],
        constraints: &[
            int("delete_interval", 30, 3600),
            int("max_delete_count", 1, 100),
            int("completed_column", 1, 26),
        ],
    },
    SectionSchema {
        section: "news_schedule",
        fields: &[],
        constraints: &[flag("enabled"), int("interval_hours", 1, 24)],
    },
    SectionSchema {
        section: "naver_api",
        fields: &[secret("client_id", false), secret("client_secret", false)],
        constraints: &[],
    },
    SectionSchema {
        section: "newstown",
        fields: &[plain("site_id", false), secret("site_pw", false)],
        constraints: &[],
    },
    SectionSchema {
        section: "golftimes",
        fields: &[plain("site_id", false), secret("site_pw", false)],
        constraints: &[],
    },
];

/// Shared credential sections a worker falls back to when its own field is blank
pub static CREDENTIAL_SOURCES: &[CredentialSource] = &[
    CredentialSource::new("news_collection", "naver_client_id", "naver_api", "client_id"),
    CredentialSource::new("news_collection", "naver_client_secret", "naver_api", "client_secret"),
    CredentialSource::new("upload_monitor", "site_id", "newstown", "site_id"),
    CredentialSource::new("upload_monitor", "site_pw", "newstown", "site_pw"),
    CredentialSource::new("upload_monitor", "platforms.golftimes.site_id", "golftimes", "site_id"),
    CredentialSource::new("upload_monitor", "platforms.golftimes.site_pw", "golftimes", "site_pw"),
];

#[derive(Debug, Clone, Copy)]
pub struct CredentialSource {
    pub section: &'static str,
    pub path: &'static str,
    pub from_section: &'static str,
    pub from_path: &'static str,
}

impl CredentialSource {
    const fn new(
        section: &'static str,
        path: &'static str,
        from_section: &'static str,
        from_path: &'static str,
    ) -> Self {
        Self {
            section,
            path,
            from_section,
            from_path,
        }
    }
}

fn schema(section: &str) -> Option<&'static SectionSchema> {
    SCHEMAS.iter().find(|s| s.section == section)
}

pub fn schema_for(section: &str) -> &'static [FieldRule] {
    schema(section).map(|s| s.fields).unwrap_or(&[])
}

fn secret_paths(section: &str) -> impl Iterator<Item = &'static str> {
    schema_for(section)
        .iter()
        .filter(|rule| rule.kind == FieldKind::Secret)
        .map(|rule| rule.path)
}

/// Concrete paths in `section` matched by `pattern`
fn matching_paths(pattern: &str, section: &ConfigSection) -> Vec<String> {
    if !pattern.contains('*') {
        return vec![pattern.to_string()];
    }

    let segments: Vec<&str> = pattern.split('.').collect();
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Vec::new(),
    };
    let mut found = Vec::new();
    for (key, value) in section.iter() {
        if *first == "*" || first == key {
            collect_paths(value, rest, key.clone(), &mut found);
        }
    }
    found
}

fn collect_paths(value: &Value, segments: &[&str], prefix: String, found: &mut Vec<String>) {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => {
            found.push(prefix);
            return;
        }
    };
    if let Some(map) = value.as_object() {
        for (key, child) in map {
            if *first == "*" || first == key {
                collect_paths(child, rest, format!("{prefix}.{key}"), found);
            }
        }
    }
}

fn is_sentinel(value: &Value) -> bool {
    value.as_str() == Some(MASKED_VALUE)
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Replace every non-empty secret with the sentinel
pub fn mask(section_name: &str, section: &ConfigSection) -> ConfigSection {
    let mut masked = section.clone();
    for pattern in secret_paths(section_name) {
        for path in matching_paths(pattern, section) {
            if !is_blank(section.get_path(&path)) {
                masked.set_path(&path, Value::String(MASKED_VALUE.to_string()));
            }
        }
    }
    masked
}

/// Result of restoring a supplied section against the stored one
#[derive(Debug, Clone, PartialEq)]
pub struct Unmasked {
    pub section: ConfigSection,
    /// Secrets the caller explicitly changed, to be persisted before use
    pub updates: Vec<(String, Value)>,
}

/// Restore masked secrets from `stored`.
///
/// A secret equal to the sentinel keeps the stored value. A secret missing from
/// `supplied` also keeps the stored value. Any other value is an explicit update.
/// Plain fields always come from `supplied`.
pub fn unmask(section_name: &str, supplied: &ConfigSection, stored: &ConfigSection) -> Unmasked {
    let mut section = supplied.clone();
    let mut updates = Vec::new();

    let paths: BTreeSet<String> = secret_paths(section_name)
        .flat_map(|pattern| {
            let mut paths = matching_paths(pattern, supplied);
            paths.extend(matching_paths(pattern, stored));
            paths
        })
        .collect();

    for path in &paths {
        let stored_value = stored.get_path(path);
        match supplied.get_path(path) {
            Some(value) if is_sentinel(value) => match stored_value {
                Some(real) => section.set_path(path, real.clone()),
                None => {
                    section.remove_path(path);
                }
            },
            Some(value) => {
                if stored_value != Some(value) {
                    updates.push((path.clone(), value.clone()));
                }
            }
            None => {
                if let Some(real) = stored_value {
                    section.set_path(path, real.clone());
                }
            }
        }
    }

    Unmasked { section, updates }
}

/// First required field that is absent or empty
pub fn missing_required(section_name: &str, section: &ConfigSection) -> Option<&'static str> {
    schema_for(section_name)
        .iter()
        .filter(|rule| rule.required)
        .find(|rule| is_blank(section.get_path(rule.path)))
        .map(|rule| rule.path)
}

fn check_value(rule: ValueRule, value: &Value) -> Result<(), String> {
    match rule {
        ValueRule::Integer { min, max } => match value.as_i64() {
            Some(n) if (min..=max).contains(&n) => Ok(()),
            Some(n) => Err(format!("{n} is outside {min}..={max}")),
            None => Err(format!("expected an integer in {min}..={max}, got {value}")),
        },
        ValueRule::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => Ok(()),
            _ => Err(format!("expected one of {allowed:?}, got {value}")),
        },
        ValueRule::Flag => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(format!("expected true or false, got {value}")),
        },
    }
}

/// Check the constraints of `section_name` whose concrete path satisfies `selected`.
/// Absent and null fields are left to the worker's defaults.
fn validate_where<F>(section_name: &str, section: &ConfigSection, selected: F) -> Result<(), MaskError>
where
    F: Fn(&str) -> bool,
{
    let constraints = schema(section_name).map(|s| s.constraints).unwrap_or(&[]);
    for constraint in constraints {
        for path in matching_paths(constraint.path, section) {
            if !selected(&path) {
                continue;
            }
            let value = match section.get_path(&path) {
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };
            check_value(constraint.rule, value).map_err(|reason| MaskError::InvalidValue {
                section: section_name.to_string(),
                field: path.clone(),
                reason,
            })?;
        }
    }
    Ok(())
}

/// Reject the first field of `section` that breaks its section's constraints
pub fn validate(section_name: &str, section: &ConfigSection) -> Result<(), MaskError> {
    validate_where(section_name, section, |_| true)
}

/// True when `path` is `edited`, lies under it, or contains it
fn touches(path: &str, edited: &str) -> bool {
    let under = |a: &str, b: &str| a.len() > b.len() && a.starts_with(b) && a.as_bytes()[b.len()] == b'.';
    path == edited || under(path, edited) || under(edited, path)
}

/// Guards the read boundary of the config store.
///
/// All read-modify-write sequences on the store go through one lock so two
/// concurrent launches cannot lose each other's credential updates.
pub struct ConfigMasker {
    store: Arc<dyn ConfigStore>,
    lock: Mutex<()>,
}

impl ConfigMasker {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Section as shown to callers outside the trust boundary
    pub async fn masked_section(&self, name: &str) -> Result<ConfigSection, StoreError> {
        let stored = self.store.get_section(name).await?;
        Ok(mask(name, &stored))
    }

    pub async fn masked_all(&self) -> Result<BTreeMap<String, ConfigSection>, StoreError> {
        let names = self.store.section_names().await?;
        let mut all = BTreeMap::new();
        for name in names {
            let masked = self.masked_section(&name).await?;
            all.insert(name, masked);
        }
        Ok(all)
    }

    /// Clear-text section for the owner's direct edit
    pub async fn reveal(&self, name: &str) -> Result<ConfigSection, StoreError> {
        info!("Revealing clear-text config section: {}", name);
        self.store.get_section(name).await
    }

    /// Produce the configuration a worker is launched with.
    ///
    /// `supplied` is overlaid on the stored section, masked secrets are restored,
    /// explicit secret changes are persisted, and the result is returned. Nothing
    /// is persisted when a required field is missing.
    pub async fn resolve_for_launch(
        &self,
        section_name: &str,
        supplied: &ConfigSection,
    ) -> Result<ConfigSection, MaskError> {
        let _guard = self.lock.lock().await;

        let stored = self.store.get_section(section_name).await?;
        let merged = supplied.merged_over(&stored);
        let mut unmasked = unmask(section_name, &merged, &stored);
        validate(section_name, &unmasked.section)?;
        self.fill_shared_credentials(section_name, &mut unmasked.section)
            .await?;

        if let Some(field) = missing_required(section_name, &unmasked.section) {
            return Err(MaskError::MissingCredential {
                section: section_name.to_string(),
                field: field.to_string(),
            });
        }

        for (path, value) in &unmasked.updates {
            debug!("Persisting updated secret {}.{}", section_name, path);
            self.store
                .set_field(section_name, path, value.clone())
                .await?;
        }

        Ok(unmasked.section)
    }

    /// Blank credentials are taken from the shared sections in [`CREDENTIAL_SOURCES`]
    async fn fill_shared_credentials(
        &self,
        section_name: &str,
        section: &mut ConfigSection,
    ) -> Result<(), StoreError> {
        for source in CREDENTIAL_SOURCES.iter().filter(|s| s.section == section_name) {
            if !is_blank(section.get_path(source.path)) {
                continue;
            }
            // Only fill in for objects the section already declares
            if let Some((parent, _)) = source.path.rsplit_once('.') {
                if !section.get_path(parent).is_some_and(Value::is_object) {
                    continue;
                }
            }
            let shared = self.store.get_section(source.from_section).await?;
            if let Some(value) = shared.get_path(source.from_path) {
                if !is_blank(Some(value)) {
                    debug!(
                        "Using {}.{} for {}.{}",
                        source.from_section, source.from_path, section_name, source.path
                    );
                    section.set_path(source.path, value.clone());
                }
            }
        }
        Ok(())
    }

    /// Owner edit of a whole section. Returns the masked result.
    pub async fn update_section(
        &self,
        section_name: &str,
        supplied: &ConfigSection,
    ) -> Result<ConfigSection, MaskError> {
        let _guard = self.lock.lock().await;

        let stored = self.store.get_section(section_name).await?;
        let merged = supplied.merged_over(&stored);
        let unmasked = unmask(section_name, &merged, &stored);
        validate(section_name, &unmasked.section)?;

        if unmasked.section != stored {
            self.store
                .replace_section(section_name, unmasked.section.clone())
                .await?;
            info!("Updated config section: {}", section_name);
        }

        Ok(mask(section_name, &unmasked.section))
    }

    /// Owner edit of a single field. The sentinel is ignored.
    pub async fn set_field(
        &self,
        section_name: &str,
        path: &str,
        value: Value,
    ) -> Result<(), MaskError> {
        if is_sentinel(&value) {
            debug!("Ignoring masked value for {}.{}", section_name, path);
            return Ok(());
        }
        let _guard = self.lock.lock().await;

        let mut candidate = self.store.get_section(section_name).await?;
        candidate.set_path(path, value.clone());
        validate_where(section_name, &candidate, |p| touches(p, path))?;

        self.store.set_field(section_name, path, value).await?;
        Ok(())
    }
}
