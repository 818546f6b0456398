use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::config::Config;
use crate::error::OrchestratorError;

/// Identity of a worker kind: what to run and which config section feeds it
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub config_section: String,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("valid worker name regex"))
}

/// Worker names double as file names, so keep them to a safe alphabet
pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

impl WorkerSpec {
    pub fn new(
        name: &str,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        config_section: &str,
    ) -> Result<Self, OrchestratorError> {
        if !is_valid_name(name) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "invalid worker name: {name:?}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            program: program.into(),
            args,
            config_section: config_section.to_string(),
        })
    }
}

/// The three bundled workers, each a Python script reading its config out-of-band
pub fn default_catalog(config: &Config) -> Vec<WorkerSpec> {
    [
        ("news_collection", "run_news_collection.py"),
        ("upload_monitor", "run_upload_monitor.py"),
        ("row_deletion", "run_row_deletion.py"),
    ]
    .into_iter()
    .map(|(name, script)| WorkerSpec {
        name: name.to_string(),
        program: PathBuf::from(&config.python),
        args: vec![config.scripts_dir.join(script).to_string_lossy().into_owned()],
        config_section: name.to_string(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("news_collection"));
        assert!(is_valid_name("x"));
        assert!(!is_valid_name("../etc/passwd"));
        assert!(!is_valid_name("News"));
        assert!(!is_valid_name(""));
        assert!(WorkerSpec::new("bad name", "sh", vec![], "x").is_err());
    }

    #[test]
    fn test_default_catalog() {
        let config = Config {
            python: "/usr/bin/python3".to_string(),
            scripts_dir: PathBuf::from("/opt/workers"),
            ..Config::default()
        };
        let catalog = default_catalog(&config);

        let names: Vec<_> = catalog.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["news_collection", "upload_monitor", "row_deletion"]);

        let news = &catalog[0];
        assert_eq!(news.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(news.args, vec!["/opt/workers/run_news_collection.py".to_string()]);
        assert_eq!(news.config_section, "news_collection");
    }
}
