//! Periodic launch of the news collection worker.
//!
//! The `news_schedule` config section decides whether and how often
//! `news_collection` is started. The time of the last launch is written back
//! to the same section before the launch, so a worker that fails to start is
//! retried on the next interval rather than on every check.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{MaskError, OrchestratorError};
use crate::orchestrator::{Orchestrator, StartReport};
use crate::section::ConfigSection;

pub const SCHEDULE_SECTION: &str = "news_schedule";
pub const SCHEDULED_WORKER: &str = "news_collection";

const DEFAULT_INTERVAL_HOURS: i64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct NewsSchedule {
    pub enabled: bool,
    pub interval_hours: i64,
    pub last_run: Option<DateTime<Utc>>,
}

impl NewsSchedule {
    /// Read the schedule from its section. Missing or malformed fields fall back
    /// to a disabled schedule, a three hour interval and "never ran".
    pub fn from_section(section: &ConfigSection) -> Self {
        Self {
            enabled: section
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            interval_hours: section
                .get("interval_hours")
                .and_then(Value::as_i64)
                .filter(|h| (1..=24).contains(h))
                .unwrap_or(DEFAULT_INTERVAL_HOURS),
            last_run: section.get("last_run").and_then(parse_last_run),
        }
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
            .map(|last| last + chrono::Duration::hours(self.interval_hours))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.next_run() {
            Some(next) => now >= next,
            None => true,
        }
    }
}

/// RFC 3339, or a bare ISO timestamp taken as UTC
fn parse_last_run(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// What one scheduler check did
#[derive(Debug)]
pub enum ScheduleOutcome {
    Disabled,
    NotDue { next_run: DateTime<Utc> },
    Started(StartReport),
    /// The run was due but the worker did not start (already running, missing credentials, ...)
    Skipped(OrchestratorError),
}

pub struct Scheduler<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> Scheduler<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn schedule(&self) -> Result<NewsSchedule, OrchestratorError> {
        let section = self
            .orchestrator
            .masker()
            .masked_section(SCHEDULE_SECTION)
            .await?;
        Ok(NewsSchedule::from_section(&section))
    }

    /// Start the scheduled worker if its next run is due at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ScheduleOutcome, OrchestratorError> {
        let schedule = self.schedule().await?;
        if !schedule.enabled {
            return Ok(ScheduleOutcome::Disabled);
        }
        if !schedule.is_due(now) {
            if let Some(next_run) = schedule.next_run() {
                return Ok(ScheduleOutcome::NotDue { next_run });
            }
        }

        self.orchestrator
            .masker()
            .set_field(
                SCHEDULE_SECTION,
                "last_run",
                Value::String(now.to_rfc3339()),
            )
            .await
            .map_err(|e| match e {
                MaskError::Store(e) => e.into(),
                other => OrchestratorError::InvalidRequest(other.to_string()),
            })?;

        info!("⏰ Scheduled run of {} is due", SCHEDULED_WORKER);
        match self
            .orchestrator
            .start(SCHEDULED_WORKER, ConfigSection::new())
            .await
        {
            Ok(report) => Ok(ScheduleOutcome::Started(report)),
            Err(e) => {
                debug!("Scheduled run of {} skipped: {}", SCHEDULED_WORKER, e);
                Ok(ScheduleOutcome::Skipped(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section(value: Value) -> ConfigSection {
        ConfigSection::from_value(value).unwrap()
    }

    #[test]
    fn test_from_section_defaults() {
        let schedule = NewsSchedule::from_section(&ConfigSection::new());
        assert!(!schedule.enabled);
        assert_eq!(schedule.interval_hours, 3);
        assert!(schedule.last_run.is_none());

        let schedule = NewsSchedule::from_section(&section(json!({
            "enabled": true,
            "interval_hours": 99,
            "last_run": "yesterday-ish",
        })));
        assert!(schedule.enabled);
        assert_eq!(schedule.interval_hours, 3);
        assert!(schedule.last_run.is_none());
    }

    #[test]
    fn test_last_run_formats() {
        let rfc = parse_last_run(&json!("2026-01-02T03:04:05+09:00")).unwrap();
        assert_eq!(rfc.to_rfc3339(), "2026-01-01T18:04:05+00:00");

        let naive = parse_last_run(&json!("2026-01-02T03:04:05.123456")).unwrap();
        assert_eq!(naive.format("%H:%M:%S").to_string(), "03:04:05");

        assert!(parse_last_run(&json!(null)).is_none());
    }

    #[test]
    fn test_is_due() {
        let last = DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let schedule = NewsSchedule {
            enabled: true,
            interval_hours: 2,
            last_run: Some(last),
        };
        assert!(!schedule.is_due(last + chrono::Duration::minutes(119)));
        assert!(schedule.is_due(last + chrono::Duration::hours(2)));

        let never_ran = NewsSchedule {
            last_run: None,
            ..schedule.clone()
        };
        assert!(never_ran.is_due(last));

        let disabled = NewsSchedule {
            enabled: false,
            ..schedule
        };
        assert!(!disabled.is_due(last + chrono::Duration::days(7)));
    }

    #[cfg(unix)]
    mod ticks {
        use super::*;
        use crate::launcher::{SecretChannel, WorkerLauncher};
        use crate::liveness::{LivenessMonitor, SystemMonitor};
        use crate::logs::{LogCollector, DEFAULT_MAX_BYTES};
        use crate::masking::ConfigMasker;
        use crate::orchestrator::{Components, OrchestratorSettings};
        use crate::registry::{MemoryRegistry, WorkerStatus};
        use crate::store::MemoryConfigStore;
        use crate::worker::WorkerSpec;
        use std::collections::BTreeMap;
        use std::sync::Arc;
        use tempfile::TempDir;

        fn orchestrator(dir: &TempDir, schedule: Value) -> Orchestrator {
            let mut sections = BTreeMap::new();
            sections.insert(
                "news_collection".to_string(),
                section(json!({"naver_client_id": "id", "naver_client_secret": "secret"})),
            );
            sections.insert(SCHEDULE_SECTION.to_string(), section(schedule));

            let logs = Arc::new(LogCollector::new(dir.path().join("logs"), DEFAULT_MAX_BYTES));
            let liveness: Arc<dyn LivenessMonitor> = Arc::new(SystemMonitor::new());
            let components = Components {
                masker: Arc::new(ConfigMasker::new(Arc::new(
                    MemoryConfigStore::with_sections(sections),
                ))),
                registry: Arc::new(MemoryRegistry::new()),
                liveness: liveness.clone(),
                logs: logs.clone(),
                launcher: WorkerLauncher::new(
                    dir.path().join("run"),
                    SecretChannel::Stdin,
                    logs,
                    liveness,
                ),
            };
            let worker =
                WorkerSpec::new("news_collection", "sleep", vec!["30".to_string()], "news_collection")
                    .unwrap();
            Orchestrator::new(vec![worker], components, OrchestratorSettings::default())
        }

        #[tokio::test]
        async fn test_disabled_schedule_starts_nothing() {
            let dir = TempDir::new().unwrap();
            let o = orchestrator(&dir, json!({"enabled": false, "interval_hours": 1}));

            let outcome = Scheduler::new(&o).tick(Utc::now()).await.unwrap();
            assert!(matches!(outcome, ScheduleOutcome::Disabled));
            assert_eq!(
                o.status(SCHEDULED_WORKER).await.unwrap().status,
                WorkerStatus::Stopped
            );
        }

        #[tokio::test]
        async fn test_due_run_starts_and_records_last_run() {
            let dir = TempDir::new().unwrap();
            let o = orchestrator(
                &dir,
                json!({"enabled": true, "interval_hours": 3, "last_run": null}),
            );
            let scheduler = Scheduler::new(&o);
            let now = Utc::now();

            match scheduler.tick(now).await.unwrap() {
                ScheduleOutcome::Started(report) => assert_eq!(report.name, SCHEDULED_WORKER),
                other => panic!("unexpected outcome: {other:?}"),
            }
            assert_eq!(scheduler.schedule().await.unwrap().next_run(), Some(now + chrono::Duration::hours(3)));

            match scheduler.tick(now + chrono::Duration::hours(1)).await.unwrap() {
                ScheduleOutcome::NotDue { next_run } => {
                    assert_eq!(next_run, now + chrono::Duration::hours(3))
                }
                other => panic!("unexpected outcome: {other:?}"),
            }

            // Still running from the previous launch: skipped, but the interval restarts
            let later = now + chrono::Duration::hours(3);
            match scheduler.tick(later).await.unwrap() {
                ScheduleOutcome::Skipped(OrchestratorError::AlreadyRunning { .. }) => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
            assert_eq!(scheduler.schedule().await.unwrap().last_run, Some(later));

            o.stop(SCHEDULED_WORKER).await.unwrap();
        }
    }
}
