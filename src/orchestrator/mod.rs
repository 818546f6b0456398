//! Lifecycle control for the worker catalog.
//!
//! Every worker owns a slot with its own operation lock, so operations on
//! different workers never wait on each other. Start and Stop hold the lock
//! for their whole duration; Status only peeks at the last published state and
//! reconciles it against the OS when the lock happens to be free.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{MaskError, OrchestratorError, RegistryError};
use crate::launcher::{signal_group, ExitInfo, StopSignal, WorkerLauncher};
use crate::liveness::{LivenessMonitor, ProcessIdentity, SystemMonitor};
use crate::logs::{LogCollector, MAX_TAIL_LINES};
use crate::masking::ConfigMasker;
use crate::registry::{FileRegistry, ProcessRegistry, WorkerState, WorkerStatus};
use crate::section::ConfigSection;
use crate::store::JsonConfigStore;
use crate::worker::{default_catalog, WorkerSpec};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Time a worker gets between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// Time to wait for a SIGKILLed worker to disappear
    pub kill_timeout: Duration,
    /// Liveness polling interval for workers this process did not spawn
    pub poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            grace_period: config.grace_period,
            kill_timeout: config.kill_timeout,
            ..Self::default()
        }
    }
}

/// Collaborators the orchestrator is built from
pub struct Components {
    pub masker: Arc<ConfigMasker>,
    pub registry: Arc<dyn ProcessRegistry>,
    pub liveness: Arc<dyn LivenessMonitor>,
    pub logs: Arc<LogCollector>,
    pub launcher: WorkerLauncher,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub name: String,
    pub status: WorkerStatus,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub config_fingerprint: String,
}

/// How a stopped worker went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Ignored SIGTERM and was killed
    TimeoutEscalated,
    /// Was already gone when the stop began
    AlreadyExited,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Termination::Graceful => "graceful",
            Termination::TimeoutEscalated => "timeout_escalated",
            Termination::AlreadyExited => "already_exited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub name: String,
    pub status: WorkerStatus,
    pub termination: Termination,
    /// This request observed a stop that another request performed
    pub joined: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub status: WorkerStatus,
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<i64>,
    /// Uptime as HH:MM:SS
    pub runtime: Option<String>,
    pub config_fingerprint: Option<String>,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
}

impl StatusReport {
    pub fn from_state(state: &WorkerState, now: DateTime<Utc>) -> Self {
        let running = state.status == WorkerStatus::Running;
        let uptime = state.uptime(now).map(|d| d.num_seconds());
        Self {
            name: state.name.clone(),
            status: state.status,
            running,
            pid: state.pid.filter(|_| state.status.is_active()),
            started_at: state.started_at.filter(|_| running),
            uptime_seconds: uptime,
            runtime: uptime.map(format_runtime),
            config_fingerprint: state.config_fingerprint.clone(),
            log_path: state.log_path.clone(),
            exit_code: state.exit_code,
        }
    }
}

pub fn format_runtime(seconds: i64) -> String {
    let s = seconds.max(0);
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}

/// What [`Orchestrator::recover`] found in the registry
#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub reattached: Vec<String>,
    pub crashed: Vec<String>,
    pub registry_reset: bool,
    pub swept_credentials: usize,
}

struct WorkerSlot {
    spec: WorkerSpec,
    op_lock: Mutex<()>,
    state: watch::Sender<WorkerState>,
    /// Exit notification of a child spawned by this process
    child: StdMutex<Option<watch::Receiver<Option<ExitInfo>>>>,
    stop_generation: AtomicU64,
    last_stop: StdMutex<Option<StopReport>>,
}

impl WorkerSlot {
    fn new(spec: WorkerSpec) -> Self {
        let (state, _) = watch::channel(WorkerState::stopped(&spec.name));
        Self {
            spec,
            op_lock: Mutex::new(()),
            state,
            child: StdMutex::new(None),
            stop_generation: AtomicU64::new(0),
            last_stop: StdMutex::new(None),
        }
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn snapshot(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    fn child_exit(&self) -> Option<watch::Receiver<Option<ExitInfo>>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_child(&self, exit: Option<watch::Receiver<Option<ExitInfo>>>) {
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = exit;
    }

    fn last_stop(&self) -> Option<StopReport> {
        self.last_stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn finish_stop(&self, report: Option<StopReport>) {
        *self.last_stop.lock().unwrap_or_else(|e| e.into_inner()) = report;
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
    }
}

fn ensure_startable(state: &WorkerState) -> Result<(), OrchestratorError> {
    if state.status.is_active() {
        return Err(OrchestratorError::AlreadyRunning {
            name: state.name.clone(),
            status: state.status,
            pid: state.pid,
        });
    }
    Ok(())
}

pub struct Orchestrator {
    slots: BTreeMap<String, Arc<WorkerSlot>>,
    masker: Arc<ConfigMasker>,
    registry: Arc<dyn ProcessRegistry>,
    liveness: Arc<dyn LivenessMonitor>,
    logs: Arc<LogCollector>,
    launcher: WorkerLauncher,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        catalog: Vec<WorkerSpec>,
        components: Components,
        settings: OrchestratorSettings,
    ) -> Self {
        let slots = catalog
            .into_iter()
            .map(|spec| (spec.name.clone(), Arc::new(WorkerSlot::new(spec))))
            .collect();
        Self {
            slots,
            masker: components.masker,
            registry: components.registry,
            liveness: components.liveness,
            logs: components.logs,
            launcher: components.launcher,
            settings,
        }
    }

    /// Build the production orchestrator under `config.home` and recover
    /// whatever a previous control plane left running
    pub async fn open(config: &Config) -> Result<Self, OrchestratorError> {
        let store = JsonConfigStore::open(config.config_store_path()).await?;
        let logs = Arc::new(LogCollector::new(config.log_dir(), config.log_max_bytes));
        let liveness: Arc<dyn LivenessMonitor> = Arc::new(SystemMonitor::new());
        let components = Components {
            masker: Arc::new(ConfigMasker::new(Arc::new(store))),
            registry: Arc::new(FileRegistry::new(config.registry_path())),
            liveness: liveness.clone(),
            logs: logs.clone(),
            launcher: WorkerLauncher::new(
                config.runtime_dir(),
                config.secret_channel,
                logs,
                liveness,
            ),
        };

        let orchestrator = Self::new(
            default_catalog(config),
            components,
            OrchestratorSettings::from(config),
        );
        orchestrator.recover().await?;
        Ok(orchestrator)
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn masker(&self) -> &ConfigMasker {
        &self.masker
    }

    fn slot(&self, name: &str) -> Result<&Arc<WorkerSlot>, OrchestratorError> {
        self.slots
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownWorker(name.to_string()))
    }

    /// Persist an intended transition, then publish it
    async fn commit(&self, slot: &WorkerSlot, state: WorkerState) -> Result<(), OrchestratorError> {
        self.registry.save(&state).await?;
        slot.state.send_replace(state);
        Ok(())
    }

    /// Publish a transition that already happened in the world, persisting it if possible
    async fn record(&self, slot: &WorkerSlot, state: WorkerState) {
        if let Err(e) = self.registry.save(&state).await {
            error!(
                "Registry is out of date for {} ({}): {}",
                state.name, state.status, e
            );
        }
        slot.state.send_replace(state);
    }

    async fn check_alive(&self, pid: u32, identity: Option<ProcessIdentity>) -> bool {
        let liveness = self.liveness.clone();
        tokio::task::spawn_blocking(move || liveness.is_alive(pid, identity.as_ref()))
            .await
            .unwrap_or(false)
    }

    /// Launch `name` with `supplied` overlaid on its stored config section
    pub async fn start(
        &self,
        name: &str,
        supplied: ConfigSection,
    ) -> Result<StartReport, OrchestratorError> {
        let slot = self.slot(name)?;
        // Mid-transition: no point queueing behind it
        let seen = slot.snapshot();
        if matches!(seen.status, WorkerStatus::Starting | WorkerStatus::Stopping) {
            ensure_startable(&seen)?;
        }

        let _guard = slot.op_lock.lock().await;
        // A "running" snapshot may describe a process that died since
        self.reconcile(slot).await;
        let current = slot.snapshot();
        ensure_startable(&current)?;

        let config = self
            .masker
            .resolve_for_launch(&slot.spec.config_section, &supplied)
            .await
            .map_err(|e| match e {
                MaskError::MissingCredential { section, field } => {
                    warn!("Refusing to start {}: {}.{} is not set", name, section, field);
                    OrchestratorError::MissingCredential {
                        section,
                        field,
                        status: current.status,
                    }
                }
                e @ MaskError::InvalidValue { .. } => {
                    OrchestratorError::InvalidRequest(e.to_string())
                }
                MaskError::Store(e) => e.into(),
            })?;

        let fingerprint = config.fingerprint();
        let launch_id = Uuid::new_v4().to_string();
        let starting = WorkerState {
            status: WorkerStatus::Starting,
            config_fingerprint: Some(fingerprint.clone()),
            log_path: Some(self.logs.log_path(name)),
            launch_id: Some(launch_id.clone()),
            ..WorkerState::stopped(name)
        };
        self.commit(slot, starting.clone()).await?;
        self.logs
            .append(name, &format!("[shepherd] starting {name} (launch {launch_id})"))
            .await;

        let launched = match self.launcher.launch(&slot.spec, &config, &launch_id).await {
            Ok(launched) => launched,
            Err(source) => {
                error!("❌ Failed to launch {}: {}", name, source);
                self.logs
                    .append(name, &format!("[shepherd] launch failed: {source}"))
                    .await;
                let stopped = WorkerState {
                    status: WorkerStatus::Stopped,
                    ..starting
                };
                self.record(slot, stopped).await;
                return Err(OrchestratorError::LaunchFailed {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let pid = launched.pid;
        let started_at = Utc::now();
        slot.set_child(Some(launched.exit));
        let running = WorkerState {
            status: WorkerStatus::Running,
            pid: Some(pid),
            started_at: Some(started_at),
            identity: launched.identity,
            ..starting
        };
        self.record(slot, running).await;
        info!("🚀 Started {} (pid {})", name, pid);

        Ok(StartReport {
            name: name.to_string(),
            status: WorkerStatus::Running,
            pid,
            started_at,
            config_fingerprint: fingerprint,
        })
    }

    /// Stop `name`: SIGTERM, then SIGKILL once the grace period runs out.
    ///
    /// A stop issued while another is in flight waits for it and reports its outcome.
    pub async fn stop(&self, name: &str) -> Result<StopReport, OrchestratorError> {
        let slot = self.slot(name)?;
        let generation = slot.stop_generation.load(Ordering::SeqCst);
        if slot.snapshot().status == WorkerStatus::Stopping {
            return self.join_stop(slot).await;
        }

        let _guard = slot.op_lock.lock().await;
        if slot.stop_generation.load(Ordering::SeqCst) != generation {
            if let Some(report) = slot.last_stop() {
                debug!("Stop of {} completed while waiting, joining it", name);
                return Ok(StopReport {
                    joined: true,
                    ..report
                });
            }
        }

        let current = slot.snapshot();
        if !current.status.is_active() {
            return Err(OrchestratorError::NotRunning {
                name: name.to_string(),
                status: current.status,
            });
        }
        self.stop_locked(slot, current).await
    }

    async fn join_stop(&self, slot: &WorkerSlot) -> Result<StopReport, OrchestratorError> {
        debug!("Joining in-flight stop of {}", slot.name());
        let mut rx = slot.state.subscribe();
        let status = rx
            .wait_for(|s| s.status != WorkerStatus::Stopping)
            .await
            .map(|s| s.status)
            .unwrap_or(WorkerStatus::Stopping);

        match (status, slot.last_stop()) {
            (WorkerStatus::Stopped, Some(report)) => Ok(StopReport {
                joined: true,
                ..report
            }),
            (status, _) => Err(OrchestratorError::StopFailed {
                name: slot.name().to_string(),
                reason: "concurrent stop did not terminate the worker".to_string(),
                status,
            }),
        }
    }

    async fn stop_locked(
        &self,
        slot: &WorkerSlot,
        current: WorkerState,
    ) -> Result<StopReport, OrchestratorError> {
        let name = slot.name();
        self.commit(
            slot,
            WorkerState {
                status: WorkerStatus::Stopping,
                ..current.clone()
            },
        )
        .await?;
        info!("🛑 Stopping {} (pid {:?})", name, current.pid);

        let exit = slot.child_exit();
        let outcome = match current.pid {
            Some(pid) => {
                self.terminate(name, pid, current.identity.as_ref(), exit.clone())
                    .await
            }
            None => Ok(Termination::AlreadyExited),
        };

        match outcome {
            Ok(termination) => {
                let exit_code = exit.as_ref().and_then(|rx| *rx.borrow()).and_then(|e| e.code);
                slot.set_child(None);
                if let Some(launch_id) = &current.launch_id {
                    self.launcher.discard_credentials(name, launch_id).await;
                }

                let report = StopReport {
                    name: name.to_string(),
                    status: WorkerStatus::Stopped,
                    termination,
                    joined: false,
                };
                slot.finish_stop(Some(report.clone()));
                let stopped = WorkerState {
                    status: WorkerStatus::Stopped,
                    pid: None,
                    started_at: None,
                    identity: None,
                    exit_code,
                    ..current
                };
                self.record(slot, stopped).await;
                self.logs
                    .append(name, &format!("[shepherd] stopped ({termination})"))
                    .await;
                info!("✅ Stopped {} ({})", name, termination);
                Ok(report)
            }
            Err(reason) => {
                error!("Failed to stop {}: {}", name, reason);
                slot.finish_stop(None);
                self.record(
                    slot,
                    WorkerState {
                        status: WorkerStatus::Running,
                        ..current
                    },
                )
                .await;
                Err(OrchestratorError::StopFailed {
                    name: name.to_string(),
                    reason,
                    status: WorkerStatus::Running,
                })
            }
        }
    }

    async fn terminate(
        &self,
        name: &str,
        pid: u32,
        identity: Option<&ProcessIdentity>,
        exit: Option<watch::Receiver<Option<ExitInfo>>>,
    ) -> Result<Termination, String> {
        // Never signal a PID that no longer belongs to the worker
        let running = match &exit {
            Some(rx) => rx.borrow().is_none(),
            None => self.check_alive(pid, identity.cloned()).await,
        };
        if !running {
            return Ok(Termination::AlreadyExited);
        }

        match signal_group(pid, StopSignal::Terminate) {
            Ok(true) => {}
            Ok(false) => return Ok(Termination::AlreadyExited),
            Err(e) => return Err(format!("failed to send SIGTERM: {e}")),
        }
        if self
            .wait_for_exit(pid, identity, exit.clone(), self.settings.grace_period)
            .await
        {
            return Ok(Termination::Graceful);
        }

        warn!(
            "⏱️ {} ignored SIGTERM for {:?}, sending SIGKILL",
            name, self.settings.grace_period
        );
        if let Err(e) = signal_group(pid, StopSignal::Kill) {
            return Err(format!("failed to send SIGKILL: {e}"));
        }
        if self
            .wait_for_exit(pid, identity, exit, self.settings.kill_timeout)
            .await
        {
            Ok(Termination::TimeoutEscalated)
        } else {
            Err(format!(
                "pid {pid} still alive {:?} after SIGKILL",
                self.settings.kill_timeout
            ))
        }
    }

    async fn wait_for_exit(
        &self,
        pid: u32,
        identity: Option<&ProcessIdentity>,
        exit: Option<watch::Receiver<Option<ExitInfo>>>,
        limit: Duration,
    ) -> bool {
        if let Some(mut rx) = exit {
            // A closed channel means the reaper is gone, so the child is too
            let exited = timeout(limit, rx.wait_for(|e| e.is_some())).await.is_ok();
            return exited;
        }

        let deadline = Instant::now() + limit;
        loop {
            if !self.check_alive(pid, identity.cloned()).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Stop every active worker concurrently
    pub async fn stop_all(&self) -> Vec<(String, Result<StopReport, OrchestratorError>)> {
        let mut active = Vec::new();
        for (name, slot) in &self.slots {
            // Dead workers are reported crashed, not stopped
            if let Ok(_guard) = slot.op_lock.try_lock() {
                self.reconcile(slot).await;
            }
            if slot.snapshot().status.is_active() {
                active.push(name.as_str());
            }
        }
        if active.is_empty() {
            debug!("No active workers to stop");
        }

        let stops = active
            .into_iter()
            .map(|name| async move { (name.to_string(), self.stop(name).await) });
        futures::future::join_all(stops).await
    }

    pub async fn status(&self, name: &str) -> Result<StatusReport, OrchestratorError> {
        let slot = self.slot(name)?;
        // A busy slot is mid-transition and already publishing fresh state
        if let Ok(_guard) = slot.op_lock.try_lock() {
            self.reconcile(slot).await;
        }
        Ok(StatusReport::from_state(&slot.snapshot(), Utc::now()))
    }

    pub async fn status_all(&self) -> Vec<StatusReport> {
        let mut reports = Vec::with_capacity(self.slots.len());
        for name in self.slots.keys() {
            if let Ok(report) = self.status(name).await {
                reports.push(report);
            }
        }
        reports
    }

    /// Detect a worker that died behind our back. Caller holds the op lock.
    async fn reconcile(&self, slot: &WorkerSlot) {
        let current = slot.snapshot();
        let pid = match (current.status, current.pid) {
            (WorkerStatus::Running, Some(pid)) => pid,
            _ => return,
        };

        let exit = match slot.child_exit() {
            Some(rx) => {
                let recorded = *rx.borrow();
                match recorded {
                    Some(exit) => Some(exit),
                    None => return,
                }
            }
            None => {
                if self.check_alive(pid, current.identity.clone()).await {
                    return;
                }
                None
            }
        };

        let clean_exit = exit.map(|e| e.success).unwrap_or(false);
        let status = if clean_exit || self.stopped_elsewhere(&current).await {
            info!("Worker {} (pid {}) has exited", current.name, pid);
            WorkerStatus::Stopped
        } else {
            warn!("💥 Worker {} (pid {}) is no longer running", current.name, pid);
            WorkerStatus::Crashed
        };

        slot.set_child(None);
        if let Some(launch_id) = &current.launch_id {
            self.launcher
                .discard_credentials(&current.name, launch_id)
                .await;
        }
        self.logs
            .append(&current.name, &format!("[shepherd] worker exited ({status})"))
            .await;

        let next = WorkerState {
            status,
            pid: None,
            identity: None,
            exit_code: exit.and_then(|e| e.code),
            ..current
        };
        self.record(slot, next).await;
    }

    /// Another control-plane process already stopped this launch
    async fn stopped_elsewhere(&self, state: &WorkerState) -> bool {
        match self.registry.load_all().await {
            Ok(records) => records.get(&state.name).is_some_and(|record| {
                record.launch_id == state.launch_id
                    && matches!(
                        record.status,
                        WorkerStatus::Stopping | WorkerStatus::Stopped
                    )
            }),
            Err(_) => false,
        }
    }

    /// Most recent `lines` lines of a worker's output
    pub async fn tail_logs(&self, name: &str, lines: usize) -> Result<Vec<String>, OrchestratorError> {
        self.slot(name)?;
        if !(1..=MAX_TAIL_LINES).contains(&lines) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "lines must be between 1 and {MAX_TAIL_LINES}, got {lines}"
            )));
        }
        self.logs
            .tail(name, lines)
            .await
            .map_err(|source| OrchestratorError::Logs {
                name: name.to_string(),
                source,
            })
    }

    /// Delete a worker's log files
    pub async fn clear_logs(&self, name: &str) -> Result<(), OrchestratorError> {
        self.slot(name)?;
        self.logs
            .clear(name)
            .await
            .map_err(|source| OrchestratorError::Logs {
                name: name.to_string(),
                source,
            })
    }

    pub fn subscribe_logs(
        &self,
        name: &str,
    ) -> Result<broadcast::Receiver<String>, OrchestratorError> {
        self.slot(name)?;
        Ok(self.logs.subscribe(name))
    }

    /// Rebuild in-memory state from the registry after a restart
    pub async fn recover(&self) -> Result<RecoverySummary, OrchestratorError> {
        let mut summary = RecoverySummary::default();

        let records = match self.registry.load_all().await {
            Ok(records) => records,
            Err(RegistryError::Corrupt { path, reason }) => {
                warn!(
                    "⚠️ Registry {:?} is corrupt ({}), assuming every worker is stopped",
                    path, reason
                );
                self.registry.reset().await?;
                summary.registry_reset = true;
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut live_launches = HashSet::new();
        for (name, record) in records {
            let slot = match self.slots.get(&name) {
                Some(slot) => slot,
                None => {
                    warn!("Ignoring registry entry for unknown worker {}", name);
                    continue;
                }
            };
            let _guard = slot.op_lock.lock().await;

            if !record.status.is_active() {
                slot.state.send_replace(record);
                continue;
            }

            let alive = match record.pid {
                Some(pid) => self.check_alive(pid, record.identity.clone()).await,
                None => false,
            };

            let next = if alive {
                info!("🔗 Reattached to {} (pid {:?})", name, record.pid);
                if let Some(launch_id) = &record.launch_id {
                    live_launches.insert(launch_id.clone());
                }
                summary.reattached.push(name.clone());
                WorkerState {
                    status: WorkerStatus::Running,
                    ..record.clone()
                }
            } else {
                // A dead worker that was being stopped simply finished stopping
                let status = if record.status == WorkerStatus::Running {
                    warn!("💥 {} (pid {:?}) died while unsupervised", name, record.pid);
                    summary.crashed.push(name.clone());
                    WorkerStatus::Crashed
                } else {
                    WorkerStatus::Stopped
                };
                WorkerState {
                    status,
                    pid: None,
                    identity: None,
                    ..record.clone()
                }
            };

            if next == record {
                slot.state.send_replace(next);
                continue;
            }
            // Another control plane may have written since we read
            match self.registry.replace_if(&record, &next).await {
                Ok(stored) => {
                    if stored != next {
                        debug!("Registry entry for {} changed during recovery", name);
                    }
                    slot.state.send_replace(stored);
                }
                Err(e) => {
                    error!("Failed to persist recovered state of {}: {}", name, e);
                    slot.state.send_replace(next);
                }
            }
        }

        summary.swept_credentials = self.launcher.sweep_credentials(&live_launches).await;
        Ok(summary)
    }
}
