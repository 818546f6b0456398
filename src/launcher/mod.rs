pub mod signal;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::liveness::{LivenessMonitor, ProcessIdentity};
use crate::logs::LogCollector;
use crate::section::ConfigSection;
use crate::worker::WorkerSpec;

pub use signal::{signal_group, StopSignal};

/// Env var naming the credential file when the file channel is used
pub const CONFIG_FILE_ENV: &str = "WORKER_CONFIG_FILE";

/// How long the reaper waits for output pipes to drain after exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Out-of-band channel carrying the clear-text config to a worker.
/// Secrets never travel on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretChannel {
    /// JSON document written to the child's stdin, which is then closed
    #[default]
    Stdin,
    /// Owner-only file whose path is passed in [`CONFIG_FILE_ENV`]
    File,
}

impl FromStr for SecretChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdin" => Ok(SecretChannel::Stdin),
            "file" => Ok(SecretChannel::File),
            other => Err(format!("unknown secret channel: {other}")),
        }
    }
}

/// How a launched child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

/// Handle to a freshly spawned worker process
#[derive(Debug)]
pub struct LaunchedWorker {
    pub pid: u32,
    pub identity: Option<ProcessIdentity>,
    /// Becomes `Some` once the child has been reaped
    pub exit: watch::Receiver<Option<ExitInfo>>,
}

/// Spawns worker processes and owns everything tied to a child's lifetime:
/// output pumping, config delivery and reaping.
pub struct WorkerLauncher {
    runtime_dir: PathBuf,
    channel: SecretChannel,
    logs: Arc<LogCollector>,
    liveness: Arc<dyn LivenessMonitor>,
}

impl WorkerLauncher {
    pub fn new(
        runtime_dir: impl Into<PathBuf>,
        channel: SecretChannel,
        logs: Arc<LogCollector>,
        liveness: Arc<dyn LivenessMonitor>,
    ) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            channel,
            logs,
            liveness,
        }
    }

    pub fn credential_path(&self, name: &str, launch_id: &str) -> PathBuf {
        self.runtime_dir.join(format!("{name}-{launch_id}.cred"))
    }

    /// Spawn `spec` in its own process group and hand it `config`
    pub async fn launch(
        &self,
        spec: &WorkerSpec,
        config: &ConfigSection,
        launch_id: &str,
    ) -> io::Result<LaunchedWorker> {
        let payload = config.to_canonical_json();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.env("PYTHONUNBUFFERED", "1");
        cmd.env("PYTHONIOENCODING", "utf-8");
        cmd.env("WORKER_NAME", &spec.name);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let credential_file = match self.channel {
            SecretChannel::Stdin => {
                cmd.stdin(Stdio::piped());
                None
            }
            SecretChannel::File => {
                let path = self.credential_path(&spec.name, launch_id);
                write_credential_file(&path, &payload).await?;
                cmd.env(CONFIG_FILE_ENV, &path);
                cmd.stdin(Stdio::null());
                Some(path)
            }
        };

        debug!("Spawning worker {}: {:?}", spec.name, cmd);

        // fork/exec blocks, keep it off the async workers
        let spawned = tokio::task::spawn_blocking(move || cmd.spawn())
            .await
            .map_err(io::Error::other)
            .and_then(|r| r);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if let Some(path) = &credential_file {
                    remove_credential_file(path).await;
                }
                return Err(e);
            }
        };

        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("worker exited before reporting a pid"))?;

        if let Some(mut stdin) = child.stdin.take() {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let delivered = async {
                    stdin.write_all(&payload).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.shutdown().await
                }
                .await;
                if let Err(e) = delivered {
                    warn!("Failed to deliver config to {} over stdin: {}", name, e);
                }
            });
        }

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.logs.attach(&spec.name, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.logs.attach(&spec.name, stderr));
        }

        let liveness = self.liveness.clone();
        let identity = tokio::task::spawn_blocking(move || liveness.identify(pid))
            .await
            .ok()
            .flatten();

        let (exit_tx, exit_rx) = watch::channel(None);
        let name = spec.name.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    success: status.success(),
                },
                Err(e) => {
                    warn!("Failed to wait for worker {} (pid {}): {}", name, pid, e);
                    ExitInfo {
                        code: None,
                        success: false,
                    }
                }
            };

            // Let the last lines land in the log before anyone reads the exit
            let drained = futures::future::join_all(pumps);
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained).await.is_err() {
                debug!("Output of {} still open after exit", name);
            }

            if let Some(path) = &credential_file {
                remove_credential_file(path).await;
            }
            info!("Worker {} (pid {}) exited with {:?}", name, pid, exit.code);
            exit_tx.send_replace(Some(exit));
        });

        Ok(LaunchedWorker {
            pid,
            identity,
            exit: exit_rx,
        })
    }

    /// Remove the credential file of a launch the launcher does not own
    pub async fn discard_credentials(&self, name: &str, launch_id: &str) {
        remove_credential_file(&self.credential_path(name, launch_id)).await;
    }

    /// Delete credential files left by launches not in `live`. Returns how many were removed.
    pub async fn sweep_credentials(&self, live: &HashSet<String>) -> usize {
        let pattern = format!(
            "{}/*.cred",
            glob::Pattern::escape(&self.runtime_dir.to_string_lossy())
        );
        let stale: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths
                .filter_map(Result::ok)
                .filter(|path| !is_live_credential(path, live))
                .collect(),
            Err(e) => {
                warn!("Bad credential sweep pattern {}: {}", pattern, e);
                return 0;
            }
        };

        for path in &stale {
            remove_credential_file(path).await;
        }
        if !stale.is_empty() {
            info!("🧹 Removed {} stale credential file(s)", stale.len());
        }
        stale.len()
    }
}

fn is_live_credential(path: &Path, live: &HashSet<String>) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| live.iter().any(|id| stem.ends_with(&format!("-{id}"))))
        .unwrap_or(false)
}

async fn write_credential_file(path: &Path, payload: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove_credential_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed credential file {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove credential file {:?}: {}", path, e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::liveness::SystemMonitor;
    use crate::logs::DEFAULT_MAX_BYTES;
    use serde_json::json;
    use tempfile::TempDir;

    fn launcher(temp_dir: &TempDir, channel: SecretChannel) -> (WorkerLauncher, Arc<LogCollector>) {
        let logs = Arc::new(LogCollector::new(
            temp_dir.path().join("logs"),
            DEFAULT_MAX_BYTES,
        ));
        let launcher = WorkerLauncher::new(
            temp_dir.path().join("run"),
            channel,
            logs.clone(),
            Arc::new(SystemMonitor::new()),
        );
        (launcher, logs)
    }

    fn sh(name: &str, script: &str) -> WorkerSpec {
        WorkerSpec::new(name, "sh", vec!["-c".to_string(), script.to_string()], name).unwrap()
    }

    fn config() -> ConfigSection {
        ConfigSection::from_value(json!({"site_id": "kim", "site_pw": "hunter2"})).unwrap()
    }

    async fn wait_exit(launched: &LaunchedWorker) -> ExitInfo {
        let mut exit = launched.exit.clone();
        let info = tokio::time::timeout(Duration::from_secs(10), exit.wait_for(|e| e.is_some()))
            .await
            .expect("worker did not exit")
            .unwrap();
        info.unwrap()
    }

    #[tokio::test]
    async fn test_stdin_channel_delivers_config() {
        let temp_dir = TempDir::new().unwrap();
        let (launcher, logs) = launcher(&temp_dir, SecretChannel::Stdin);

        let launched = launcher
            .launch(&sh("upload_monitor", "cat"), &config(), "l1")
            .await
            .unwrap();
        assert!(launched.pid > 0);

        let exit = wait_exit(&launched).await;
        assert!(exit.success);

        let lines = logs.tail("upload_monitor", 10).await.unwrap();
        let delivered: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(delivered["site_pw"], "hunter2");
    }

    #[tokio::test]
    async fn test_secrets_stay_off_the_command_line() {
        let temp_dir = TempDir::new().unwrap();
        let (launcher, logs) = launcher(&temp_dir, SecretChannel::Stdin);

        let launched = launcher
            .launch(&sh("upload_monitor", "echo \"$0 $*\"; cat >/dev/null"), &config(), "l2")
            .await
            .unwrap();
        wait_exit(&launched).await;

        let lines = logs.tail("upload_monitor", 10).await.unwrap();
        assert!(lines.iter().all(|l| !l.contains("hunter2")));
    }

    #[tokio::test]
    async fn test_file_channel_is_private_and_cleaned_up() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let (launcher, logs) = launcher(&temp_dir, SecretChannel::File);

        let launched = launcher
            .launch(
                &sh("news_collection", "cat \"$WORKER_CONFIG_FILE\"; sleep 1"),
                &config(),
                "l3",
            )
            .await
            .unwrap();

        let path = launcher.credential_path("news_collection", "l3");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        wait_exit(&launched).await;
        assert!(!path.exists());

        let lines = logs.tail("news_collection", 10).await.unwrap();
        assert!(lines[0].contains("hunter2"));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let (launcher, _logs) = launcher(&temp_dir, SecretChannel::File);
        let spec = WorkerSpec::new(
            "row_deletion",
            temp_dir.path().join("missing-binary"),
            vec![],
            "row_deletion",
        )
        .unwrap();

        let err = launcher.launch(&spec, &config(), "l4").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!launcher.credential_path("row_deletion", "l4").exists());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let (launcher, _logs) = launcher(&temp_dir, SecretChannel::Stdin);

        let launched = launcher
            .launch(&sh("row_deletion", "exit 3"), &config(), "l5")
            .await
            .unwrap();
        let exit = wait_exit(&launched).await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success);
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_credentials() {
        let temp_dir = TempDir::new().unwrap();
        let (launcher, _logs) = launcher(&temp_dir, SecretChannel::File);

        let run_dir = temp_dir.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(launcher.credential_path("news_collection", "live"), "{}").unwrap();
        std::fs::write(launcher.credential_path("upload_monitor", "stale"), "{}").unwrap();

        let live: HashSet<String> = ["live".to_string()].into_iter().collect();
        assert_eq!(launcher.sweep_credentials(&live).await, 1);
        assert!(launcher.credential_path("news_collection", "live").exists());
        assert!(!launcher.credential_path("upload_monitor", "stale").exists());
    }

    #[test]
    fn test_secret_channel_parsing() {
        assert_eq!("stdin".parse::<SecretChannel>(), Ok(SecretChannel::Stdin));
        assert_eq!(" FILE ".parse::<SecretChannel>(), Ok(SecretChannel::File));
        assert!("argv".parse::<SecretChannel>().is_err());
    }
}
