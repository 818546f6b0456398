use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs::{self as async_fs, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-worker log size before rotation (10 MiB)
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Upper bound for a single tail request
pub const MAX_TAIL_LINES: usize = 1000;

const SUBSCRIBER_BUFFER: usize = 1024;

/// Persists worker output and fans it out to live subscribers.
///
/// Each worker writes to `<dir>/<name>.log`. Once that file passes `max_bytes`
/// it is renamed to `<name>.log.1` (replacing the previous backup), so a worker
/// never occupies more than about twice `max_bytes` on disk.
pub struct LogCollector {
    dir: PathBuf,
    max_bytes: u64,
    channels: StdMutex<HashMap<String, Arc<LogChannel>>>,
}

struct LogChannel {
    path: PathBuf,
    max_bytes: u64,
    writer: Mutex<LogWriter>,
    tx: broadcast::Sender<String>,
}

#[derive(Default)]
struct LogWriter {
    file: Option<File>,
    size: u64,
}

impl LogChannel {
    async fn append(&self, line: &str) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = self.write_line(&mut writer, line).await {
            warn!("Failed to persist log line to {:?}: {}", self.path, e);
            writer.file = None;
        }
        drop(writer);

        // No subscribers is fine
        let _ = self.tx.send(line.to_string());
    }

    async fn write_line(&self, writer: &mut LogWriter, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if writer.file.is_none() {
            self.open(writer).await?;
        }
        if writer.size > 0 && writer.size + len > self.max_bytes {
            self.rotate(writer).await?;
            self.open(writer).await?;
        }

        if let Some(file) = writer.file.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            // tokio buffers writes; readers must see whole lines
            file.flush().await?;
            writer.size += len;
        }
        Ok(())
    }

    async fn open(&self, writer: &mut LogWriter) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        writer.size = file.metadata().await?.len();
        writer.file = Some(file);
        Ok(())
    }

    async fn rotate(&self, writer: &mut LogWriter) -> io::Result<()> {
        if let Some(mut file) = writer.file.take() {
            file.flush().await?;
        }
        async_fs::rename(&self.path, backup_path(&self.path)).await?;
        writer.size = 0;
        debug!("Rotated log file {:?}", self.path);
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

impl LogCollector {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: max_bytes.max(1),
            channels: StdMutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.log"))
    }

    fn channel(&self, name: &str) -> Arc<LogChannel> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(SUBSCRIBER_BUFFER);
                Arc::new(LogChannel {
                    path: self.log_path(name),
                    max_bytes: self.max_bytes,
                    writer: Mutex::new(LogWriter::default()),
                    tx,
                })
            })
            .clone()
    }

    /// Append one line to a worker's log
    pub async fn append(&self, name: &str, line: &str) {
        self.channel(name).append(line).await;
    }

    /// Pump a child's output stream into the worker's log until EOF
    pub fn attach<R>(&self, name: &str, stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let channel = self.channel(name);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        // Output is arbitrary bytes; keep draining whatever arrives
                        let line = String::from_utf8_lossy(trim_line_end(&buf));
                        channel.append(&line).await;
                    }
                    Err(e) => {
                        warn!("Stopped reading output of {}: {}", name, e);
                        break;
                    }
                }
            }
            debug!("Output stream of {} closed", name);
        })
    }

    /// Live stream of lines appended from now on
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<String> {
        self.channel(name).tx.subscribe()
    }

    /// Most recent `max_lines` lines, oldest first
    pub async fn tail(&self, name: &str, max_lines: usize) -> io::Result<Vec<String>> {
        if max_lines == 0 {
            return Ok(Vec::new());
        }

        let path = self.log_path(name);
        let mut lines = read_lines(&path).await?;
        if lines.len() < max_lines {
            let mut older = read_lines(&backup_path(&path)).await?;
            older.extend(lines);
            lines = older;
        }

        let start = lines.len().saturating_sub(max_lines);
        Ok(lines.split_off(start))
    }

    /// Remove a worker's log files
    pub async fn clear(&self, name: &str) -> io::Result<()> {
        let channel = self.channel(name);
        let mut writer = channel.writer.lock().await;
        writer.file = None;
        writer.size = 0;
        for path in [channel.path.clone(), backup_path(&channel.path)] {
            match async_fs::remove_file(&path).await {
                Ok(()) => info!("Removed log file: {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    match async_fs::read(path).await {
        Ok(raw) => Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
