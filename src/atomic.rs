use std::io;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Replace `path` with `contents` so readers only ever see the old or the new file.
///
/// The data is written to a sibling temp file, flushed to disk and then renamed
/// over the destination. A crash mid-write leaves at worst a stray `.tmp` file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    async_fs::create_dir_all(&dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let result = async {
        let mut file = async_fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        async_fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = async_fs::remove_file(&tmp_path).await;
    } else {
        debug!("Atomically replaced {:?}", path);
    }
    result
}

/// Move an unreadable file out of the way so the next write starts clean.
pub async fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let target = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.corrupt"),
        None => "corrupt".to_string(),
    });
    async_fs::rename(path, &target).await?;
    warn!("Quarantined unreadable file {:?} -> {:?}", path, target);
    Ok(target)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
