//! # Local question/answer archive
//!
//! Every completed exchange is appended to `<vault>/que_ans.json`:
//!
//! ```json
//! {
//!   "qas": [
//!     { "question": "What is AI?", "answer": "...", "time": "2025-05-01T10:00:00Z" }
//!   ]
//! }
//! ```
//!
//! The file is rewritten in full on each append. The new document goes to a temporary file in the
//! vault first and is then renamed over the archive, so a crash mid-write leaves the previous
//! version intact. Appends from one process are serialised by a lock.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ArchiveError;

/// File name of the archive inside the vault.
pub const ARCHIVE_FILE: &str = "que_ans.json";

/// One archived exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
    pub time: DateTime<Utc>,
}

impl QaPair {
    /// Stamp a new pair with the current time.
    pub fn new(question: &str, answer: &str) -> Self {
        Self {
            question: question.to_string(),
            answer: answer.to_string(),
            time: Utc::now(),
        }
    }
}

/// On-disk document. Insertion order is creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaFile {
    #[serde(default)]
    pub qas: Vec<QaPair>,
}

/// Handle on the archive file of one vault.
#[derive(Debug)]
pub struct QaArchive {
    path: PathBuf,
    lock: Mutex<()>,
}

impl QaArchive {
    pub fn new(vault: &Path) -> Self {
        Self {
            path: vault.join(ARCHIVE_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the archive. A missing or empty file is an empty archive.
    pub fn load(&self) -> Result<QaFile, ArchiveError> {
        read_file(&self.path)
    }

    /// [`load`](Self::load) on the blocking pool, ordered after any append in progress.
    pub async fn snapshot(&self) -> Result<QaFile, ArchiveError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        run_blocking(move || read_file(&path)).await
    }

    /// Read, append `pair`, and rewrite the whole file.
    ///
    /// # Returns
    ///
    /// The number of entries in the archive after the append.
    ///
    /// # Errors
    ///
    /// Fails if the existing file cannot be read or parsed, or the new file cannot be written. A
    /// parse failure leaves the existing file untouched.
    pub async fn append(&self, pair: QaPair) -> Result<usize, ArchiveError> {
        let _guard = self.lock.lock().await;

        let path = self.path.clone();
        let entries = run_blocking(move || {
            let mut file = read_file(&path)?;
            file.qas.push(pair);
            write_atomic(&path, &file)?;
            Ok(file.qas.len())
        })
        .await?;

        debug!(path = %self.path.display(), entries, "archive rewritten");
        Ok(entries)
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, ArchiveError>
where
    F: FnOnce() -> Result<T, ArchiveError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ArchiveError::Io(std::io::Error::other(e)))?
}

fn read_file(path: &Path) -> Result<QaFile, ArchiveError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(QaFile::default()),
        Err(e) => return Err(e.into()),
    };
    if data.trim().is_empty() {
        return Ok(QaFile::default());
    }
    Ok(serde_json::from_str(&data)?)
}

fn write_atomic(path: &Path, file: &QaFile) -> Result<(), ArchiveError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, file)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ArchiveError::Io(e.error))?;
    Ok(())
}

/// Make sure the vault directory exists and is writable.
///
/// Creates it (and any parents) when missing.
///
/// # Errors
///
/// - [`ArchiveError::NotADirectory`] if the path exists as something else
/// - [`ArchiveError::ReadOnly`] if the owner write bit is not set
pub fn ensure_vault(path: &Path) -> Result<(), ArchiveError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(path)?;
            info!(vault = %path.display(), "created vault directory");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_dir() {
        return Err(ArchiveError::NotADirectory(path.display().to_string()));
    }
    if !owner_writable(&metadata) {
        return Err(ArchiveError::ReadOnly(path.display().to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn owner_writable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o200 != 0
}

#[cfg(not(unix))]
fn owner_writable(metadata: &fs::Metadata) -> bool {
    !metadata.permissions().readonly()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_keeps_order_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let archive = QaArchive::new(dir.path());

        assert!(archive.load().unwrap().qas.is_empty(), "missing file is empty");

        assert_eq!(archive.append(QaPair::new("q1", "a1")).await.unwrap(), 1);
        assert_eq!(archive.append(QaPair::new("q2", "a2")).await.unwrap(), 2);
        assert_eq!(archive.append(QaPair::new("q1", "a1")).await.unwrap(), 3);

        let file = archive.load().unwrap();
        let questions: Vec<&str> = file.qas.iter().map(|p| p.question.as_str()).collect();
        assert_eq!(questions, vec!["q1", "q2", "q1"]);

        let raw = fs::read_to_string(archive.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["qas"][1]["answer"], "a2");
        assert!(value["qas"][0]["time"].is_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_appends_are_serialised() {
        let dir = tempfile::tempdir().unwrap();
        let archive = std::sync::Arc::new(QaArchive::new(dir.path()));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let archive = archive.clone();
                tokio::spawn(async move {
                    archive
                        .append(QaPair::new(&format!("q{i}"), &format!("a{i}")))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let file = archive.snapshot().await.unwrap();
        assert_eq!(file.qas.len(), 8, "no append lost to a concurrent rewrite");
        for i in 0..8 {
            assert!(file.qas.iter().any(|p| p.question == format!("q{i}")));
        }
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let archive = QaArchive::new(dir.path());
        fs::write(archive.path(), "{ not json").unwrap();

        let err = archive.append(QaPair::new("q", "a")).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Parse(_)), "got {err:?}");
        assert_eq!(fs::read_to_string(archive.path()).unwrap(), "{ not json");
    }

    #[test]
    fn test_empty_file_is_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = QaArchive::new(dir.path());
        fs::write(archive.path(), "  \n").unwrap();
        assert_eq!(archive.load().unwrap(), QaFile::default());
    }

    #[test]
    fn test_ensure_vault_creates_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("nested").join(".askAI");

        ensure_vault(&vault).unwrap();
        assert!(vault.is_dir());
        ensure_vault(&vault).expect("existing vault is accepted");

        let file = dir.path().join("plain");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            ensure_vault(&file),
            Err(ArchiveError::NotADirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_vault_rejects_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("ro");
        fs::create_dir(&vault).unwrap();
        fs::set_permissions(&vault, fs::Permissions::from_mode(0o555)).unwrap();

        let result = ensure_vault(&vault);
        fs::set_permissions(&vault, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(result, Err(ArchiveError::ReadOnly(_))));
    }
}
