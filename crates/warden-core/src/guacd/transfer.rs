//! File-transfer bookkeeping for the guacd drive-redirection path.
//!
//! Tracks in-flight uploads and downloads keyed by transfer id, with
//! offset/size/status accounting. A background sweep evicts transfers that
//! reached a terminal state longer ago than the retention window, so
//! progress stays queryable for a while after completion.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::{TRANSFER_RETENTION, TRANSFER_SWEEP_INTERVAL};
use crate::error::{Error, Result};

/// Status of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Created, no data moved yet.
    Pending,
    /// Data is flowing.
    Uploading,
    /// All bytes accounted for.
    Completed,
    /// Aborted; see the error message.
    Failed,
}

impl TransferStatus {
    /// Terminal states accept no further writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// One tracked file transfer.
#[derive(Debug, Clone, Serialize)]
pub struct FileTransfer {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub offset: u64,
    pub status: TransferStatus,
    pub is_upload: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub error: Option<String>,
}

struct TransferEntry {
    state: FileTransfer,
    file: Option<tokio::fs::File>,
    /// Client acknowledgements routed to the download pump.
    ack_tx: Option<mpsc::Sender<()>>,
    ack_rx: Option<mpsc::Receiver<()>>,
}

/// Registry of in-flight transfers, injected wherever a tunnel needs one.
pub struct FileTransferManager {
    transfers: Arc<AsyncMutex<HashMap<String, TransferEntry>>>,
    shutdown_tx: watch::Sender<bool>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FileTransferManager {
    /// Create a manager and start its sweep task.
    pub fn new() -> Self {
        Self::with_retention(TRANSFER_RETENTION)
    }

    /// Create a manager with a custom retention window.
    pub fn with_retention(retention: Duration) -> Self {
        let transfers: Arc<AsyncMutex<HashMap<String, TransferEntry>>> =
            Arc::new(AsyncMutex::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let sweep_transfers = Arc::clone(&transfers);
        let sweep_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(TRANSFER_SWEEP_INTERVAL) => {
                        let cutoff = Utc::now()
                            - chrono::Duration::from_std(retention).unwrap_or_default();
                        let mut guard = sweep_transfers.lock().await;
                        let before = guard.len();
                        guard.retain(|_, entry| {
                            !(entry.state.status.is_terminal() && entry.state.updated < cutoff)
                        });
                        let evicted = before - guard.len();
                        if evicted > 0 {
                            debug!(evicted, "Swept finished transfers");
                        }
                    }
                }
            }
        });

        Self {
            transfers,
            shutdown_tx,
            sweep_task: std::sync::Mutex::new(Some(sweep_task)),
        }
    }

    /// Validate a client-supplied filename and anchor it under the drive root.
    fn resolve(drive_path: &Path, filename: &str) -> Result<PathBuf> {
        let relative = Path::new(filename);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::FileTransfer {
                message: format!("filename escapes drive: {filename}"),
            });
        }
        Ok(drive_path.join(relative))
    }

    /// Create a tracked upload writing into the drive root.
    pub async fn create_upload(
        &self,
        session_id: &str,
        filename: &str,
        size: u64,
        drive_path: &Path,
    ) -> Result<String> {
        let full_path = Self::resolve(drive_path, filename)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&full_path).await?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let entry = TransferEntry {
            state: FileTransfer {
                id: id.clone(),
                session_id: session_id.to_string(),
                filename: filename.to_string(),
                path: full_path,
                size,
                offset: 0,
                status: TransferStatus::Pending,
                is_upload: true,
                created: now,
                updated: now,
                error: None,
            },
            file: Some(file),
            ack_tx: None,
            ack_rx: None,
        };

        self.transfers.lock().await.insert(id.clone(), entry);
        debug!(id = %id, filename, size, "Created file upload");
        Ok(id)
    }

    /// Create a tracked download reading from the drive root.
    ///
    /// Returns the transfer id and the file size.
    pub async fn create_download(
        &self,
        session_id: &str,
        filename: &str,
        drive_path: &Path,
    ) -> Result<(String, u64)> {
        let full_path = Self::resolve(drive_path, filename)?;
        let file = tokio::fs::File::open(&full_path).await?;
        let size = file.metadata().await?.len();

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let entry = TransferEntry {
            state: FileTransfer {
                id: id.clone(),
                session_id: session_id.to_string(),
                filename: filename.to_string(),
                path: full_path,
                size,
                offset: 0,
                status: TransferStatus::Pending,
                is_upload: false,
                created: now,
                updated: now,
                error: None,
            },
            file: Some(file),
            ack_tx: Some(ack_tx),
            ack_rx: Some(ack_rx),
        };

        self.transfers.lock().await.insert(id.clone(), entry);
        debug!(id = %id, filename, size, "Created file download");
        Ok((id, size))
    }

    /// Append a chunk to an upload. Returns the bytes written.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<usize> {
        let mut guard = self.transfers.lock().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| Error::FileTransfer {
                message: format!("transfer not found: {id}"),
            })?;

        if !entry.state.is_upload {
            return Err(Error::FileTransfer {
                message: "cannot write to download transfer".into(),
            });
        }
        if entry.state.status.is_terminal() {
            return Err(Error::FileTransfer {
                message: format!("transfer already {:?}", entry.state.status),
            });
        }
        if entry.state.offset + data.len() as u64 > entry.state.size {
            return Err(Error::FileTransfer {
                message: "write exceeds declared size".into(),
            });
        }

        let file = entry.file.as_mut().ok_or_else(|| Error::FileTransfer {
            message: "transfer file closed".into(),
        })?;
        file.write_all(data).await?;

        entry.state.offset += data.len() as u64;
        entry.state.status = if entry.state.offset >= entry.state.size {
            file.flush().await?;
            entry.file = None;
            TransferStatus::Completed
        } else {
            TransferStatus::Uploading
        };
        entry.state.updated = Utc::now();

        Ok(data.len())
    }

    /// Read the next chunk of a download into `buf`. Returns the bytes read;
    /// zero means end of file.
    pub async fn read_chunk(&self, id: &str, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.transfers.lock().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| Error::FileTransfer {
                message: format!("transfer not found: {id}"),
            })?;

        if entry.state.is_upload {
            return Err(Error::FileTransfer {
                message: "cannot read from upload transfer".into(),
            });
        }
        if entry.state.status == TransferStatus::Failed {
            return Err(Error::FileTransfer {
                message: "transfer failed".into(),
            });
        }

        let Some(file) = entry.file.as_mut() else {
            return Ok(0);
        };
        let n = file.read(buf).await?;

        entry.state.offset += n as u64;
        entry.state.updated = Utc::now();
        if n > 0 && entry.state.status == TransferStatus::Pending {
            entry.state.status = TransferStatus::Uploading;
        }

        Ok(n)
    }

    /// Mark a transfer completed. Idempotent; a failed transfer stays failed.
    pub async fn complete(&self, id: &str) -> Result<()> {
        let mut guard = self.transfers.lock().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| Error::FileTransfer {
                message: format!("transfer not found: {id}"),
            })?;

        if entry.state.status != TransferStatus::Failed {
            entry.state.status = TransferStatus::Completed;
        }
        entry.state.updated = Utc::now();
        entry.file = None;
        entry.ack_tx = None;
        Ok(())
    }

    /// Mark a transfer failed with a message. Idempotent; a completed
    /// transfer stays completed.
    pub async fn fail(&self, id: &str, message: &str) {
        let mut guard = self.transfers.lock().await;
        if let Some(entry) = guard.get_mut(id) {
            if !entry.state.status.is_terminal() {
                entry.state.status = TransferStatus::Failed;
                entry.state.error = Some(message.to_string());
            }
            entry.state.updated = Utc::now();
            entry.file = None;
            entry.ack_tx = None;
        }
    }

    /// Query the current state of a transfer.
    pub async fn progress(&self, id: &str) -> Option<FileTransfer> {
        self.transfers
            .lock()
            .await
            .get(id)
            .map(|e| e.state.clone())
    }

    /// Route a client acknowledgement to the waiting download pump.
    pub async fn notify_ack(&self, id: &str) {
        let tx = {
            let guard = self.transfers.lock().await;
            guard.get(id).and_then(|e| e.ack_tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(());
        }
    }

    /// Take the acknowledgement receiver for a download. The download pump
    /// calls this once when it starts streaming.
    pub async fn take_ack_rx(&self, id: &str) -> Option<mpsc::Receiver<()>> {
        self.transfers
            .lock()
            .await
            .get_mut(id)
            .and_then(|e| e.ack_rx.take())
    }

    /// Drop a transfer entirely.
    pub async fn remove(&self, id: &str) {
        self.transfers.lock().await.remove(id);
    }

    /// Number of tracked transfers.
    pub async fn count(&self) -> usize {
        self.transfers.lock().await.len()
    }

    /// Stop the sweep task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self
            .sweep_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("File transfer manager stopped");
    }
}

impl Default for FileTransferManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileTransferManager::new();

        let id = manager
            .create_upload("sess-1", "report.txt", 10, dir.path())
            .await
            .unwrap();

        assert_eq!(manager.write(&id, b"hello").await.unwrap(), 5);
        let state = manager.progress(&id).await.unwrap();
        assert_eq!(state.status, TransferStatus::Uploading);
        assert_eq!(state.offset, 5);

        assert_eq!(manager.write(&id, b"world").await.unwrap(), 5);
        let state = manager.progress(&id).await.unwrap();
        assert_eq!(state.status, TransferStatus::Completed);
        assert_eq!(state.offset, state.size);

        // Terminal state accepts no further writes.
        assert!(manager.write(&id, b"!").await.is_err());

        let written = std::fs::read(dir.path().join("report.txt")).unwrap();
        assert_eq!(written, b"helloworld");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn write_beyond_declared_size_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileTransferManager::new();

        let id = manager
            .create_upload("sess-1", "tiny.bin", 3, dir.path())
            .await
            .unwrap();
        assert!(manager.write(&id, b"toolong").await.is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileTransferManager::new();

        let id = manager
            .create_upload("sess-1", "a.txt", 1, dir.path())
            .await
            .unwrap();
        manager.write(&id, b"x").await.unwrap();
        assert_eq!(
            manager.progress(&id).await.unwrap().status,
            TransferStatus::Completed
        );

        // fail() after completion is a no-op on status.
        manager.fail(&id, "late failure").await;
        assert_eq!(
            manager.progress(&id).await.unwrap().status,
            TransferStatus::Completed
        );

        // complete() stays idempotent.
        manager.complete(&id).await.unwrap();
        assert_eq!(
            manager.progress(&id).await.unwrap().status,
            TransferStatus::Completed
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_transfer_stays_failed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileTransferManager::new();

        let id = manager
            .create_upload("sess-1", "b.txt", 100, dir.path())
            .await
            .unwrap();
        manager.fail(&id, "client vanished").await;

        manager.complete(&id).await.unwrap();
        let state = manager.progress(&id).await.unwrap();
        assert_eq!(state.status, TransferStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("client vanished"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn download_reads_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"0123456789").unwrap();
        let manager = FileTransferManager::new();

        let (id, size) = manager
            .create_download("sess-1", "data.bin", dir.path())
            .await
            .unwrap();
        assert_eq!(size, 10);

        let mut buf = [0u8; 4];
        let mut collected = Vec::new();
        loop {
            let n = manager.read_chunk(&id, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"0123456789");
        assert_eq!(manager.progress(&id).await.unwrap().offset, 10);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn filename_cannot_escape_drive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileTransferManager::new();

        assert!(
            manager
                .create_upload("sess-1", "../escape.txt", 1, dir.path())
                .await
                .is_err()
        );
        assert!(
            manager
                .create_upload("sess-1", "/etc/passwd", 1, dir.path())
                .await
                .is_err()
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn ack_routing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let manager = FileTransferManager::new();

        let (id, _) = manager
            .create_download("sess-1", "f", dir.path())
            .await
            .unwrap();
        let mut rx = manager.take_ack_rx(&id).await.unwrap();
        manager.notify_ack(&id).await;
        assert!(rx.try_recv().is_ok());
        manager.shutdown().await;
    }
}
