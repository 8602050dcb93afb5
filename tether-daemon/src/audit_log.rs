//! JSON-lines transaction log.

use std::path::{Path, PathBuf};

use tether_core::AuditEvent;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only log of [`AuditEvent`]s, one JSON object per line.
///
/// Write failures are logged and swallowed; the log never blocks a checkin.
pub struct TransactionLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl TransactionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, event: AuditEvent) {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode transaction log entry");
                return;
            }
        };
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if let Err(e) = self.append(&mut file, &line).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write transaction log");
            // Reopen on the next write.
            *file = None;
        }
    }

    async fn append(&self, file: &mut Option<File>, line: &[u8]) -> std::io::Result<()> {
        if file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *file = Some(opened);
        }
        if let Some(f) = file.as_mut() {
            f.write_all(line).await?;
            f.flush().await?;
        }
        Ok(())
    }
}
