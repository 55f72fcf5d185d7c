//! Durable, ordered message log
//!
//! The whole log is kept in memory and rewritten to a single JSON document on
//! every append (write to a sibling temp file, sync, rename over the target).
//! Write cost grows with the log, which is fine at conversational scale. The
//! document carries no schema version, so layout changes are breaking.
//!
//! A log that cannot be read at startup is moved aside to
//! `<name>.corrupt-<unix ms>` before the first write, never overwritten.
//!
//! The store does no locking of its own. It is owned by the relay engine,
//! which serializes every access.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use relaychat_proto::Message;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Append-only message log backed by a JSON file
#[derive(Debug)]
pub struct LogStore {
    path: PathBuf,
    messages: Vec<Message>,
    /// The file at `path` failed to load and must be moved aside before writing
    preserve_existing: bool,
}

impl LogStore {
    /// Open the log at `path`, loading whatever was persisted there.
    ///
    /// A missing file yields an empty log. An unreadable or corrupt file also
    /// yields an empty log; the failure is logged and the file is left in
    /// place for inspection until the first append moves it aside.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let mut preserve_existing = false;
        let messages = match Self::load(&path).await {
            Ok(Some(messages)) => {
                info!(
                    path = %path.display(),
                    count = messages.len(),
                    "Loaded message log"
                );
                messages
            }
            Ok(None) => {
                info!(path = %path.display(), "No message log found, starting empty");
                Vec::new()
            }
            Err(e) => {
                error!(
                    error = %e,
                    kind = e.kind(),
                    "Message log is unreadable, starting with an empty log (file left untouched)"
                );
                preserve_existing = true;
                Vec::new()
            }
        };

        Self {
            path,
            messages,
            preserve_existing,
        }
    }

    /// Read the persisted log. `Ok(None)` means nothing was persisted yet.
    pub async fn load(path: &Path) -> Result<Option<Vec<Message>>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::startup(path, e.to_string())),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::startup(path, e.to_string()))
    }

    /// Append one message and rewrite the persisted log.
    ///
    /// The in-memory log is updated even when the write fails, so later
    /// snapshots stay consistent with what live peers have seen.
    pub async fn append(&mut self, message: Message) -> Result<()> {
        debug!(message_id = %message.id, "Appending message to log");
        self.messages.push(message);
        self.persist().await
    }

    async fn persist(&mut self) -> Result<()> {
        if self.preserve_existing {
            self.move_aside_unreadable().await?;
        }

        let bytes = serde_json::to_vec_pretty(&self.messages)
            .map_err(|e| Error::persistence(&self.path, e.into()))?;

        write_atomically(&self.path, &bytes)
            .await
            .map_err(|e| Error::persistence(&self.path, e))
    }

    async fn move_aside_unreadable(&mut self) -> Result<()> {
        let target = corrupt_path(&self.path, chrono::Utc::now().timestamp_millis())
            .map_err(|e| Error::persistence(&self.path, e))?;

        match tokio::fs::rename(&self.path, &target).await {
            Ok(()) => {
                warn!(
                    path = %self.path.display(),
                    preserved_as = %target.display(),
                    "Moved unreadable message log aside before first write"
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Unreadable message log already removed");
            }
            Err(e) => return Err(Error::persistence(&self.path, e)),
        }

        self.preserve_existing = false;
        Ok(())
    }

    /// Full ordered log as of now
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Timestamp of the most recently appended message
    #[must_use]
    pub fn last_timestamp(&self) -> Option<i64> {
        self.messages.last().map(|m| m.timestamp)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sibling_path(path: &Path, suffix: &str) -> std::io::Result<PathBuf> {
    let mut name = path
        .file_name()
        .ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidInput, "log path has no file name")
        })?
        .to_os_string();
    name.push(suffix);
    Ok(path.with_file_name(name))
}

fn temp_path(path: &Path) -> std::io::Result<PathBuf> {
    sibling_path(path, ".tmp")
}

fn corrupt_path(path: &Path, at_millis: i64) -> std::io::Result<PathBuf> {
    sibling_path(path, &format!(".corrupt-{at_millis}"))
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path)?;
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "Failed to remove temporary log file");
            }
        }
    }

    result
}
