/// Command queue on the master
///
/// Items are kept in arrival order behind a single mutex, so a push racing a
/// drain lands either in that drain or in the next one. With a journal file
/// every push is appended as one JSON line before it becomes visible, and
/// removals rewrite the journal with what is left before handing items out.
use super::CommandQueueItem;
use crate::error::SyncError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct QueueInner {
    items: Vec<CommandQueueItem>,
    mod_time: u64,
}

impl QueueInner {
    /// Strictly increasing even when the clock stalls or steps back
    fn touch(&mut self) -> u64 {
        self.mod_time = crate::utils::unix_now_ms().max(self.mod_time + 1);
        self.mod_time
    }
}

pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    journal: Option<PathBuf>,
}

impl CommandQueue {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: Vec::new(),
                mod_time: 0,
            }),
            journal: None,
        }
    }

    /// Open a journaled queue, replaying items left by a previous run
    pub async fn open<P: AsRef<Path>>(journal: P) -> Result<Self, SyncError> {
        let journal = journal.as_ref().to_path_buf();
        let items = match tokio::fs::read_to_string(&journal).await {
            Ok(content) => parse_journal(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SyncError::Journal(e.to_string())),
        };

        if !items.is_empty() {
            tracing::info!(count = items.len(), path = ?journal, "Replayed queued commands");
        }

        let mod_time = items.iter().map(|item| item.timestamp).max().unwrap_or(0);
        Ok(Self {
            inner: Mutex::new(QueueInner { items, mod_time }),
            journal: Some(journal),
        })
    }

    /// Fresh journaled queue, nothing is read back from `journal`
    pub fn journaled<P: AsRef<Path>>(journal: P) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: Vec::new(),
                mod_time: 0,
            }),
            journal: Some(journal.as_ref().to_path_buf()),
        }
    }

    /// Enqueue one item and return the new modification time
    pub async fn push(&self, item: CommandQueueItem) -> Result<u64, SyncError> {
        let mut inner = self.inner.lock().await;
        if let Some(journal) = &self.journal {
            append_line(journal, &item).await?;
        }
        inner.items.push(item);
        Ok(inner.touch())
    }

    /// Enqueue several items under one lock
    pub async fn push_all(&self, items: &[CommandQueueItem]) -> Result<u64, SyncError> {
        let mut inner = self.inner.lock().await;
        if let Some(journal) = &self.journal {
            for item in items {
                append_line(journal, item).await?;
            }
        }
        inner.items.extend_from_slice(items);
        Ok(inner.touch())
    }

    /// Remove and return every pending item
    pub async fn drain(&self) -> Result<Vec<CommandQueueItem>, SyncError> {
        let mut inner = self.inner.lock().await;
        if inner.items.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(journal) = &self.journal {
            rewrite(journal, &[]).await?;
        }
        inner.touch();
        Ok(std::mem::take(&mut inner.items))
    }

    /// Copy of the pending items, oldest first
    pub async fn peek(&self) -> Vec<CommandQueueItem> {
        self.inner.lock().await.items.clone()
    }

    /// Drop the `count` oldest items once they are safely stored elsewhere
    pub async fn remove_front(&self, count: usize) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let count = count.min(inner.items.len());
        if count == 0 {
            return Ok(());
        }
        if let Some(journal) = &self.journal {
            rewrite(journal, &inner.items[count..]).await?;
        }
        inner.items.drain(..count);
        inner.touch();
        Ok(())
    }

    /// Put items back in front of everything pending
    pub async fn prepend(&self, items: &[CommandQueueItem]) -> Result<u64, SyncError> {
        let mut inner = self.inner.lock().await;
        let mut merged = items.to_vec();
        merged.extend(inner.items.iter().cloned());
        if let Some(journal) = &self.journal {
            rewrite(journal, &merged).await?;
        }
        inner.items = merged;
        Ok(inner.touch())
    }

    /// Delete the journal file of a queue that is no longer needed
    pub async fn discard_journal(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        match tokio::fs::remove_file(journal).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, path = ?journal, "Failed to remove journal"),
        }
    }

    pub async fn mod_time(&self) -> u64 {
        self.inner.lock().await.mod_time
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Timestamp of the oldest pending item
    pub async fn oldest(&self) -> Option<u64> {
        self.inner.lock().await.items.first().map(|item| item.timestamp)
    }
}

pub(crate) fn parse_journal(content: &str) -> Vec<CommandQueueItem> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping corrupted journal line");
                None
            }
        })
        .collect()
}

fn journal_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::Journal(e.to_string())
}

async fn open_append(journal: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal)
        .await
}

async fn append_line(journal: &Path, item: &CommandQueueItem) -> Result<(), SyncError> {
    let mut line = serde_json::to_vec(item).map_err(journal_error)?;
    line.push(b'\n');

    let mut file = match open_append(journal).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = journal.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(journal_error)?;
            }
            open_append(journal).await
        }
        opened => opened,
    }
    .map_err(journal_error)?;
    file.write_all(&line)
        .await
        .map_err(|e| SyncError::Journal(e.to_string()))?;
    file.flush()
        .await
        .map_err(|e| SyncError::Journal(e.to_string()))
}

/// Replace the journal content through a temporary file and a rename
async fn rewrite(journal: &Path, items: &[CommandQueueItem]) -> Result<(), SyncError> {
    let mut content = Vec::new();
    for item in items {
        content.extend(serde_json::to_vec(item).map_err(journal_error)?);
        content.push(b'\n');
    }

    let mut tmp = journal.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &content).await.map_err(journal_error)?;
    tokio::fs::rename(&tmp, journal).await.map_err(journal_error)
}
