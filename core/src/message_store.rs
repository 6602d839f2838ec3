/// Message log: the authoritative, append-only history of each conversation
/// Stored at `conversations/{id}/messages` as one ordered array.
use crate::error::{Result, SyncError};
use crate::messenger_types::Message;
use crate::store::{bounded, snapshots, KeyedLocks, SnapshotStream, StorePath, TreeStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Start the log if it doesn't exist yet (first message of a conversation)
    CreateIfMissing,
    /// The log must already exist
    ExistingOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at `position` (0-based)
    Appended { position: usize },
    /// Same id and payload were already stored at `position`, sent at `timestamp`
    Duplicate {
        position: usize,
        timestamp: DateTime<Utc>,
    },
}

impl AppendOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate { .. })
    }
}

#[derive(Clone)]
pub struct MessageStore {
    tree: Arc<dyn TreeStore>,
    locks: Arc<KeyedLocks>,
    timeout: Duration,
}

impl MessageStore {
    pub fn new(tree: Arc<dyn TreeStore>, timeout: Duration) -> Self {
        Self {
            tree,
            locks: Arc::new(KeyedLocks::new()),
            timeout,
        }
    }

    fn log_path(conversation_id: &str) -> Result<StorePath> {
        StorePath::parse("conversations")?
            .child(conversation_id)?
            .child("messages")
    }

    async fn load(tree: &dyn TreeStore, path: &StorePath) -> Result<Option<Vec<Message>>> {
        match tree.read(path).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Append `message` to the end of the log
    pub async fn append(
        &self,
        conversation_id: &str,
        message: &Message,
        mode: AppendMode,
    ) -> Result<AppendOutcome> {
        let path = Self::log_path(conversation_id)?;
        bounded(
            self.timeout,
            "message append",
            self.append_locked(conversation_id, &path, message, mode),
        )
        .await
    }

    async fn append_locked(
        &self,
        conversation_id: &str,
        path: &StorePath,
        message: &Message,
        mode: AppendMode,
    ) -> Result<AppendOutcome> {
        let _guard = self.locks.lock(conversation_id).await;

        let mut log = match Self::load(self.tree.as_ref(), path).await? {
            Some(log) => log,
            None if mode == AppendMode::CreateIfMissing => Vec::new(),
            None => {
                return Err(SyncError::NotFound(format!(
                    "conversation log {}",
                    conversation_id
                )))
            }
        };

        if let Some(position) = log.iter().position(|m| m.id == message.id) {
            if log[position].same_payload(message) {
                debug!(
                    "Message {} already in {} at {}",
                    message.id, conversation_id, position
                );
                return Ok(AppendOutcome::Duplicate {
                    position,
                    timestamp: log[position].timestamp,
                });
            }
            warn!(
                "Message id {} reused with a different payload in {}",
                message.id, conversation_id
            );
            return Err(SyncError::Conflict(format!(
                "message id {} already used in {}",
                message.id, conversation_id
            )));
        }

        log.push(message.clone());
        let position = log.len() - 1;
        self.tree
            .replace(path, Some(serde_json::to_value(&log)?))
            .await?;
        debug!("Appended {} to {} at {}", message.id, conversation_id, position);
        Ok(AppendOutcome::Appended { position })
    }

    /// Full log, oldest first
    pub async fn read_all(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let path = Self::log_path(conversation_id)?;
        bounded(self.timeout, "message read", Self::load(self.tree.as_ref(), &path))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conversation log {}", conversation_id)))
    }

    pub async fn exists(&self, conversation_id: &str) -> Result<bool> {
        match self.read_all(conversation_id).await {
            Ok(_) => Ok(true),
            Err(SyncError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Message with the newest timestamp (the last appended one on ties)
    pub async fn latest(&self, conversation_id: &str) -> Result<Option<Message>> {
        Ok(self
            .read_all(conversation_id)
            .await?
            .into_iter()
            .max_by_key(|m| m.timestamp))
    }

    /// Level-triggered watch; a missing log shows up as an empty snapshot
    pub async fn watch(&self, conversation_id: &str) -> Result<SnapshotStream<Vec<Message>>> {
        let path = Self::log_path(conversation_id)?;
        let rx = self.tree.subscribe(&path).await;
        let tree = self.tree.clone();
        let timeout = self.timeout;
        Ok(snapshots(rx, move || {
            let tree = tree.clone();
            let path = path.clone();
            async move {
                let log = bounded(timeout, "message watch", Self::load(tree.as_ref(), &path)).await?;
                Ok::<_, SyncError>(log.unwrap_or_default())
            }
        }))
    }
}
