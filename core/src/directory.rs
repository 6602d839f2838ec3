/// User directory: searchable display names for starting conversations
/// Not authoritative for identity. Cached in memory after the first fetch.
use crate::error::{Result, SyncError};
use crate::messenger_types::DirectoryEntry;
use crate::store::{bounded, KeyedLocks, StorePath, TreeStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

const DIRECTORY_LOCK: &str = "directory";

#[derive(Clone)]
pub struct Directory {
    tree: Arc<dyn TreeStore>,
    locks: Arc<KeyedLocks>,
    cache: Arc<RwLock<Option<Vec<DirectoryEntry>>>>,
    timeout: Duration,
}

impl Directory {
    pub fn new(tree: Arc<dyn TreeStore>, timeout: Duration) -> Self {
        Self {
            tree,
            locks: Arc::new(KeyedLocks::new()),
            cache: Arc::new(RwLock::new(None)),
            timeout,
        }
    }

    fn entries_path() -> Result<StorePath> {
        StorePath::parse("directory/entries")
    }

    async fn load(&self) -> Result<Vec<DirectoryEntry>> {
        let path = Self::entries_path()?;
        match bounded(self.timeout, "directory read", self.tree.read(&path)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Add an entry; re-registering a key renames it in place
    pub async fn register(&self, entry: DirectoryEntry) -> Result<()> {
        bounded(self.timeout, "directory register", self.register_locked(entry)).await
    }

    async fn register_locked(&self, entry: DirectoryEntry) -> Result<()> {
        let _guard = self.locks.lock(DIRECTORY_LOCK).await;

        let mut entries = self.load().await?;
        match entries.iter_mut().find(|e| e.user_key == entry.user_key) {
            Some(existing) => {
                debug!("Renaming directory entry {}", entry.user_key);
                existing.display_name = entry.display_name.clone();
            }
            None => entries.push(entry.clone()),
        }

        let path = Self::entries_path()?;
        self.tree
            .replace(&path, Some(serde_json::to_value(&entries)?))
            .await?;

        // Update cache
        {
            let mut cache = self.cache.write().await;
            *cache = Some(entries);
        }

        info!("Registered {} in directory", entry.user_key);
        Ok(())
    }

    /// Case-insensitive substring search on display names
    pub async fn search(&self, query: &str) -> Result<Vec<DirectoryEntry>> {
        let term = query.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.entries().await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.display_name.to_lowercase().contains(&term))
            .collect())
    }

    /// All entries (served from cache once fetched)
    pub async fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        {
            let cache = self.cache.read().await;
            if let Some(entries) = cache.as_ref() {
                return Ok(entries.clone());
            }
        }
        self.refresh().await
    }

    /// Drop the cache and fetch from the store. Holds the directory lock so
    /// a concurrent `register` can't be overwritten by an older read.
    pub async fn refresh(&self) -> Result<Vec<DirectoryEntry>> {
        bounded(self.timeout, "directory refresh", self.refresh_locked()).await
    }

    async fn refresh_locked(&self) -> Result<Vec<DirectoryEntry>> {
        let _guard = self.locks.lock(DIRECTORY_LOCK).await;
        let entries = self.load().await?;
        let mut cache = self.cache.write().await;
        *cache = Some(entries.clone());
        Ok(entries)
    }

    pub async fn lookup(&self, user_key: &str) -> Result<DirectoryEntry> {
        self.entries()
            .await?
            .into_iter()
            .find(|e| e.user_key.as_str() == user_key)
            .ok_or_else(|| SyncError::NotFound(format!("directory entry {}", user_key)))
    }
}
