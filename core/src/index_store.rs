/// Per-user conversation index (the inbox list)
/// Stored at `users/{key}/conversations`. Every mutation is a full
/// read-modify-write of that array, serialized per user key.
use crate::error::{Result, SyncError};
use crate::identity::UserKey;
use crate::messenger_types::{ConversationSummary, LatestMessage};
use crate::store::{bounded, snapshots, KeyedLocks, SnapshotStream, StorePath, TreeStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct IndexStore {
    tree: Arc<dyn TreeStore>,
    locks: Arc<KeyedLocks>,
    timeout: Duration,
}

impl IndexStore {
    pub fn new(tree: Arc<dyn TreeStore>, timeout: Duration) -> Self {
        Self {
            tree,
            locks: Arc::new(KeyedLocks::new()),
            timeout,
        }
    }

    fn index_path(user: &UserKey) -> Result<StorePath> {
        StorePath::parse("users")?
            .child(user.as_str())?
            .child("conversations")
    }

    async fn load(tree: &dyn TreeStore, path: &StorePath) -> Result<Option<Vec<ConversationSummary>>> {
        match tree.read(path).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, path: &StorePath, index: &[ConversationSummary]) -> Result<()> {
        self.tree
            .replace(path, Some(serde_json::to_value(index)?))
            .await
    }

    /// `NotFound` if this user never had a conversation
    pub async fn read_index(&self, user: &UserKey) -> Result<Vec<ConversationSummary>> {
        let path = Self::index_path(user)?;
        bounded(self.timeout, "index read", Self::load(self.tree.as_ref(), &path))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conversation index for {}", user)))
    }

    /// Absent and emptied indices both read as empty
    pub async fn read_index_or_empty(&self, user: &UserKey) -> Result<Vec<ConversationSummary>> {
        match self.read_index(user).await {
            Err(SyncError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    pub async fn find(
        &self,
        user: &UserKey,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>> {
        Ok(self
            .read_index_or_empty(user)
            .await?
            .into_iter()
            .find(|s| s.conversation_id == conversation_id))
    }

    /// Insert, or replace the entry with the same conversation id
    pub async fn upsert_summary(&self, user: &UserKey, summary: &ConversationSummary) -> Result<()> {
        bounded(self.timeout, "index upsert", self.upsert_locked(user, summary)).await
    }

    async fn upsert_locked(&self, user: &UserKey, summary: &ConversationSummary) -> Result<()> {
        let path = Self::index_path(user)?;
        let _guard = self.locks.lock(user.as_str()).await;

        let mut index = Self::load(self.tree.as_ref(), &path)
            .await?
            .unwrap_or_default();
        let matches = count_matches(&index, &summary.conversation_id);
        if matches > 1 {
            warn!(
                "Index of {} holds {} entries for {}; replacing the first",
                user, matches, summary.conversation_id
            );
        }
        match index
            .iter_mut()
            .find(|s| s.conversation_id == summary.conversation_id)
        {
            Some(existing) => *existing = summary.clone(),
            None => index.push(summary.clone()),
        }

        self.save(&path, &index).await?;
        debug!("Upserted {} into index of {}", summary.conversation_id, user);
        Ok(())
    }

    /// Replace only `latest_message` of an existing entry
    pub async fn update_latest_message(
        &self,
        user: &UserKey,
        conversation_id: &str,
        latest: &LatestMessage,
    ) -> Result<()> {
        bounded(
            self.timeout,
            "index latest-message update",
            self.update_latest_locked(user, conversation_id, latest, false),
        )
        .await
        .map(|_| ())
    }

    /// Like `update_latest_message`, but keeps a stored entry that is strictly
    /// newer. Returns whether the entry changed. Racing senders that both use
    /// this converge on the newest message.
    pub async fn advance_latest_message(
        &self,
        user: &UserKey,
        conversation_id: &str,
        latest: &LatestMessage,
    ) -> Result<bool> {
        bounded(
            self.timeout,
            "index latest-message advance",
            self.update_latest_locked(user, conversation_id, latest, true),
        )
        .await
    }

    async fn update_latest_locked(
        &self,
        user: &UserKey,
        conversation_id: &str,
        latest: &LatestMessage,
        only_if_newer: bool,
    ) -> Result<bool> {
        let path = Self::index_path(user)?;
        let _guard = self.locks.lock(user.as_str()).await;

        let mut index = Self::load(self.tree.as_ref(), &path)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conversation index for {}", user)))?;
        let entry = index
            .iter_mut()
            .find(|s| s.conversation_id == conversation_id)
            .ok_or_else(|| {
                SyncError::NotFound(format!("conversation {} in index of {}", conversation_id, user))
            })?;
        if only_if_newer && entry.latest_message.timestamp > latest.timestamp {
            debug!(
                "Kept newer latest message of {} for {}",
                conversation_id, user
            );
            return Ok(false);
        }
        entry.latest_message = latest.clone();

        self.save(&path, &index).await?;
        debug!("Updated latest message of {} for {}", conversation_id, user);
        Ok(true)
    }

    /// Remove the entry and return it
    pub async fn remove(&self, user: &UserKey, conversation_id: &str) -> Result<ConversationSummary> {
        bounded(self.timeout, "index remove", self.remove_locked(user, conversation_id)).await
    }

    async fn remove_locked(&self, user: &UserKey, conversation_id: &str) -> Result<ConversationSummary> {
        let path = Self::index_path(user)?;
        let _guard = self.locks.lock(user.as_str()).await;

        let mut index = Self::load(self.tree.as_ref(), &path)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conversation index for {}", user)))?;
        let position = index
            .iter()
            .position(|s| s.conversation_id == conversation_id)
            .ok_or_else(|| {
                SyncError::NotFound(format!("conversation {} in index of {}", conversation_id, user))
            })?;
        let removed = index.remove(position);

        let leftover = count_matches(&index, conversation_id);
        if leftover > 0 {
            warn!(
                "Index of {} still holds {} duplicate entries for {}",
                user, leftover, conversation_id
            );
        }

        self.save(&path, &index).await?;
        debug!("Removed {} from index of {}", conversation_id, user);
        Ok(removed)
    }

    /// Level-triggered watch; an absent index shows up as an empty snapshot
    pub async fn watch(&self, user: &UserKey) -> Result<SnapshotStream<Vec<ConversationSummary>>> {
        let path = Self::index_path(user)?;
        let rx = self.tree.subscribe(&path).await;
        let tree = self.tree.clone();
        let timeout = self.timeout;
        Ok(snapshots(rx, move || {
            let tree = tree.clone();
            let path = path.clone();
            async move {
                let index = bounded(timeout, "index watch", Self::load(tree.as_ref(), &path)).await?;
                Ok::<_, SyncError>(index.unwrap_or_default())
            }
        }))
    }
}

fn count_matches(index: &[ConversationSummary], conversation_id: &str) -> usize {
    index
        .iter()
        .filter(|s| s.conversation_id == conversation_id)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledTree;
    use chrono::Utc;
    use futures_util::StreamExt;

    fn store() -> IndexStore {
        IndexStore::new(Arc::new(SledTree::temporary().unwrap()), Duration::from_secs(2))
    }

    fn summary(id: &str, preview: &str) -> ConversationSummary {
        ConversationSummary {
            conversation_id: id.to_string(),
            counterpart_key: UserKey::from_raw("bob@y"),
            display_name: "Bob".to_string(),
            latest_message: LatestMessage {
                timestamp: Utc::now(),
                preview_text: preview.to_string(),
                is_read: false,
            },
        }
    }

    #[tokio::test]
    async fn test_absent_vs_emptied() {
        let store = store();
        let alice = UserKey::from_raw("alice@x");
        assert!(store.read_index(&alice).await.unwrap_err().is_not_found());

        store.upsert_summary(&alice, &summary("c1", "hi")).await.unwrap();
        store.remove(&alice, "c1").await.unwrap();
        assert!(store.read_index(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = store();
        let alice = UserKey::from_raw("alice@x");
        store.upsert_summary(&alice, &summary("c1", "hi")).await.unwrap();
        store.upsert_summary(&alice, &summary("c2", "yo")).await.unwrap();
        store.upsert_summary(&alice, &summary("c1", "again")).await.unwrap();

        let index = store.read_index(&alice).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].conversation_id, "c1");
        assert_eq!(index[0].latest_message.preview_text, "again");
    }

    #[tokio::test]
    async fn test_update_latest_only_touches_latest() {
        let store = store();
        let alice = UserKey::from_raw("alice@x");
        store.upsert_summary(&alice, &summary("c1", "hi")).await.unwrap();

        let latest = LatestMessage {
            timestamp: Utc::now(),
            preview_text: "new".to_string(),
            is_read: false,
        };
        store.update_latest_message(&alice, "c1", &latest).await.unwrap();
        let entry = store.find(&alice, "c1").await.unwrap().unwrap();
        assert_eq!(entry.latest_message, latest);
        assert_eq!(entry.display_name, "Bob");

        let err = store
            .update_latest_message(&alice, "missing", &latest)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_advance_keeps_newer_entry() {
        let store = store();
        let alice = UserKey::from_raw("alice@x");
        let newer = summary("c1", "newer");
        store.upsert_summary(&alice, &newer).await.unwrap();

        let older = LatestMessage {
            timestamp: newer.latest_message.timestamp - chrono::Duration::seconds(10),
            preview_text: "older".to_string(),
            is_read: false,
        };
        assert!(!store.advance_latest_message(&alice, "c1", &older).await.unwrap());
        let entry = store.find(&alice, "c1").await.unwrap().unwrap();
        assert_eq!(entry.latest_message.preview_text, "newer");

        // Plain update is a full replace regardless of age.
        store.update_latest_message(&alice, "c1", &older).await.unwrap();
        let entry = store.find(&alice, "c1").await.unwrap().unwrap();
        assert_eq!(entry.latest_message.preview_text, "older");
    }

    #[tokio::test]
    async fn test_remove_first_of_duplicates() {
        let tree = Arc::new(SledTree::temporary().unwrap());
        let store = IndexStore::new(tree.clone(), Duration::from_secs(2));
        let alice = UserKey::from_raw("alice@x");

        // Corrupt the index directly: two entries with the same id.
        let dup = vec![summary("c1", "first"), summary("c1", "second")];
        let path = IndexStore::index_path(&alice).unwrap();
        tree.replace(&path, Some(serde_json::to_value(&dup).unwrap()))
            .await
            .unwrap();

        let removed = store.remove(&alice, "c1").await.unwrap();
        assert_eq!(removed.latest_message.preview_text, "first");
        let left = store.read_index(&alice).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].latest_message.preview_text, "second");
    }

    #[tokio::test]
    async fn test_concurrent_upserts_lose_nothing() {
        let store = store();
        let alice = UserKey::from_raw("alice@x");

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert_summary(&alice, &summary(&format!("c{}", i), "hi"))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.read_index(&alice).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_watch_sees_updates() {
        let store = store();
        let alice = UserKey::from_raw("alice@x");
        let mut feed = store.watch(&alice).await.unwrap();
        assert!(feed.next().await.unwrap().unwrap().is_empty());

        store.upsert_summary(&alice, &summary("c1", "hi")).await.unwrap();
        let snapshot = feed.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
