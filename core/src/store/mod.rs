/// Hierarchical key-value store boundary
///
/// The engine assumes only three primitives on a slash-delimited tree:
/// whole-subtree read, whole-subtree replace, and change subscription.
/// No queries, no joins, no multi-path transactions.
pub mod locks;
pub mod path;
pub mod sled_tree;

pub use locks::KeyedLocks;
pub use path::StorePath;
pub use sled_tree::SledTree;

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures_util::stream::{unfold, BoxStream, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Read the whole subtree at `path`; `None` if nothing is stored there.
    async fn read(&self, path: &StorePath) -> Result<Option<serde_json::Value>>;

    /// Replace the whole subtree at `path`; `None` deletes it.
    async fn replace(&self, path: &StorePath, value: Option<serde_json::Value>) -> Result<()>;

    /// Change signal for `path`: the counter moves on every write that
    /// touches the path, an ancestor, or a descendant.
    async fn subscribe(&self, path: &StorePath) -> watch::Receiver<u64>;
}

/// Stream of full snapshots: one immediately, then one after each change.
pub type SnapshotStream<T> = BoxStream<'static, Result<T>>;

/// Run a store call under the configured deadline.
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::StoreUnavailable(format!(
            "{} timed out after {:?}",
            what, limit
        ))),
    }
}

/// Level-triggered watch: re-run `load` whenever the signal fires.
pub(crate) fn snapshots<T, F, Fut>(rx: watch::Receiver<u64>, load: F) -> SnapshotStream<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    unfold((rx, load, true), |(mut rx, load, first)| async move {
        if !first && rx.changed().await.is_err() {
            // Store dropped; nothing more will ever change.
            return None;
        }
        rx.borrow_and_update();
        let snapshot = load().await;
        Some((snapshot, (rx, load, false)))
    })
    .boxed()
}
