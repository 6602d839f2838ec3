/// sled-backed tree store
/// Every JSON leaf is its own sled key (`users/x/conversations/0/display_name`),
/// so a subtree is a key prefix and a subtree replace is one atomic batch.
use super::path::{validate_segment, StorePath};
use super::TreeStore;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

#[derive(Clone)]
pub struct SledTree {
    db: sled::Db,
    notifier: Arc<Notifier>,
}

impl SledTree {
    /// Open (or create) the tree database under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("tree.db");
        let db = sled::open(&db_path)
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to open tree DB: {}", e)))?;
        info!("Tree store opened at {:?}", db_path);
        Ok(Self::from_db(db))
    }

    /// In-memory instance, discarded on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to open temporary DB: {}", e)))?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            notifier: Arc::new(Notifier::default()),
        }
    }

    fn subtree_prefix(path: &StorePath) -> String {
        format!("{}/", path.as_str())
    }
}

#[async_trait]
impl TreeStore for SledTree {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>> {
        let exact = self
            .db
            .get(path.as_str().as_bytes())
            .map_err(|e| storage_err("read", e))?;

        let prefix = Self::subtree_prefix(path);
        let mut leaves = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry.map_err(|e| storage_err("scan", e))?;
            let key = String::from_utf8_lossy(&key).to_string();
            let leaf: Value = serde_json::from_slice(&value)?;
            leaves.push((key[prefix.len()..].to_string(), leaf));
        }

        if leaves.is_empty() {
            return match exact {
                Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
                None => Ok(None),
            };
        }

        Ok(Some(assemble(leaves)))
    }

    async fn replace(&self, path: &StorePath, value: Option<Value>) -> Result<()> {
        let mut batch = sled::Batch::default();

        // Clear the subtree itself and any ancestor stored as a leaf.
        batch.remove(path.as_str().as_bytes());
        for entry in self.db.scan_prefix(Self::subtree_prefix(path).as_bytes()) {
            let (key, _) = entry.map_err(|e| storage_err("scan", e))?;
            batch.remove(key);
        }
        for ancestor in path.ancestors() {
            batch.remove(ancestor.as_bytes());
        }

        let mut written = 0usize;
        if let Some(value) = value {
            let mut leaves = Vec::new();
            flatten(path.as_str(), &value, &mut leaves)?;
            written = leaves.len();
            for (key, bytes) in leaves {
                batch.insert(key.as_bytes(), bytes);
            }
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| storage_err("write", e))?;
        self.db.flush().map_err(|e| storage_err("flush", e))?;

        debug!("Replaced {} ({} leaves)", path, written);
        self.notifier.notify(path).await;
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> watch::Receiver<u64> {
        self.notifier.subscribe(path).await
    }
}

fn storage_err(op: &str, e: sled::Error) -> SyncError {
    SyncError::StoreUnavailable(format!("tree {} failed: {}", op, e))
}

/// Fan-out of change signals, one channel per watched path.
#[derive(Default)]
struct Notifier {
    channels: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl Notifier {
    async fn subscribe(&self, path: &StorePath) -> watch::Receiver<u64> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(path.as_str().to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    async fn notify(&self, written: &StorePath) {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
        for (watched, tx) in channels.iter() {
            if written.overlaps(watched) {
                tx.send_modify(|version| *version = version.wrapping_add(1));
            }
        }
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                validate_segment(key)?;
                flatten(&format!("{}/{}", prefix, key), child, out)?;
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                flatten(&format!("{}/{}", prefix, index), child, out)?;
            }
        }
        // Scalars and empty containers are stored as-is so `[]` survives.
        leaf => out.push((prefix.to_string(), serde_json::to_vec(leaf)?)),
    }
    Ok(())
}

fn assemble(leaves: Vec<(String, Value)>) -> Value {
    let mut root = Value::Object(Map::new());
    for (relative, leaf) in leaves {
        let segments: Vec<&str> = relative.split('/').collect();
        insert_leaf(&mut root, &segments, leaf);
    }
    restore_arrays(root)
}

fn insert_leaf(node: &mut Value, segments: &[&str], leaf: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.insert((*first).to_string(), leaf);
    } else {
        let child = map
            .entry((*first).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        insert_leaf(child, rest, leaf);
    }
}

/// Objects keyed exactly `0..n` were arrays before flattening.
fn restore_arrays(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut indexed: Vec<(usize, Value)> = Vec::with_capacity(map.len());
            let mut all_numeric = !map.is_empty();
            let mut rebuilt = Map::new();
            for (key, child) in map {
                let child = restore_arrays(child);
                match key.parse::<usize>() {
                    Ok(i) if all_numeric && i.to_string() == key => indexed.push((i, child.clone())),
                    _ => all_numeric = false,
                }
                rebuilt.insert(key, child);
            }
            if all_numeric {
                indexed.sort_by_key(|(i, _)| *i);
                if indexed.iter().enumerate().all(|(pos, (i, _))| pos == *i) {
                    return Value::Array(indexed.into_iter().map(|(_, v)| v).collect());
                }
            }
            Value::Object(rebuilt)
        }
        other => other,
    }
}
