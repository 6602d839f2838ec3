/// Account registration: profile record plus directory entry
use crate::directory::Directory;
use crate::error::{Result, SyncError};
use crate::identity::UserKey;
use crate::messenger_types::{DirectoryEntry, UserProfile};
use crate::store::{bounded, StorePath, TreeStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Clone)]
pub struct Accounts {
    tree: Arc<dyn TreeStore>,
    directory: Directory,
    timeout: Duration,
}

impl Accounts {
    pub fn new(tree: Arc<dyn TreeStore>, directory: Directory, timeout: Duration) -> Self {
        Self {
            tree,
            directory,
            timeout,
        }
    }

    fn profile_path(key: &UserKey) -> Result<StorePath> {
        StorePath::parse("users")?.child(key.as_str())?.child("profile")
    }

    /// Write the profile, then make the user findable
    pub async fn register(&self, account: &NewAccount) -> Result<UserKey> {
        let key = UserKey::parse(&account.email)?;
        let profile = UserProfile {
            first_name: account.first_name.clone(),
            last_name: account.last_name.clone(),
            email: account.email.clone(),
        };

        let path = Self::profile_path(&key)?;
        bounded(
            self.timeout,
            "profile write",
            self.tree.replace(&path, Some(serde_json::to_value(&profile)?)),
        )
        .await?;

        self.directory
            .register(DirectoryEntry {
                display_name: profile.display_name(),
                user_key: key.clone(),
            })
            .await?;

        info!("Registered account {}", key);
        Ok(key)
    }

    pub async fn profile(&self, raw_account: &str) -> Result<UserProfile> {
        let key = UserKey::parse(raw_account)?;
        let path = Self::profile_path(&key)?;
        match bounded(self.timeout, "profile read", self.tree.read(&path)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(SyncError::NotFound(format!("user {}", key))),
        }
    }

    pub async fn user_exists(&self, raw_account: &str) -> Result<bool> {
        match self.profile(raw_account).await {
            Ok(_) => Ok(true),
            Err(SyncError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
