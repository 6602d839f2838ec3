/// Messenger: wires the stores, workflows and feeds over one tree store
use crate::accounts::Accounts;
use crate::config::Config;
use crate::directory::Directory;
use crate::error::{Result, SendMessageError, SyncError};
use crate::identity::UserKey;
use crate::index_store::IndexStore;
use crate::media::{self, MediaKind, MediaStorage, MediaStore};
use crate::message_store::{AppendOutcome, MessageStore};
use crate::messenger_types::{MessageDraft, MessageKind};
use crate::orchestrator::Orchestrator;
use crate::query::Feeds;
use crate::store::{SledTree, TreeStore};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct Messenger {
    pub orchestrator: Orchestrator,
    pub feeds: Feeds,
    pub accounts: Accounts,
    pub directory: Directory,
    media: Option<Arc<dyn MediaStorage>>,
}

impl Messenger {
    /// Open the sled-backed stores under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let tree = SledTree::open(&config.data_dir)?;
        let media = MediaStore::new(&config.data_dir)?;
        info!("Messenger data directory: {:?}", config.data_dir);
        Ok(Self::with_tree(Arc::new(tree), config).with_media(Arc::new(media)))
    }

    /// Build on any tree store (no media backend until `with_media`)
    pub fn with_tree(tree: Arc<dyn TreeStore>, config: &Config) -> Self {
        let timeout = config.store_timeout;
        let index = IndexStore::new(tree.clone(), timeout);
        let log = MessageStore::new(tree.clone(), timeout);
        let directory = Directory::new(tree.clone(), timeout);

        Self {
            orchestrator: Orchestrator::new(index.clone(), log.clone(), config),
            feeds: Feeds::new(index, log, directory.clone()),
            accounts: Accounts::new(tree, directory.clone(), timeout),
            directory,
            media: None,
        }
    }

    pub fn with_media(mut self, media: Arc<dyn MediaStorage>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn media(&self) -> Option<&Arc<dyn MediaStorage>> {
        self.media.as_ref()
    }

    fn media_backend(&self) -> Result<&Arc<dyn MediaStorage>> {
        self.media
            .as_ref()
            .ok_or_else(|| SyncError::StoreUnavailable("no media backend configured".to_string()))
    }

    /// Store an account's profile picture; re-uploading overwrites it
    pub async fn upload_profile_picture(&self, account: &str, bytes: Vec<u8>) -> Result<String> {
        let key = UserKey::parse(account)?;
        let media = self.media_backend()?;
        let path = media::storage_path(
            MediaKind::ProfilePicture,
            &media::profile_picture_file_name(&key),
        );
        let url = media.upload(&path, bytes).await?;
        info!("Stored profile picture for {}", key);
        Ok(url)
    }

    /// Upload the payload of a photo or video message; returns its URL
    pub async fn upload_message_media(
        &self,
        kind: MediaKind,
        message_id: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let media = self.media_backend()?;
        let file_name = match kind {
            MediaKind::MessagePhoto => media::message_photo_file_name(message_id),
            MediaKind::MessageVideo => media::message_video_file_name(message_id),
            MediaKind::ProfilePicture => {
                return Err(SyncError::InvalidKey(
                    "profile pictures are not message media".to_string(),
                ))
            }
        };
        media.upload(&media::storage_path(kind, &file_name), bytes).await
    }

    /// Upload a photo or video, then send it as a message
    pub async fn send_media(
        &self,
        conversation_id: &str,
        sender_account: &str,
        counterpart_account: &str,
        sender_display_name: &str,
        kind: MediaKind,
        bytes: Vec<u8>,
    ) -> std::result::Result<AppendOutcome, SendMessageError> {
        let draft = MessageDraft::new(MessageKind::Unsupported(String::new()), sender_display_name);
        let url = self
            .upload_message_media(kind, &draft.id, bytes)
            .await
            .map_err(SendMessageError::NotDelivered)?;
        let kind = match kind {
            MediaKind::MessageVideo => MessageKind::Video(url),
            _ => MessageKind::Photo(url),
        };
        let draft = MessageDraft { kind, ..draft };
        self.orchestrator
            .send_message(conversation_id, sender_account, counterpart_account, draft)
            .await
    }
}
