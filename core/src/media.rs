/// Media storage collaborator
/// Photo and video bytes live outside the engine; messages only carry the URL
/// handed back here. `MediaStore` is the local implementation, keyed by
/// storage path (`message_images/photo_message_<id>.png` -> bytes).
use crate::error::{Result, SyncError};
use crate::identity::UserKey;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const URL_SCHEME: &str = "media://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    ProfilePicture,
    MessagePhoto,
    MessageVideo,
}

impl MediaKind {
    pub fn folder(&self) -> &'static str {
        match self {
            MediaKind::ProfilePicture => "images",
            MediaKind::MessagePhoto => "message_images",
            MediaKind::MessageVideo => "message_videos",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaKind::ProfilePicture => "profile_picture",
            MediaKind::MessagePhoto => "photo",
            MediaKind::MessageVideo => "video",
        };
        f.write_str(s)
    }
}

impl FromStr for MediaKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "profile_picture" => Ok(MediaKind::ProfilePicture),
            "photo" => Ok(MediaKind::MessagePhoto),
            "video" => Ok(MediaKind::MessageVideo),
            other => Err(SyncError::InvalidKey(format!("unknown media kind {}", other))),
        }
    }
}

pub fn profile_picture_file_name(user: &UserKey) -> String {
    format!("{}_profile_picture.png", user)
}

pub fn message_photo_file_name(message_id: &str) -> String {
    format!("photo_message_{}.png", message_id)
}

pub fn message_video_file_name(message_id: &str) -> String {
    format!("video_message_{}.mov", message_id)
}

/// `images/<file>`, `message_images/<file>`, `message_videos/<file>`
pub fn storage_path(kind: MediaKind, file_name: &str) -> String {
    format!("{}/{}", kind.folder(), file_name)
}

/// What the engine needs from a media backend
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Store `bytes` at `path` and return a URL to put in message content
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String>;

    /// URL for something already uploaded
    async fn download_url(&self, path: &str) -> Result<String>;
}

/// Media backed by a sled database
#[derive(Clone)]
pub struct MediaStore {
    db: Arc<sled::Db>,
}

impl MediaStore {
    /// Create a media store in the given data directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("media.db");
        debug!("Opening media store at {:?}", db_path);

        let db = sled::open(&db_path).map_err(|e| {
            SyncError::StoreUnavailable(format!("Failed to open media store: {}", e))
        })?;

        info!("Media store initialized at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    /// Raw bytes behind a `media://` URL or a storage path
    pub fn get(&self, url_or_path: &str) -> Result<Option<Vec<u8>>> {
        let path = url_or_path.strip_prefix(URL_SCHEME).unwrap_or(url_or_path);
        match self.db.get(path.as_bytes()) {
            Ok(Some(value)) => Ok(Some(value.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(SyncError::StoreUnavailable(format!(
                "Failed to fetch media: {}",
                e
            ))),
        }
    }

    fn url_for(path: &str) -> String {
        format!("{}{}", URL_SCHEME, path)
    }
}

#[async_trait]
impl MediaStorage for MediaStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        debug!("Storing media at {}: {} bytes", path, bytes.len());

        self.db
            .insert(path.as_bytes(), bytes)
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to upload media: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to flush media store: {}", e)))?;

        let url = Self::url_for(path);
        info!("Media uploaded: {}", url);
        Ok(url)
    }

    async fn download_url(&self, path: &str) -> Result<String> {
        let exists = self
            .db
            .contains_key(path.as_bytes())
            .map_err(|e| SyncError::StoreUnavailable(format!("Failed to look up media: {}", e)))?;
        if !exists {
            return Err(SyncError::NotFound(format!("media {}", path)));
        }
        Ok(Self::url_for(path))
    }
}
