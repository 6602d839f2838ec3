/// ChatSync - conversation synchronization engine
///
/// Keeps two-party conversations consistent across a per-conversation message
/// log and per-user inbox indices on top of a plain hierarchical store, with
/// live snapshot feeds for clients.

pub mod error;
pub mod config;
pub mod identity;
pub mod store;
pub mod messenger_types;
pub mod message_store;
pub mod index_store;
pub mod directory;
pub mod accounts;
pub mod media;
pub mod orchestrator;
pub mod query;
pub mod messenger;
pub mod messenger_api;

pub use error::{Result, SyncError};
pub use config::Config;
pub use messenger::Messenger;
