/// Read and subscribe surface for clients
/// Everything here takes raw account ids and never writes.
use crate::directory::Directory;
use crate::error::Result;
use crate::identity::UserKey;
use crate::index_store::IndexStore;
use crate::message_store::MessageStore;
use crate::messenger_types::{ConversationSummary, DirectoryEntry, Message};
use crate::store::SnapshotStream;
use futures_util::StreamExt;

#[derive(Clone)]
pub struct Feeds {
    index: IndexStore,
    log: MessageStore,
    directory: Directory,
}

impl Feeds {
    pub fn new(index: IndexStore, log: MessageStore, directory: Directory) -> Self {
        Self {
            index,
            log,
            directory,
        }
    }

    /// Inbox in stored order; empty for a user with no conversations
    pub async fn inbox(&self, account: &str) -> Result<Vec<ConversationSummary>> {
        self.index
            .read_index_or_empty(&UserKey::parse(account)?)
            .await
    }

    /// Inbox with the most recently active conversation first
    pub async fn inbox_by_recency(&self, account: &str) -> Result<Vec<ConversationSummary>> {
        let mut inbox = self.inbox(account).await?;
        sort_by_recency(&mut inbox);
        Ok(inbox)
    }

    /// Full message history, oldest first
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.log.read_all(conversation_id).await
    }

    pub async fn watch_inbox(&self, account: &str) -> Result<SnapshotStream<Vec<ConversationSummary>>> {
        self.index.watch(&UserKey::parse(account)?).await
    }

    /// Same snapshots as `watch_inbox`, each sorted newest first
    pub async fn watch_inbox_by_recency(
        &self,
        account: &str,
    ) -> Result<SnapshotStream<Vec<ConversationSummary>>> {
        let feed = self.watch_inbox(account).await?;
        Ok(feed
            .map(|snapshot| {
                snapshot.map(|mut inbox| {
                    sort_by_recency(&mut inbox);
                    inbox
                })
            })
            .boxed())
    }

    pub async fn watch_conversation(&self, conversation_id: &str) -> Result<SnapshotStream<Vec<Message>>> {
        self.log.watch(conversation_id).await
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<DirectoryEntry>> {
        self.directory.search(query).await
    }
}

fn sort_by_recency(inbox: &mut [ConversationSummary]) {
    inbox.sort_by(|a, b| b.latest_message.timestamp.cmp(&a.latest_message.timestamp));
}
