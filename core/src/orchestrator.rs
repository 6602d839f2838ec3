/// Conversation lifecycle workflows
///
/// Each workflow is a short sequence of single-path store writes. There are no
/// multi-path transactions underneath, so failures are reported per step and a
/// failed create is compensated by removing the summaries it already wrote.
use crate::config::Config;
use crate::error::{
    CreateConversationError, Result, SendMessageError, StrandedWrite, SyncError, WorkflowStep,
};
use crate::identity::UserKey;
use crate::index_store::IndexStore;
use crate::message_store::{AppendMode, AppendOutcome, MessageStore};
use crate::messenger_types::{ConversationSummary, LatestMessage, MessageDraft, MessageKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

/// One side of a new conversation, as the authentication layer knows it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Raw account id (e.g. an email); normalized internally
    pub account: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversation {
    pub initiator: Participant,
    pub counterpart: Participant,
    pub first_message: MessageKind,
}

#[derive(Clone)]
pub struct Orchestrator {
    index: IndexStore,
    log: MessageStore,
    rollback_attempts: u32,
    rollback_backoff: Duration,
}

impl Orchestrator {
    pub fn new(index: IndexStore, log: MessageStore, config: &Config) -> Self {
        Self {
            index,
            log,
            rollback_attempts: config.rollback_attempts.max(1),
            rollback_backoff: config.rollback_backoff,
        }
    }

    /// Start a conversation with its first message. Returns the new id.
    pub async fn create_conversation(
        &self,
        request: CreateConversation,
    ) -> std::result::Result<String, CreateConversationError> {
        let (initiator, counterpart) = match (
            UserKey::parse(&request.initiator.account),
            UserKey::parse(&request.counterpart.account),
        ) {
            (Ok(initiator), Ok(counterpart)) => (initiator, counterpart),
            (Err(e), _) | (_, Err(e)) => {
                return Err(CreateConversationError::NotApplied {
                    step: WorkflowStep::ReserveConversationId,
                    source: e,
                })
            }
        };
        if initiator == counterpart {
            return Err(CreateConversationError::NotApplied {
                step: WorkflowStep::ReserveConversationId,
                source: SyncError::Conflict(format!(
                    "{} cannot start a conversation with themselves",
                    initiator
                )),
            });
        }

        let draft = MessageDraft::new(request.first_message, &request.initiator.display_name);
        let conversation_id = conversation_id_for(&draft.id);
        let first = draft.into_message(initiator.clone());

        match self.log.exists(&conversation_id).await {
            Ok(false) => {}
            Ok(true) => {
                return Err(CreateConversationError::NotApplied {
                    step: WorkflowStep::ReserveConversationId,
                    source: SyncError::Conflict(format!(
                        "conversation {} already exists",
                        conversation_id
                    )),
                })
            }
            Err(e) => {
                return Err(CreateConversationError::NotApplied {
                    step: WorkflowStep::ReserveConversationId,
                    source: e,
                })
            }
        }

        let latest = LatestMessage::from(&first);
        let initiator_copy = ConversationSummary {
            conversation_id: conversation_id.clone(),
            counterpart_key: counterpart.clone(),
            display_name: request.counterpart.display_name.clone(),
            latest_message: latest.clone(),
        };
        let counterpart_copy = ConversationSummary {
            conversation_id: conversation_id.clone(),
            counterpart_key: initiator.clone(),
            display_name: request.initiator.display_name.clone(),
            latest_message: latest,
        };

        if let Err(e) = self.index.upsert_summary(&initiator, &initiator_copy).await {
            warn!("Create {}: initiator summary failed: {}", conversation_id, e);
            return Err(CreateConversationError::NotApplied {
                step: WorkflowStep::InitiatorSummary,
                source: e,
            });
        }

        if let Err(e) = self.index.upsert_summary(&counterpart, &counterpart_copy).await {
            warn!("Create {}: counterpart summary failed: {}", conversation_id, e);
            // The failed write may still have landed; an absent one rolls back as NotFound.
            return Err(self
                .roll_back(
                    &conversation_id,
                    WorkflowStep::CounterpartSummary,
                    e,
                    &[&initiator, &counterpart],
                )
                .await);
        }

        if let Err(e) = self
            .log
            .append(&conversation_id, &first, AppendMode::CreateIfMissing)
            .await
        {
            warn!("Create {}: first message failed: {}", conversation_id, e);
            return Err(self
                .roll_back(
                    &conversation_id,
                    WorkflowStep::AppendMessage,
                    e,
                    &[&initiator, &counterpart],
                )
                .await);
        }

        info!(
            "Created conversation {} between {} and {}",
            conversation_id, initiator, counterpart
        );
        Ok(conversation_id)
    }

    /// Append a message and point both summaries at it
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender_account: &str,
        counterpart_account: &str,
        draft: MessageDraft,
    ) -> std::result::Result<AppendOutcome, SendMessageError> {
        let sender = UserKey::parse(sender_account).map_err(SendMessageError::NotDelivered)?;
        let counterpart =
            UserKey::parse(counterpart_account).map_err(SendMessageError::NotDelivered)?;
        let mut message = draft.into_message(sender.clone());

        let outcome = self
            .log
            .append(conversation_id, &message, AppendMode::ExistingOnly)
            .await
            .map_err(|e| {
                warn!("Send into {} not delivered: {}", conversation_id, e);
                SendMessageError::NotDelivered(e)
            })?;

        // A resubmission keeps the send time already in the log.
        if let AppendOutcome::Duplicate { timestamp, .. } = outcome {
            message.timestamp = timestamp;
        }
        let latest = LatestMessage::from(&message);

        // Both run regardless of each other.
        let sender_result = self
            .index
            .advance_latest_message(&sender, conversation_id, &latest)
            .await;
        let counterpart_result = self
            .index
            .advance_latest_message(&counterpart, conversation_id, &latest)
            .await;

        match (sender_result, counterpart_result) {
            (Ok(_), Ok(_)) => {
                info!(
                    "Message {} from {} in {}{}",
                    message.id,
                    sender,
                    conversation_id,
                    if outcome.is_duplicate() { " (resubmitted)" } else { "" }
                );
                Ok(outcome)
            }
            (sender_result, counterpart_result) => {
                let sender_err = sender_result.err();
                let counterpart_err = counterpart_result.err();
                warn!(
                    "Message {} delivered to {} but summaries are stale (sender: {:?}, counterpart: {:?})",
                    message.id, conversation_id, sender_err, counterpart_err
                );
                Err(SendMessageError::IndexStale {
                    message_id: message.id,
                    sender: sender_err,
                    counterpart: counterpart_err,
                })
            }
        }
    }

    /// Rewrite one user's `latest_message` from the log. Picks the same
    /// message `send_message` converges on (newest timestamp), so a resynced
    /// copy agrees with the other participant's.
    pub async fn resync_summary(&self, conversation_id: &str, account: &str) -> Result<LatestMessage> {
        let user = UserKey::parse(account)?;
        let newest = self
            .log
            .latest(conversation_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("messages in {}", conversation_id)))?;
        let latest = LatestMessage::from(&newest);
        self.index
            .update_latest_message(&user, conversation_id, &latest)
            .await?;
        info!("Resynced summary of {} for {}", conversation_id, user);
        Ok(latest)
    }

    /// Hide a conversation from one user's inbox. The counterpart's summary
    /// and the message log are left as they are.
    pub async fn delete_conversation(&self, account: &str, conversation_id: &str) -> Result<()> {
        let user = UserKey::parse(account)?;
        self.index.remove(&user, conversation_id).await?;
        info!("Removed {} from inbox of {}", conversation_id, user);
        Ok(())
    }

    /// Undo summaries written by a failed create
    async fn roll_back(
        &self,
        conversation_id: &str,
        step: WorkflowStep,
        cause: SyncError,
        written: &[&UserKey],
    ) -> CreateConversationError {
        let mut stranded = Vec::new();
        for user in written {
            if let Err(e) = self.remove_with_retry(user, conversation_id).await {
                error!(
                    "Rollback of {} for {} gave up: {}",
                    conversation_id, user, e
                );
                stranded.push(StrandedWrite::Summary {
                    user_key: user.to_string(),
                    conversation_id: conversation_id.to_string(),
                });
            }
        }

        if stranded.is_empty() {
            info!("Rolled back conversation {} after {} failed", conversation_id, step);
            CreateConversationError::NotApplied {
                step,
                source: cause,
            }
        } else {
            error!(
                "Conversation {} partially created: {} stranded write(s)",
                conversation_id,
                stranded.len()
            );
            CreateConversationError::PartialFailure {
                step,
                source: cause,
                stranded,
            }
        }
    }

    async fn remove_with_retry(&self, user: &UserKey, conversation_id: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.index.remove(user, conversation_id).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if attempt >= self.rollback_attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "Rollback attempt {}/{} of {} for {} failed: {}",
                        attempt, self.rollback_attempts, conversation_id, user, e
                    );
                    tokio::time::sleep(self.rollback_backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// `conversation_<unix millis>_<first message id>`
pub fn conversation_id_for(first_message_id: &str) -> String {
    format!(
        "conversation_{}_{}",
        Utc::now().timestamp_millis(),
        first_message_id
    )
}
