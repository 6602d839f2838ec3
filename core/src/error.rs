/// Error types for the synchronization engine
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Three-way classification every store sub-step failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    StoreUnavailable,
    Conflict,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // A key that can't be a path segment can't name anything stored.
            SyncError::NotFound(_) | SyncError::InvalidKey(_) => ErrorKind::NotFound,
            SyncError::StoreUnavailable(_) | SyncError::Io(_) | SyncError::Config(_) => {
                ErrorKind::StoreUnavailable
            }
            // Stored shape disagrees with the model: treat like a write conflict.
            SyncError::Conflict(_) | SyncError::Serialization(_) => ErrorKind::Conflict,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// Individual store writes a workflow is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    ReserveConversationId,
    InitiatorSummary,
    CounterpartSummary,
    AppendMessage,
    SenderLatestMessage,
    CounterpartLatestMessage,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStep::ReserveConversationId => "reserve_conversation_id",
            WorkflowStep::InitiatorSummary => "initiator_summary",
            WorkflowStep::CounterpartSummary => "counterpart_summary",
            WorkflowStep::AppendMessage => "append_message",
            WorkflowStep::SenderLatestMessage => "sender_latest_message",
            WorkflowStep::CounterpartLatestMessage => "counterpart_latest_message",
        };
        f.write_str(s)
    }
}

/// A write that a failed create left behind after rollback gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrandedWrite {
    Summary {
        user_key: String,
        conversation_id: String,
    },
}

#[derive(Error, Debug)]
pub enum CreateConversationError {
    /// Nothing persisted (or everything persisted was rolled back).
    #[error("conversation not created: {step} failed: {source}")]
    NotApplied {
        step: WorkflowStep,
        #[source]
        source: SyncError,
    },

    /// Rollback exhausted its retries; `stranded` lists what is still stored.
    #[error("conversation partially created: {step} failed ({source}), {} write(s) could not be rolled back", .stranded.len())]
    PartialFailure {
        step: WorkflowStep,
        #[source]
        source: SyncError,
        stranded: Vec<StrandedWrite>,
    },
}

impl CreateConversationError {
    pub fn step(&self) -> WorkflowStep {
        match self {
            CreateConversationError::NotApplied { step, .. }
            | CreateConversationError::PartialFailure { step, .. } => *step,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CreateConversationError::NotApplied { source, .. }
            | CreateConversationError::PartialFailure { source, .. } => source.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SendMessageError {
    /// The append failed; the conversation is in its prior state.
    #[error("message not delivered: {0}")]
    NotDelivered(#[source] SyncError),

    /// The message is in the log but one or both summaries are behind it.
    #[error("message {message_id} delivered but index update failed for {}", describe_stale(.sender, .counterpart))]
    IndexStale {
        message_id: String,
        sender: Option<SyncError>,
        counterpart: Option<SyncError>,
    },
}

fn describe_stale(sender: &Option<SyncError>, counterpart: &Option<SyncError>) -> String {
    match (sender, counterpart) {
        (Some(s), Some(c)) => format!("sender ({}) and counterpart ({})", s, c),
        (Some(s), None) => format!("sender ({})", s),
        (None, Some(c)) => format!("counterpart ({})", c),
        (None, None) => "no index".to_string(),
    }
}

impl SendMessageError {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendMessageError::IndexStale { .. })
    }

    /// Sub-writes that did not apply, so a caller can retry only those.
    pub fn failed_steps(&self) -> Vec<WorkflowStep> {
        match self {
            SendMessageError::NotDelivered(_) => vec![WorkflowStep::AppendMessage],
            SendMessageError::IndexStale {
                sender,
                counterpart,
                ..
            } => {
                let mut steps = Vec::new();
                if sender.is_some() {
                    steps.push(WorkflowStep::SenderLatestMessage);
                }
                if counterpart.is_some() {
                    steps.push(WorkflowStep::CounterpartLatestMessage);
                }
                steps
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(SyncError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(SyncError::InvalidKey("a/b".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            SyncError::StoreUnavailable("timeout".into()).kind(),
            ErrorKind::StoreUnavailable
        );
        assert_eq!(SyncError::Conflict("dup".into()).kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_failed_steps_lists_only_failures() {
        let err = SendMessageError::IndexStale {
            message_id: "m1".into(),
            sender: None,
            counterpart: Some(SyncError::StoreUnavailable("down".into())),
        };
        assert!(err.is_delivered());
        assert_eq!(err.failed_steps(), vec![WorkflowStep::CounterpartLatestMessage]);
        assert!(err.to_string().contains("counterpart"));

        let err = SendMessageError::NotDelivered(SyncError::NotFound("c".into()));
        assert!(!err.is_delivered());
        assert_eq!(err.failed_steps(), vec![WorkflowStep::AppendMessage]);
    }
}
