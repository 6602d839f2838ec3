/// Workflow behavior when the store fails or stalls part-way
mod common;

use chatsync_core::error::{CreateConversationError, ErrorKind, SendMessageError, StrandedWrite, WorkflowStep};
use chatsync_core::identity::normalize;
use chatsync_core::messenger_types::MessageDraft;
use common::{index_prefix, messenger_on, text_conversation, FaultyTree, Op};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_counterpart_failure_rolls_back_initiator() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    tree.fail(&index_prefix("bob@y"), Op::Replace);

    let err = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, CreateConversationError::NotApplied { .. }));
    assert_eq!(err.step(), WorkflowStep::CounterpartSummary);
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

    tree.heal();
    assert!(m.feeds.inbox("alice@x").await.unwrap().is_empty());
    assert!(m.feeds.inbox("bob@y").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_counterpart_write_that_landed_is_rolled_back() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    // Bob's summary is stored even though the write reports a failure.
    tree.land_then_fail_once(&index_prefix("bob@y"), Op::Replace);

    let err = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, CreateConversationError::NotApplied { .. }));
    assert_eq!(err.step(), WorkflowStep::CounterpartSummary);
    assert!(m.feeds.inbox("alice@x").await.unwrap().is_empty());
    assert!(m.feeds.inbox("bob@y").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_landed_counterpart_write_that_cannot_be_removed_is_stranded() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    tree.land_then_fail_once(&index_prefix("bob@y"), Op::Replace);
    tree.fail(&index_prefix("bob@y"), Op::Replace);

    let err = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap_err();

    match &err {
        CreateConversationError::PartialFailure { step, stranded, .. } => {
            assert_eq!(*step, WorkflowStep::CounterpartSummary);
            assert_eq!(stranded.len(), 1);
            let StrandedWrite::Summary { user_key, .. } = &stranded[0];
            assert_eq!(user_key, normalize("bob@y").as_str());
        }
        other => panic!("expected a partial failure, got {}", other),
    }

    tree.heal();
    assert!(m.feeds.inbox("alice@x").await.unwrap().is_empty());
    assert_eq!(m.feeds.inbox("bob@y").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_initiator_failure_writes_nothing() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    tree.fail(&index_prefix("alice@x"), Op::Replace);

    let err = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.step(), WorkflowStep::InitiatorSummary);

    tree.heal();
    assert!(m.feeds.inbox("bob@y").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_log_failure_rolls_back_both_summaries() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    tree.fail("conversations/", Op::Replace);

    let err = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, CreateConversationError::NotApplied { .. }));
    assert_eq!(err.step(), WorkflowStep::AppendMessage);

    tree.heal();
    assert!(m.feeds.inbox("alice@x").await.unwrap().is_empty());
    assert!(m.feeds.inbox("bob@y").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_exhausted_rollback_reports_stranded_write() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    tree.fail("conversations/", Op::Replace);
    // Alice's first index write goes through; every later one fails.
    tree.fail_after(&index_prefix("alice@x"), Op::Replace, 1);

    let err = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap_err();

    match &err {
        CreateConversationError::PartialFailure { step, stranded, .. } => {
            assert_eq!(*step, WorkflowStep::AppendMessage);
            assert_eq!(stranded.len(), 1);
            let StrandedWrite::Summary { user_key, .. } = &stranded[0];
            assert_eq!(user_key, normalize("alice@x").as_str());
        }
        other => panic!("expected a partial failure, got {}", other),
    }

    tree.heal();
    assert_eq!(m.feeds.inbox("alice@x").await.unwrap().len(), 1);
    assert!(m.feeds.inbox("bob@y").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hung_store_times_out() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    tree.hang("conversations/", Op::Read);

    let started = Instant::now();
    let err = m.feeds.history("conversation_1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_hung_counterpart_write_is_not_applied() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    tree.hang(&index_prefix("bob@y"), Op::Replace);

    let err = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.step(), WorkflowStep::CounterpartSummary);
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

    tree.heal();
    assert!(m.feeds.inbox("alice@x").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_index_then_resync_converges() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    let id = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap();

    tree.fail(&index_prefix("bob@y"), Op::Replace);
    let err = m
        .orchestrator
        .send_message(&id, "alice@x", "bob@y", MessageDraft::text("news", "Alice"))
        .await
        .unwrap_err();

    assert!(err.is_delivered());
    assert_eq!(err.failed_steps(), vec![WorkflowStep::CounterpartLatestMessage]);
    assert!(matches!(
        err,
        SendMessageError::IndexStale { sender: None, counterpart: Some(_), .. }
    ));
    assert_eq!(m.feeds.history(&id).await.unwrap().len(), 2);
    assert_eq!(
        m.feeds.inbox("bob@y").await.unwrap()[0].latest_message.preview_text,
        "hi"
    );

    tree.heal();
    m.orchestrator.resync_summary(&id, "bob@y").await.unwrap();
    let alice = m.feeds.inbox("alice@x").await.unwrap();
    let bob = m.feeds.inbox("bob@y").await.unwrap();
    assert_eq!(alice[0].latest_message, bob[0].latest_message);
    assert_eq!(bob[0].latest_message.preview_text, "news");
}

#[tokio::test]
async fn test_failed_append_changes_nothing() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());
    let id = m
        .orchestrator
        .create_conversation(text_conversation("alice@x", "Alice", "bob@y", "Bob", "hi"))
        .await
        .unwrap();

    tree.fail("conversations/", Op::Replace);
    let err = m
        .orchestrator
        .send_message(&id, "alice@x", "bob@y", MessageDraft::text("lost", "Alice"))
        .await
        .unwrap_err();
    assert!(!err.is_delivered());

    tree.heal();
    assert_eq!(m.feeds.history(&id).await.unwrap().len(), 1);
    for account in ["alice@x", "bob@y"] {
        assert_eq!(
            m.feeds.inbox(account).await.unwrap()[0].latest_message.preview_text,
            "hi"
        );
    }
}

#[tokio::test]
async fn test_concurrent_sends_to_one_user_lose_nothing() {
    let tree = FaultyTree::new();
    let m = messenger_on(tree.clone());

    let mut ids = Vec::new();
    for i in 0..8 {
        let friend = format!("friend{}@z", i);
        let id = m
            .orchestrator
            .create_conversation(text_conversation("alice@x", "Alice", &friend, "Friend", "hi"))
            .await
            .unwrap();
        ids.push((id, friend));
    }

    let mut handles = Vec::new();
    for (id, friend) in ids.clone() {
        let orchestrator = m.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let text = format!("reply from {}", friend);
            orchestrator
                .send_message(&id, &friend, "alice@x", MessageDraft::text(text, "Friend"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let inbox = m.feeds.inbox("alice@x").await.unwrap();
    assert_eq!(inbox.len(), ids.len());
    for (id, friend) in &ids {
        let summary = inbox.iter().find(|s| &s.conversation_id == id).unwrap();
        assert_eq!(
            summary.latest_message.preview_text,
            format!("reply from {}", friend)
        );
    }
}
