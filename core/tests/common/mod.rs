#![allow(dead_code)]
//! Shared test fixtures: a tree store that fails or stalls on demand

use async_trait::async_trait;
use chatsync_core::orchestrator::{CreateConversation, Participant};
use chatsync_core::messenger_types::MessageKind;
use chatsync_core::store::{SledTree, StorePath, TreeStore};
use chatsync_core::{Config, Messenger, Result, SyncError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Return `StoreUnavailable`
    Fail,
    /// Never complete
    Hang,
    /// Perform the write, then report `StoreUnavailable` anyway
    LandThenFail,
}

struct Rule {
    prefix: String,
    op: Op,
    fault: Fault,
    /// Matching calls let through before the fault starts
    skip: usize,
    /// Faults left to inject; `None` keeps going forever
    times: Option<usize>,
}

/// Wraps a temporary `SledTree`; rules match on path prefix and operation
pub struct FaultyTree {
    inner: SledTree,
    rules: Mutex<Vec<Rule>>,
}

impl FaultyTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SledTree::temporary().expect("temporary sled"),
            rules: Mutex::new(Vec::new()),
        })
    }

    pub fn fail(&self, prefix: &str, op: Op) {
        self.add(prefix, op, Fault::Fail, 0);
    }

    pub fn fail_after(&self, prefix: &str, op: Op, skip: usize) {
        self.add(prefix, op, Fault::Fail, skip);
    }

    pub fn hang(&self, prefix: &str, op: Op) {
        self.add(prefix, op, Fault::Hang, 0);
    }

    /// Next matching write lands but reports a failure; later rules apply after
    pub fn land_then_fail_once(&self, prefix: &str, op: Op) {
        self.push(Rule {
            prefix: prefix.to_string(),
            op,
            fault: Fault::LandThenFail,
            skip: 0,
            times: Some(1),
        });
    }

    /// Drop every rule
    pub fn heal(&self) {
        self.rules.lock().unwrap().clear();
    }

    fn add(&self, prefix: &str, op: Op, fault: Fault, skip: usize) {
        self.push(Rule {
            prefix: prefix.to_string(),
            op,
            fault,
            skip,
            times: None,
        });
    }

    fn push(&self, rule: Rule) {
        self.rules.lock().unwrap().push(rule);
    }

    fn check(&self, path: &StorePath, op: Op) -> Option<Fault> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|r| {
            r.op == op && r.times != Some(0) && path.as_str().starts_with(&r.prefix)
        })?;
        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }
        if let Some(left) = rule.times.as_mut() {
            *left -= 1;
        }
        Some(rule.fault)
    }

    fn injected(path: &StorePath, op: Op) -> SyncError {
        SyncError::StoreUnavailable(format!("injected {:?} failure at {}", op, path))
    }
}

#[async_trait]
impl TreeStore for FaultyTree {
    async fn read(&self, path: &StorePath) -> Result<Option<serde_json::Value>> {
        match self.check(path, Op::Read) {
            None => self.inner.read(path).await,
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Fail) => Err(Self::injected(path, Op::Read)),
            Some(Fault::LandThenFail) => {
                self.inner.read(path).await?;
                Err(Self::injected(path, Op::Read))
            }
        }
    }

    async fn replace(&self, path: &StorePath, value: Option<serde_json::Value>) -> Result<()> {
        match self.check(path, Op::Replace) {
            None => self.inner.replace(path, value).await,
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Fail) => Err(Self::injected(path, Op::Replace)),
            Some(Fault::LandThenFail) => {
                self.inner.replace(path, value).await?;
                Err(Self::injected(path, Op::Replace))
            }
        }
    }

    async fn subscribe(&self, path: &StorePath) -> watch::Receiver<u64> {
        self.inner.subscribe(path).await
    }
}

pub fn test_config() -> Config {
    Config {
        store_timeout: Duration::from_millis(500),
        rollback_backoff: Duration::from_millis(1),
        ..Config::default()
    }
}

pub fn messenger_on(tree: Arc<FaultyTree>) -> Messenger {
    Messenger::with_tree(tree, &test_config())
}

/// Store path prefix of a raw account's inbox
pub fn index_prefix(account: &str) -> String {
    format!(
        "users/{}/conversations",
        chatsync_core::identity::normalize(account)
    )
}

pub fn text_conversation(from: &str, from_name: &str, to: &str, to_name: &str, text: &str) -> CreateConversation {
    CreateConversation {
        initiator: Participant {
            account: from.to_string(),
            display_name: from_name.to_string(),
        },
        counterpart: Participant {
            account: to.to_string(),
            display_name: to_name.to_string(),
        },
        first_message: MessageKind::Text(text.to_string()),
    }
}
