/// Account identifier -> canonical storage key
///
/// Raw identifiers (e-mail addresses in practice) contain characters the
/// store reserves for paths. `-` is used as an escape prefix, so it never
/// appears unescaped in a key and two different accounts can't collide:
///
///   alice@x.com  ->  alice-40x-2ecom
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical, path-safe user key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    /// Normalize a raw account identifier.
    pub fn from_raw(raw: &str) -> Self {
        normalize(raw)
    }

    /// Like `from_raw`, for identifiers that come from callers; blank ones
    /// are `InvalidKey`.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(SyncError::InvalidKey("account id is empty".to_string()));
        }
        Ok(normalize(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn escape(c: char) -> Option<&'static str> {
    match c {
        '-' => Some("-2d"),
        '.' => Some("-2e"),
        '@' => Some("-40"),
        '/' => Some("-2f"),
        '#' => Some("-23"),
        '$' => Some("-24"),
        '[' => Some("-5b"),
        ']' => Some("-5d"),
        _ => None,
    }
}

/// Map a raw identifier to its canonical key. Control characters are
/// escaped as `-xx` too, so the key is always a valid path segment
/// (unless `raw` is empty; see `UserKey::parse`).
pub fn normalize(raw: &str) -> UserKey {
    let mut key = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match escape(c) {
            Some(code) => key.push_str(code),
            None if c.is_control() => key.push_str(&format!("-{:02x}", c as u32)),
            None => key.push(c),
        }
    }
    UserKey(key)
}
