use crate::error::{Result, SyncError};
use std::fmt;

const FORBIDDEN: &[char] = &['/', '.', '#', '$', '[', ']'];

/// Slash-delimited location in the tree, e.g. `users/alice-40x/conversations`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath(String);

impl StorePath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(SyncError::InvalidKey("empty path".to_string()));
        }
        for segment in raw.split('/') {
            validate_segment(segment)?;
        }
        Ok(Self(raw.to_string()))
    }

    pub fn child(&self, segment: &str) -> Result<Self> {
        validate_segment(segment)?;
        Ok(Self(format!("{}/{}", self.0, segment)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Proper ancestors, nearest last: `a/b/c` -> `a`, `a/b`.
    pub fn ancestors(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut end = 0;
        for segment in self.0.split('/') {
            if end > 0 {
                out.push(self.0[..end].to_string());
                end += 1;
            }
            end += segment.len();
        }
        out
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &str) -> bool {
        other == self.0
            || (other.len() > self.0.len()
                && other.starts_with(self.0.as_str())
                && other.as_bytes()[self.0.len()] == b'/')
    }

    /// A write at one path is visible to a watch on the other.
    pub fn overlaps(&self, other: &str) -> bool {
        self.contains(other) || StorePath(other.to_string()).contains(&self.0)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(SyncError::InvalidKey("empty path segment".to_string()));
    }
    if let Some(c) = segment
        .chars()
        .find(|c| FORBIDDEN.contains(c) || c.is_control())
    {
        return Err(SyncError::InvalidKey(format!(
            "segment {:?} contains forbidden character {:?}",
            segment, c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_child() {
        let p = StorePath::parse("users/alice").unwrap();
        let c = p.child("conversations").unwrap();
        assert_eq!(c.as_str(), "users/alice/conversations");
        assert_eq!(c.segments().count(), 3);
        assert!(p.child("a/b").is_err());
        assert!(p.child("a.b").is_err());
        assert!(p.child("").is_err());
        assert!(StorePath::parse("users//x").is_err());
    }

    #[test]
    fn test_ancestors() {
        let p = StorePath::parse("a/bb/ccc").unwrap();
        assert_eq!(p.ancestors(), vec!["a".to_string(), "a/bb".to_string()]);
        assert!(StorePath::parse("solo").unwrap().ancestors().is_empty());
    }

    #[test]
    fn test_contains_is_segment_aware() {
        let p = StorePath::parse("users/al").unwrap();
        assert!(p.contains("users/al"));
        assert!(p.contains("users/al/conversations"));
        assert!(!p.contains("users/alice"));
        assert!(p.overlaps("users"));
        assert!(!p.overlaps("conversations/al"));
    }
}
