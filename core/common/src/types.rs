//! Common types used throughout reposync.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// A path within a repository, independent of the underlying transport.
///
/// Paths are relative to the repository root and always rendered with a
/// leading `/`. Ordering is component-wise, which is the order every
/// listing in the diff engine uses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoPath {
    components: Vec<String>,
}

impl RepoPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Any component is empty, `.` or `..`
    /// - Any component contains a path separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into a RepoPath.
    ///
    /// Uses '/' as separator; leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Replace the last component, producing a sibling path.
    pub fn with_name(&self, name: &str) -> crate::Result<Self> {
        match self.parent() {
            Some(parent) => parent.join(name),
            None => Err(crate::Error::InvalidInput(
                "Root has no siblings".to_string(),
            )),
        }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// True if `self` is `other` or lies underneath it.
    pub fn starts_with(&self, other: &RepoPath) -> bool {
        self.components.len() >= other.components.len()
            && self.components[..other.components.len()] == other.components[..]
    }

    /// Number of leading components shared with `other`.
    pub fn common_prefix_len(&self, other: &RepoPath) -> usize {
        self.components
            .iter()
            .zip(other.components.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp == "." || comp == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot be '{}'",
            comp
        )));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    Ok(())
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_repo_path_root() {
        let path = RepoPath::root();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
        assert_eq!(RepoPath::parse("///").unwrap(), path);
    }

    #[test]
    fn test_repo_path_parse() {
        let path = RepoPath::parse("/foo/bar/baz").unwrap();
        assert_eq!(path.components(), &["foo", "bar", "baz"]);
        assert_eq!(path.to_string_path(), "/foo/bar/baz");
        assert_eq!(RepoPath::parse("foo/bar/baz").unwrap(), path);
    }

    #[test]
    fn test_repo_path_rejects_traversal() {
        assert!(RepoPath::parse("/foo/../etc").is_err());
        assert!(RepoPath::parse("/./foo").is_err());
        assert!(RepoPath::parse("/foo//bar").is_err());
        assert!(RepoPath::root().join("a\\b").is_err());
    }

    #[test]
    fn test_repo_path_join_and_parent() {
        let path = RepoPath::root().join("foo").unwrap().join("bar").unwrap();
        assert_eq!(path.to_string_path(), "/foo/bar");
        assert_eq!(path.parent().unwrap().to_string_path(), "/foo");
        assert_eq!(path.name(), Some("bar"));
    }

    #[test]
    fn test_with_name() {
        let path = RepoPath::parse("/docs/a.txt").unwrap();
        assert_eq!(path.with_name("b.txt").unwrap().to_string(), "/docs/b.txt");
        assert!(RepoPath::root().with_name("x").is_err());
    }

    #[test]
    fn test_starts_with_is_component_wise() {
        let dir = RepoPath::parse("/foo").unwrap();
        assert!(RepoPath::parse("/foo/bar").unwrap().starts_with(&dir));
        assert!(dir.starts_with(&dir));
        assert!(!RepoPath::parse("/foobar").unwrap().starts_with(&dir));
    }

    #[test]
    fn test_common_prefix_len() {
        let a = RepoPath::parse("/a/b/c.txt").unwrap();
        let b = RepoPath::parse("/a/b/d/c.txt").unwrap();
        assert_eq!(a.common_prefix_len(&b), 2);
    }

    #[test]
    fn test_ordering_is_component_wise() {
        let mut paths = vec![
            RepoPath::parse("/a.b").unwrap(),
            RepoPath::parse("/a/z").unwrap(),
            RepoPath::parse("/a").unwrap(),
        ];
        paths.sort();
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["/a", "/a/z", "/a.b"]);
    }

    #[test]
    fn test_sensitive_bytes_redacted() {
        let secret = SensitiveBytes::new(b"hunter2".to_vec());
        assert_eq!(format!("{:?}", secret), "SensitiveBytes([REDACTED; 7 bytes])");
    }

    proptest! {
        #[test]
        fn prop_parse_display_roundtrip(parts in proptest::collection::vec("[a-z0-9_]{1,8}", 0..6)) {
            let path = RepoPath::from_components(parts.clone()).unwrap();
            let reparsed = RepoPath::parse(&path.to_string()).unwrap();
            prop_assert_eq!(reparsed, path);
        }
    }
}
