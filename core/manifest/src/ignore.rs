//! Glob-style ignore patterns.
//!
//! `*` matches within one path component, `**` matches across components,
//! `?` matches one character. A pattern without `/` is tested against every
//! component of a path; a pattern with `/` is tested against the whole path
//! relative to the repository root.

use regex::Regex;

use reposync_common::{Error, RepoPath, Result};

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    regex: Regex,
    whole_path: bool,
}

/// Compiled set of ignore patterns.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    patterns: Vec<CompiledPattern>,
}

impl IgnoreMatcher {
    /// Compile `patterns`. Blank lines and `#` comments are skipped.
    ///
    /// # Errors
    /// Returns `InvalidInput` naming the first pattern that fails to compile.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut compiled = Vec::new();
        for raw in patterns {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let body = trimmed.trim_start_matches('/').trim_end_matches('/');
            let whole_path = trimmed.contains('/');
            let regex = Regex::new(&glob_to_regex(body)).map_err(|e| {
                Error::InvalidInput(format!("Invalid ignore pattern '{}': {}", raw, e))
            })?;
            compiled.push(CompiledPattern {
                source: trimmed.to_string(),
                regex,
                whole_path,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// True if `path` (file or directory) is excluded.
    pub fn is_ignored(&self, path: &RepoPath) -> bool {
        self.matching_pattern(path).is_some()
    }

    /// The first pattern excluding `path`, if any.
    pub fn matching_pattern(&self, path: &RepoPath) -> Option<&str> {
        if path.is_root() {
            return None;
        }
        let relative = path.components().join("/");
        self.patterns
            .iter()
            .find(|p| {
                if p.whole_path {
                    p.regex.is_match(&relative)
                } else {
                    path.components().iter().any(|c| p.regex.is_match(c))
                }
            })
            .map(|p| p.source.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // "**/" also matches zero directories.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> IgnoreMatcher {
        IgnoreMatcher::new(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    fn p(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    #[test]
    fn test_component_patterns() {
        let m = matcher(&["*.tmp", "Thumbs.db", "cache?"]);
        assert!(m.is_ignored(&p("/a/b/file.tmp")));
        assert!(m.is_ignored(&p("/Thumbs.db")));
        assert!(m.is_ignored(&p("/x/cache1/data.bin")));
        assert!(!m.is_ignored(&p("/file.tmp.keep")));
        assert!(!m.is_ignored(&p("/cache12")));
    }

    #[test]
    fn test_path_patterns() {
        let m = matcher(&["build/**", "/docs/*.pdf"]);
        assert!(m.is_ignored(&p("/build/out/app")));
        assert!(!m.is_ignored(&p("/src/build/out")));
        assert!(m.is_ignored(&p("/docs/a.pdf")));
        assert!(!m.is_ignored(&p("/docs/sub/a.pdf")));
    }

    #[test]
    fn test_double_star_matches_zero_directories() {
        let m = matcher(&["src/**/*.o"]);
        assert!(m.is_ignored(&p("/src/main.o")));
        assert!(m.is_ignored(&p("/src/a/b/main.o")));
        assert!(!m.is_ignored(&p("/lib/main.o")));
    }

    #[test]
    fn test_comments_and_specials() {
        let m = matcher(&["# comment", "", "a+b.(txt)"]);
        assert!(m.is_ignored(&p("/a+b.(txt)")));
        assert_eq!(m.matching_pattern(&p("/a+b.(txt)")), Some("a+b.(txt)"));
        assert!(!m.is_ignored(&p("/aab.txt")));
        assert!(matcher(&["#only"]).is_empty());
    }
}
