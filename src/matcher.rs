//! Path pattern matching for root watch lists.
//!
//! Patterns are globs (`*`, `?`, `[..]`, `**`) evaluated in order. A `!`
//! prefix turns a pattern into an exclusion; the last pattern that matches
//! decides. A pattern that matches a parent directory of a path also
//! matches the path, so `modules` covers `modules/vpc/main.tf`.

use glob::{MatchOptions, Pattern, PatternError};

use crate::models::Root;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct MatchPattern {
    pattern: Pattern,
    exclusion: bool,
}

impl MatchPattern {
    fn matches(&self, path: &str) -> bool {
        if self.pattern.matches_with(path, MATCH_OPTIONS) {
            return true;
        }
        path.match_indices('/')
            .any(|(idx, _)| self.pattern.matches_with(&path[..idx], MATCH_OPTIONS))
    }
}

#[derive(Debug, Clone)]
pub struct PathMatcher {
    patterns: Vec<MatchPattern>,
}

impl PathMatcher {
    /// Build from repo-relative patterns.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                let raw = raw.as_ref().trim();
                let (exclusion, body) = match raw.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, raw),
                };
                Ok(MatchPattern {
                    pattern: Pattern::new(&clean_path(body))?,
                    exclusion,
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;
        Ok(Self { patterns })
    }

    /// Build from a root's watch list, rewriting each pattern from
    /// root-relative to repo-relative.
    pub fn for_root(root: &Root) -> Result<Self, PatternError> {
        let rewritten: Vec<String> = root
            .when_modified
            .iter()
            .map(|p| match p.trim().strip_prefix('!') {
                Some(rest) => format!("!{}", join_relative(&root.path, rest)),
                None => join_relative(&root.path, p.trim()),
            })
            .collect();
        Self::new(&rewritten)
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = clean_path(path);
        let mut matched = false;
        for p in &self.patterns {
            // Inclusions only matter while unmatched, exclusions only once matched.
            if p.exclusion != matched {
                continue;
            }
            if p.matches(&path) {
                matched = !p.exclusion;
            }
        }
        matched
    }

    pub fn matches_any<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        paths.iter().any(|p| self.matches(p.as_ref()))
    }
}

/// Lexically join `rel` onto `base`, resolving `.` and `..` components.
pub fn join_relative(base: &str, rel: &str) -> String {
    let joined = if base.is_empty() || base == "." {
        rel.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel)
    };
    clean_path(&joined)
}

fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
