// ABOUTME: Path exclusion rules applied while synchronizing a project tree
// ABOUTME: Supports segment matches, multi-segment directory matches and wildcard globs

use std::path::{Component, Path};

/// Patterns that are never worth sending to a remote environment
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".nuxt",
    ".output",
    ".astro",
    ".wrangler",
    ".cache",
    ".turbo",
    ".vercel",
    ".netlify",
    "coverage",
    ".nyc_output",
    "*.log",
    ".DS_Store",
    "Thumbs.db",
    ".env",
    ".env.*",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    /// One or more whole path segments that must appear consecutively
    Segments(Vec<String>),
    /// Wildcard pattern; matched against the file name, or the whole path if it contains `/`
    Glob { pattern: String, whole_path: bool },
}

impl Rule {
    fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().trim_matches('/');
        if pattern.is_empty() {
            return None;
        }
        if pattern.contains('*') || pattern.contains('?') {
            return Some(Rule::Glob {
                pattern: pattern.to_string(),
                whole_path: pattern.contains('/'),
            });
        }
        Some(Rule::Segments(
            pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    fn matches(&self, segments: &[String], joined: &str) -> bool {
        match self {
            Rule::Segments(rule) => segments
                .windows(rule.len())
                .any(|window| window == rule.as_slice()),
            Rule::Glob {
                pattern,
                whole_path: true,
            } => wildcard_match(pattern, joined),
            Rule::Glob {
                pattern,
                whole_path: false,
            } => segments
                .last()
                .is_some_and(|name| wildcard_match(pattern, name)),
        }
    }
}

/// Ordered exclusion patterns; a path is excluded when any rule matches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionRuleSet {
    patterns: Vec<String>,
    rules: Vec<Rule>,
}

impl ExclusionRuleSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        set.extend(patterns);
        set
    }

    pub fn defaults() -> Self {
        Self::new(DEFAULT_EXCLUDES)
    }

    /// Defaults plus caller rules; caller rules never replace a default
    pub fn with_defaults<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::defaults();
        set.extend(extra);
        set
    }

    pub fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if self.patterns.iter().any(|p| p == pattern) {
                continue;
            }
            if let Some(rule) = Rule::parse(pattern) {
                self.patterns.push(pattern.to_string());
                self.rules.push(rule);
            }
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// `relative` is relative to the sync root
    pub fn should_exclude(&self, relative: &Path) -> bool {
        let segments: Vec<String> = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if segments.is_empty() {
            return false;
        }
        let joined = segments.join("/");
        self.rules.iter().any(|rule| rule.matches(&segments, &joined))
    }
}

/// `*` matches any run of characters (including none), `?` exactly one
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
