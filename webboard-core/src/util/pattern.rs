//! Servlet-style URL patterns.
//!
//! Matching follows the usual container precedence: an exact match beats the longest path-prefix
//! match (`/foo/*`), which beats an extension match (`*.ext`), which beats the default servlet
//! (`/`). Regex patterns rank below extension matches and above the default servlet.
use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UrlPattern {
    /// `/foo/bar`, or `""` for the context root.
    Exact(String),
    /// `/foo/*`, stored without the trailing `/*`; `/*` is stored as an empty prefix.
    Prefix(String),
    /// `*.jsp`, stored without the leading `*.`.
    Extension(String),
    /// `/`
    Default,
}

/// How a path matched a pattern. Variants are declared in ascending precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Default,
    Regex,
    Extension,
    /// Carries the length of the matched prefix, longer wins.
    Prefix(usize),
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub kind: MatchKind,
    pub servlet_path: String,
    pub path_info: Option<String>,
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidPattern(pattern.to_string());
        if pattern.is_empty() {
            return Ok(UrlPattern::Exact(String::new()));
        }
        if pattern == "/" {
            return Ok(UrlPattern::Default);
        }
        if let Some(ext) = pattern.strip_prefix("*.") {
            if ext.is_empty() || ext.contains(['/', '*']) {
                return Err(invalid());
            }
            return Ok(UrlPattern::Extension(ext.to_string()));
        }
        if !pattern.starts_with('/') {
            return Err(invalid());
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            if prefix.contains('*') {
                return Err(invalid());
            }
            return Ok(UrlPattern::Prefix(prefix.to_string()));
        }
        if pattern.contains('*') {
            return Err(invalid());
        }
        Ok(UrlPattern::Exact(pattern.to_string()))
    }

    /// Matches `path`, the request path below the context path.
    pub fn matches(&self, path: &str) -> Option<PatternMatch> {
        match self {
            UrlPattern::Exact(exact) if exact.is_empty() => {
                (path.is_empty() || path == "/").then(|| PatternMatch {
                    kind: MatchKind::Exact,
                    servlet_path: String::new(),
                    path_info: Some("/".to_string()),
                })
            }
            UrlPattern::Exact(exact) => (path == exact).then(|| PatternMatch {
                kind: MatchKind::Exact,
                servlet_path: exact.clone(),
                path_info: None,
            }),
            UrlPattern::Prefix(prefix) => {
                let rest = path.strip_prefix(prefix.as_str())?;
                if !(rest.is_empty() || rest.starts_with('/')) {
                    return None;
                }
                Some(PatternMatch {
                    kind: MatchKind::Prefix(prefix.len()),
                    servlet_path: prefix.clone(),
                    path_info: (!rest.is_empty()).then(|| rest.to_string()),
                })
            }
            UrlPattern::Extension(ext) => {
                let last = path.rsplit('/').next().unwrap_or(path);
                let (_, found) = last.rsplit_once('.')?;
                (found == ext).then(|| PatternMatch {
                    kind: MatchKind::Extension,
                    servlet_path: path.to_string(),
                    path_info: None,
                })
            }
            UrlPattern::Default => Some(PatternMatch {
                kind: MatchKind::Default,
                servlet_path: path.to_string(),
                path_info: None,
            }),
        }
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlPattern::Exact(exact) => f.write_str(exact),
            UrlPattern::Prefix(prefix) => write!(f, "{prefix}/*"),
            UrlPattern::Extension(ext) => write!(f, "*.{ext}"),
            UrlPattern::Default => f.write_str("/"),
        }
    }
}

/// The matching rule set of an element: url patterns and regex patterns are mutually exclusive.
#[derive(Debug, Clone, Default)]
pub enum Patterns {
    #[default]
    None,
    Url(Vec<UrlPattern>),
    Regex(Vec<Regex>),
}

impl Patterns {
    pub fn parse_urls<I, S>(name: &str, patterns: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed: Vec<UrlPattern> = Vec::new();
        for raw in patterns {
            let pattern = UrlPattern::parse(raw.as_ref())?;
            if parsed.contains(&pattern) {
                return Err(ValidationError::DuplicatePattern {
                    name: name.to_string(),
                    pattern: pattern.to_string(),
                });
            }
            parsed.push(pattern);
        }
        Ok(if parsed.is_empty() {
            Patterns::None
        } else {
            Patterns::Url(parsed)
        })
    }

    pub fn parse_regexes<I, S>(name: &str, patterns: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed: Vec<Regex> = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref();
            if parsed.iter().any(|r| r.as_str() == raw) {
                return Err(ValidationError::DuplicatePattern {
                    name: name.to_string(),
                    pattern: raw.to_string(),
                });
            }
            let regex = Regex::new(raw).map_err(|e| ValidationError::InvalidRegex {
                pattern: raw.to_string(),
                reason: e.to_string(),
            })?;
            parsed.push(regex);
        }
        Ok(if parsed.is_empty() {
            Patterns::None
        } else {
            Patterns::Regex(parsed)
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Patterns::None)
    }

    pub fn url_patterns(&self) -> &[UrlPattern] {
        match self {
            Patterns::Url(urls) => urls,
            _ => &[],
        }
    }

    /// Best match of `path` over all patterns.
    pub fn best_match(&self, path: &str) -> Option<PatternMatch> {
        match self {
            Patterns::None => None,
            Patterns::Url(urls) => urls
                .iter()
                .filter_map(|p| p.matches(path))
                .max_by_key(|m| m.kind),
            Patterns::Regex(regexes) => regexes.iter().find(|r| r.is_match(path)).map(|_| {
                PatternMatch {
                    kind: MatchKind::Regex,
                    servlet_path: path.to_string(),
                    path_info: None,
                }
            }),
        }
    }

    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Patterns::None => Vec::new(),
            Patterns::Url(urls) => urls.iter().map(ToString::to_string).collect(),
            Patterns::Regex(regexes) => regexes.iter().map(|r| r.as_str().to_string()).collect(),
        }
    }
}
