//! Keys and patterns
//!
//! A key is an ordered sequence of non-empty segments. Its external form
//! joins the segments with a separator character, and patterns may use a
//! single-level and a multi-level wildcard token. All three characters can
//! be negotiated with the store during the handshake, so parsing and
//! formatting go through a [`Syntax`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Default segment separator
pub const DEFAULT_SEPARATOR: char = '/';

/// Default single-level wildcard
pub const DEFAULT_WILDCARD: char = '?';

/// Default multi-level wildcard
pub const DEFAULT_MULTI_WILDCARD: char = '#';

/// Separator and wildcard characters used by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Syntax {
    pub separator: char,
    pub wildcard: char,
    pub multi_wildcard: char,
}

impl Default for Syntax {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR,
            wildcard: DEFAULT_WILDCARD,
            multi_wildcard: DEFAULT_MULTI_WILDCARD,
        }
    }
}

impl Syntax {
    /// Check that the three characters are distinct
    pub fn is_valid(&self) -> bool {
        self.separator != self.wildcard
            && self.separator != self.multi_wildcard
            && self.wildcard != self.multi_wildcard
    }

    /// Parse a concrete key
    ///
    /// Rejects empty keys, empty segments and wildcard segments.
    pub fn parse_key(&self, raw: &str) -> ClientResult<Key> {
        let invalid = |reason| ClientError::InvalidKey {
            key: raw.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("key is empty"));
        }

        let mut segments = Vec::new();
        for segment in raw.split(self.separator) {
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            if self.is_wildcard(segment) {
                return Err(invalid("wildcards are only allowed in patterns"));
            }
            segments.push(segment.to_string());
        }

        Ok(Key { segments })
    }

    /// Parse a pattern
    ///
    /// The multi-level wildcard is only accepted as the last segment.
    pub fn parse_pattern(&self, raw: &str) -> ClientResult<Pattern> {
        let invalid = |reason| ClientError::InvalidPattern {
            pattern: raw.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let parts: Vec<&str> = raw.split(self.separator).collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (index, part) in parts.into_iter().enumerate() {
            if part.is_empty() {
                return Err(invalid("empty segment"));
            }
            let segment = if self.is_single(part) {
                PatternSegment::Wildcard
            } else if self.is_multi(part) {
                if index != last {
                    return Err(invalid("multi-level wildcard must be the last segment"));
                }
                PatternSegment::MultiWildcard
            } else {
                PatternSegment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Pattern { segments })
    }

    /// Join a key's segments with this separator
    pub fn format_key(&self, key: &Key) -> String {
        key.join(self.separator)
    }

    /// Render a pattern with this separator and these wildcards
    pub fn format_pattern(&self, pattern: &Pattern) -> String {
        let mut out = String::new();
        for (index, segment) in pattern.segments.iter().enumerate() {
            if index > 0 {
                out.push(self.separator);
            }
            match segment {
                PatternSegment::Literal(s) => out.push_str(s),
                PatternSegment::Wildcard => out.push(self.wildcard),
                PatternSegment::MultiWildcard => out.push(self.multi_wildcard),
            }
        }
        out
    }

    fn is_single(&self, segment: &str) -> bool {
        is_char(segment, self.wildcard)
    }

    fn is_multi(&self, segment: &str) -> bool {
        is_char(segment, self.multi_wildcard)
    }

    fn is_wildcard(&self, segment: &str) -> bool {
        self.is_single(segment) || self.is_multi(segment)
    }
}

fn is_char(segment: &str, c: char) -> bool {
    let mut chars = segment.chars();
    chars.next() == Some(c) && chars.next().is_none()
}

/// A concrete key in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    segments: Vec<String>,
}

impl Key {
    /// Parse a key using the default syntax
    pub fn parse(raw: &str) -> ClientResult<Self> {
        Syntax::default().parse_key(raw)
    }

    /// Build a key from already split segments
    pub fn from_segments<I, S>(segments: I) -> ClientResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(ClientError::InvalidKey {
                key: String::new(),
                reason: "key is empty",
            });
        }
        if segments.iter().any(String::is_empty) {
            return Err(ClientError::InvalidKey {
                key: segments.join("/"),
                reason: "empty segment",
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (never zero)
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Check whether `prefix` is an ancestor of (or equal to) this key
    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Key of a direct child
    pub fn child(&self, segment: impl Into<String>) -> ClientResult<Key> {
        let segment = segment.into();
        if segment.is_empty() {
            return Err(ClientError::InvalidKey {
                key: self.to_string(),
                reason: "empty segment",
            });
        }
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    pub fn join(&self, separator: char) -> String {
        let mut out = String::new();
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                out.push(separator);
            }
            out.push_str(segment);
        }
        out
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join(DEFAULT_SEPARATOR))
    }
}

/// One segment of a pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    /// Matches this exact segment
    Literal(String),
    /// Matches exactly one segment
    Wildcard,
    /// Matches zero or more trailing segments
    MultiWildcard,
}

/// A key template matching a set of concrete keys
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    segments: Vec<PatternSegment>,
}

impl Pattern {
    /// Parse a pattern using the default syntax
    pub fn parse(raw: &str) -> ClientResult<Self> {
        Syntax::default().parse_pattern(raw)
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// True when the pattern contains no wildcard
    pub fn is_concrete(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    /// Check whether a concrete key matches this pattern
    pub fn matches(&self, key: &Key) -> bool {
        let mut remaining = key.segments().iter();
        for segment in &self.segments {
            match segment {
                PatternSegment::MultiWildcard => return true,
                PatternSegment::Wildcard => {
                    if remaining.next().is_none() {
                        return false;
                    }
                }
                PatternSegment::Literal(literal) => match remaining.next() {
                    Some(s) if s == literal => {}
                    _ => return false,
                },
            }
        }
        remaining.next().is_none()
    }
}

impl From<Key> for Pattern {
    fn from(key: Key) -> Self {
        Self {
            segments: key
                .segments
                .into_iter()
                .map(PatternSegment::Literal)
                .collect(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Syntax::default().format_pattern(self))
    }
}
