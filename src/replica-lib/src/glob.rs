use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{ReplicaError, ReplicaResult};

/// Shell-style (fnmatch) pattern compiled to an anchored regex.
/// Supports `*`, `?`, `[seq]` and `[!seq]`; the whole name must match.
#[derive(Clone)]
pub struct GlobPattern {
    pattern: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> ReplicaResult<Self> {
        let translated = translate(pattern)?;
        let regex = Regex::new(&translated).map_err(|e| {
            ReplicaError::InvalidParam(format!("invalid glob pattern {}: {}", pattern, e))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

fn translate(pattern: &str) -> ReplicaResult<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 4);
    out.push_str("^(?s:");

    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    // unterminated class is a literal '['
                    out.push_str("\\[");
                    continue;
                }

                let mut class = String::from("[");
                let mut k = i;
                if chars[k] == '!' {
                    class.push('^');
                    k += 1;
                }
                if chars[k] == ']' {
                    class.push_str("\\]");
                    k += 1;
                }
                while k < j {
                    let ch = chars[k];
                    if ch == '\\' || ch == '[' || ch == '&' || ch == '~' || ch == '^' {
                        class.push('\\');
                    }
                    class.push(ch);
                    k += 1;
                }
                class.push(']');
                out.push_str(&class);
                i = j + 1;
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }

    out.push_str(")$");
    if chars.is_empty() {
        return Err(ReplicaError::InvalidParam("empty glob pattern".to_string()));
    }
    Ok(out)
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobPattern({:?})", self.pattern)
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Serialize for GlobPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for GlobPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        GlobPattern::new(&pattern).map_err(serde::de::Error::custom)
    }
}
