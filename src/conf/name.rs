use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const MAX_NAME_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Tunnel name is not valid: {0:?}")]
pub struct NameError(pub String);

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-')
}

/// Names end up inside OS service names, pipe paths and file names.
pub fn tunnel_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH || is_reserved(name) {
        return false;
    }
    name.chars().all(is_allowed_char)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelName(String);

impl TunnelName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if !tunnel_name_is_valid(&name) {
            return Err(NameError(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TunnelName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TunnelName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TunnelName> for String {
    fn from(name: TunnelName) -> Self {
        name.0
    }
}

impl AsRef<str> for TunnelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SortToken {
    Number(u64),
    Text(String),
}

impl SortToken {
    fn compare(&self, other: &SortToken) -> Ordering {
        match (self, other) {
            (SortToken::Number(a), SortToken::Number(b)) => a.cmp(b),
            (SortToken::Number(_), SortToken::Text(_)) => Ordering::Less,
            (SortToken::Text(_), SortToken::Number(_)) => Ordering::Greater,
            (SortToken::Text(a), SortToken::Text(b)) => a.cmp(b),
        }
    }
}

fn flush_token(current: &mut String, is_digit: bool, tokens: &mut Vec<SortToken>) {
    if current.is_empty() {
        return;
    }
    let token = match is_digit {
        true => current
            .parse::<u64>()
            .map(SortToken::Number)
            .unwrap_or_else(|_| SortToken::Text(current.clone())),
        false => SortToken::Text(current.clone()),
    };
    tokens.push(token);
    current.clear();
}

fn sort_tokens(s: &str) -> Vec<SortToken> {
    let normalized = s
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_digit = false;

    for c in normalized.chars() {
        let is_digit = c.is_ascii_digit();
        if !current.is_empty() && is_digit != current_is_digit {
            flush_token(&mut current, current_is_digit, &mut tokens);
        }
        current_is_digit = is_digit;
        current.push(c);
    }
    flush_token(&mut current, current_is_digit, &mut tokens);

    tokens
}

/// Case-insensitive ordering that compares runs of digits numerically, so
/// "wg2" sorts before "wg10".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let (ta, tb) = (sort_tokens(a), sort_tokens(b));
    for (x, y) in ta.iter().zip(tb.iter()) {
        match x.compare(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    ta.len().cmp(&tb.len())
}

pub fn tunnel_name_is_less(a: &str, b: &str) -> bool {
    natural_cmp(a, b) == Ordering::Less
}
