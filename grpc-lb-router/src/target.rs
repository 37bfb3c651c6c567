//! Parsing of channel targets such as `dns:///my.service:50051`.

use std::fmt;

/// The logical name a router connects to, split into `scheme://authority/path`.
///
/// A target without `://` uses the default scheme (the empty string) and
/// carries the whole input as its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    original: String,
    scheme: String,
    authority: String,
    path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("target is empty")]
    Empty,
    #[error("target '{0}' has an empty scheme")]
    EmptyScheme(String),
    #[error("target '{target}' has an invalid scheme '{scheme}'")]
    InvalidScheme { target: String, scheme: String },
}

impl Target {
    /// Parse a user-supplied target string.
    pub fn parse(target: &str) -> Result<Self, ParseError> {
        if target.is_empty() {
            return Err(ParseError::Empty);
        }

        let Some((scheme, rest)) = target.split_once("://") else {
            return Ok(Self {
                original: target.to_string(),
                scheme: String::new(),
                authority: String::new(),
                path: target.to_string(),
            });
        };

        if scheme.is_empty() {
            return Err(ParseError::EmptyScheme(target.to_string()));
        }
        if !is_valid_scheme(scheme) {
            return Err(ParseError::InvalidScheme {
                target: target.to_string(),
                scheme: scheme.to_string(),
            });
        }

        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };

        Ok(Self {
            original: target.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_string(),
            path: path.to_string(),
        })
    }

    /// The scheme, lowercased. Empty when the target did not name one.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The target string exactly as it was supplied.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// The path with its leading `/` removed, e.g. `my.service:50051`.
    pub fn endpoint(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl std::str::FromStr for Target {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// RFC 3986: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )
fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
