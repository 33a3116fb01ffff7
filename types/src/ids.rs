//! Validated identifiers.
//!
//! A `SessionId` is used as a filesystem path component by the session store,
//! so construction enforces a restrictive charset up front - holding a
//! `SessionId` is proof that no traversal sequence can be smuggled through it.

use std::fmt;

use serde::{Deserialize, Serialize};

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id must not be empty")]
    Empty,
    #[error("session id exceeds {MAX_SESSION_ID_LEN} characters (got {len})")]
    TooLong { len: usize },
    #[error("session id contains invalid character {ch:?}")]
    InvalidChar { ch: char },
    #[error("session id must not start with a dot")]
    LeadingDot,
}

/// Opaque session identifier restricted to `[A-Za-z0-9._-]`, max 128 chars,
/// no leading dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, SessionIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong { len: id.len() });
        }
        if id.starts_with('.') {
            return Err(SessionIdError::LeadingDot);
        }
        if let Some(ch) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(SessionIdError::InvalidChar { ch });
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}
