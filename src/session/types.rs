//! Correlation types for in-flight SAML login attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::IdentityAssertion;

/// Longest token accepted from the wire.
pub const MAX_TOKEN_LEN: usize = 128;

/// Opaque correlation token (16-byte random value, hex-encoded when generated).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateToken(String);

impl StateToken {
    /// Generate a new random token.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Accept a token received from the browser or IdP.
    ///
    /// Only URL-safe characters are allowed so the value round-trips through
    /// query strings and RelayState unchanged.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > MAX_TOKEN_LEN {
            return None;
        }
        let url_safe = s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~'));
        url_safe.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for logs.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(8).collect();
        format!("{}…", prefix)
    }
}

impl std::fmt::Display for StateToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    /// Redirect issued, waiting for the IdP callback.
    Pending,
    /// Callback validated; holds the assertion until consumed.
    Asserted(IdentityAssertion),
}

/// A stored login attempt.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

impl CorrelationEntry {
    pub fn pending() -> Self {
        Self {
            status: EntryStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn is_asserted(&self) -> bool {
        matches!(self.status, EntryStatus::Asserted(_))
    }

    /// Age of the entry relative to `now` (zero if the clock went backwards).
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }

    /// Check if the entry is older than `max_age`.
    pub fn is_older_than(&self, max_age: std::time::Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => self.age(now) > max_age,
            Err(_) => false,
        }
    }
}
