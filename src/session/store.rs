//! Correlation store for in-flight SAML login attempts.
//!
//! Maps an opaque state token to a pending or asserted login attempt:
//! - Sharded concurrent map, so unrelated logins never contend on one lock
//! - Per-token linearizable `register` / `complete` / `consume`
//! - TTL-based expiry with a background sweep

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cleanup::spawn_sweep_task;
use super::types::{CorrelationEntry, EntryStatus, StateToken};
use crate::error::{SsoError, SsoResult};
use crate::identity::IdentityAssertion;

/// Correlation store shared by the login and callback paths.
pub struct CorrelationStore {
    /// Token -> attempt. Each shard lock guards every transition of its keys.
    entries: DashMap<StateToken, CorrelationEntry>,

    /// Maximum age of an entry before it is treated as absent.
    ttl: Duration,

    /// Background sweep task, if started.
    sweeper: Mutex<Option<JoinHandle<()>>>,

    shut_down: AtomicBool,
}

impl CorrelationStore {
    /// Create an empty store whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            sweeper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert a new pending entry for a freshly issued token.
    pub fn register(&self, token: &StateToken) -> SsoResult<()> {
        match self.entries.entry(token.clone()) {
            Entry::Occupied(_) => {
                warn!(token = %token.redacted(), "Correlation token collision on register");
                Err(SsoError::DuplicateToken)
            }
            Entry::Vacant(slot) => {
                slot.insert(CorrelationEntry::pending());
                debug!(token = %token.redacted(), "Registered pending login attempt");
                Ok(())
            }
        }
    }

    /// Attach a validated assertion to a pending entry.
    ///
    /// Fails without touching the store if the token is unknown, expired, or
    /// already asserted.
    pub fn complete(&self, token: &StateToken, assertion: IdentityAssertion) -> SsoResult<()> {
        let now = Utc::now();

        let mut entry = match self.entries.get_mut(token) {
            Some(entry) => entry,
            None => {
                debug!(token = %token.redacted(), "Callback for unknown correlation token");
                return Err(SsoError::UnknownToken);
            }
        };

        if entry.is_older_than(self.ttl, now) {
            debug!(token = %token.redacted(), "Callback for expired correlation token");
            return Err(SsoError::UnknownToken);
        }

        if entry.is_asserted() {
            warn!(
                token = %token.redacted(),
                "Duplicate callback for already asserted token rejected"
            );
            return Err(SsoError::AlreadyAsserted);
        }

        let username = assertion.username().to_string();
        let attribute_count = assertion.attributes().len();
        entry.status = EntryStatus::Asserted(assertion);

        info!(
            token = %token.redacted(),
            username = %username,
            attributes = attribute_count,
            "Login attempt asserted"
        );
        Ok(())
    }

    /// Take the assertion for a token, removing the entry.
    ///
    /// Returns `None` while the entry is still pending, when it is unknown, or
    /// when it has outlived the TTL.
    pub fn consume(&self, token: &StateToken) -> Option<IdentityAssertion> {
        let now = Utc::now();

        let (_, entry) = match self.entries.remove_if(token, |_, entry| entry.is_asserted()) {
            Some(removed) => removed,
            None => {
                debug!(
                    token = %token.redacted(),
                    pending = self.entries.contains_key(token),
                    "No assertion available for token"
                );
                return None;
            }
        };

        if entry.is_older_than(self.ttl, now) {
            debug!(token = %token.redacted(), "Discarded expired assertion");
            return None;
        }

        match entry.status {
            EntryStatus::Asserted(assertion) => {
                info!(
                    token = %token.redacted(),
                    username = %assertion.username(),
                    "Assertion consumed"
                );
                Some(assertion)
            }
            EntryStatus::Pending => None,
        }
    }

    /// Remove every entry older than `max_age`, pending or asserted.
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut evicted = 0;

        self.entries.retain(|_, entry| {
            let keep = !entry.is_older_than(max_age, now);
            if !keep {
                evicted += 1;
            }
            keep
        });

        evicted
    }

    /// Sweep with the store's own TTL.
    pub fn sweep(&self) -> usize {
        self.sweep_expired(self.ttl)
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// Replaces any sweep already running. Does nothing after `shutdown`.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> SsoResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("Correlation store is shut down, not starting sweep");
            return Ok(());
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(SsoError::Config(
                "correlation sweep requires a tokio runtime".to_string(),
            ));
        }

        // `shutdown` sets the flag before taking this lock, so checking under
        // the lock means no task is installed after shutdown.
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("Correlation store is shut down, not starting sweep");
            return Ok(());
        }

        let handle = spawn_sweep_task(Arc::downgrade(self), interval);
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }

        info!(interval_secs = interval.as_secs(), "Correlation sweep started");
        Ok(())
    }

    /// Whether a sweep task is attached and still running.
    pub fn is_sweeping(&self) -> bool {
        let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        sweeper.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop the background sweep and drop all entries. Idempotent.
    ///
    /// Foreground operations keep working afterwards; their entries are just
    /// no longer swept.
    pub fn shutdown(&self) {
        let first = !self.shut_down.swap(true, Ordering::SeqCst);

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let dropped = self.entries.len();
        self.entries.clear();

        if first {
            info!(dropped_entries = dropped, "Correlation store shut down");
        } else {
            debug!("Correlation store already shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn contains(&self, token: &StateToken) -> bool {
        self.entries.contains_key(token)
    }

    /// Check whether the entry for `token` is pending.
    pub fn is_pending(&self, token: &StateToken) -> bool {
        self.entries
            .get(token)
            .map(|e| !e.is_asserted())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries waiting for a callback (for logging).
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_asserted()).count()
    }

    /// Number of asserted entries waiting to be consumed (for logging).
    pub fn asserted_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_asserted()).count()
    }

    /// Shift an entry's creation time into the past.
    #[cfg(test)]
    pub(crate) fn backdate(&self, token: &StateToken, by: chrono::Duration) {
        if let Some(mut entry) = self.entries.get_mut(token) {
            entry.created_at = entry.created_at - by;
        }
    }
}

impl Drop for CorrelationStore {
    fn drop(&mut self) {
        if let Ok(sweeper) = self.sweeper.get_mut() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}
