//! Correlation of in-flight SAML login attempts.
//!
//! This module provides the concurrent token -> attempt store shared by the
//! login and callback paths, with TTL expiry and a background sweep.

pub mod cleanup;
pub mod store;
pub mod types;

pub use cleanup::{spawn_sweep_task, DEFAULT_SWEEP_INTERVAL_SECS};
pub use store::CorrelationStore;
pub use types::{CorrelationEntry, EntryStatus, StateToken};
