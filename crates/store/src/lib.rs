//! Event relay store connection infrastructure.
//!
//! Implements [`relay::StoreConnectionProvider`] with [`InMemoryEventStore`],
//! an in-process event store with server-tracked persistent subscription
//! groups and catch-up subscriptions. It backs the `memory://` connection
//! string, local runs and the end-to-end tests.
//!
//! ## Delivery semantics
//!
//! | Subscription | Handler result | Store behaviour |
//! |--------------|----------------|-----------------|
//! | Persistent | `Ok(true)` | acknowledged, checkpoint advances |
//! | Persistent | `Ok(false)` | parked, checkpoint advances |
//! | Persistent | retryable `Err` | redelivered up to `max_retry_count` times, then parked |
//! | Persistent | non-retryable `Err` | parked |
//! | Catch-up | `Ok(_)` | position advances |
//! | Catch-up | `Err` | subscription dropped with [`relay::DropReason::EventHandlerException`] |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** The engine sees only the port traits.

mod memory;

use std::time::Duration;

use relay::EventStoreSettings;
use thiserror::Error;

pub use memory::{InMemoryEventStore, RecordedEvent};

/// Connection-string scheme served by [`InMemoryEventStore`].
pub const MEMORY_SCHEME: &str = "memory://";

/// Redeliveries of a failing persistent event before it is parked.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unsupported event store connection string [{0}], expected {MEMORY_SCHEME}")]
    UnsupportedConnectionString(String),
}

/// Tunables for [`InMemoryEventStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Name reported in logs for every connection.
    pub connection_name: String,
    pub max_retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            connection_name: "event-relay".to_string(),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl StoreOptions {
    /// Options for the store named by `settings`; only `memory://` is served.
    pub fn from_settings(settings: &EventStoreSettings) -> Result<Self, StoreError> {
        if !settings.connection_string.starts_with(MEMORY_SCHEME) {
            return Err(StoreError::UnsupportedConnectionString(
                settings.connection_string.clone(),
            ));
        }
        let mut options = Self::default();
        if !settings.connection_name.trim().is_empty() {
            options.connection_name = settings.connection_name.clone();
        }
        Ok(options)
    }
}
