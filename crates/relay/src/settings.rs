//! Runtime settings consumed by the engine and the store adapters.
//!
//! These are plain validated values. Reading them from files or the
//! environment is the composition root's job.

use std::time::Duration;

use crate::EventStoreServerId;

/// How often the orchestrator looks for a catch-up job to claim.
pub const DEFAULT_CATCHUP_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Settings for the subscription lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Interval between configuration cache polls (`CacheTimeout`).
    pub cache_timeout: Duration,

    /// The configuration scope this relay process serves.
    pub event_store_server_id: EventStoreServerId,

    /// Interval between catch-up claiming attempts.
    pub catchup_poll_interval: Duration,
}

impl ServiceSettings {
    /// Creates settings with the default catch-up poll interval.
    pub fn new(cache_timeout: Duration, event_store_server_id: EventStoreServerId) -> Self {
        Self {
            cache_timeout,
            event_store_server_id,
            catchup_poll_interval: DEFAULT_CATCHUP_POLL_INTERVAL,
        }
    }

    /// Overrides the catch-up poll interval.
    #[must_use]
    pub fn with_catchup_poll_interval(mut self, interval: Duration) -> Self {
        self.catchup_poll_interval = interval;
        self
    }
}

/// Connection details for the event store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStoreSettings {
    pub connection_string: String,
    /// Name the connection announces to the store.
    pub connection_name: String,
    /// The store's HTTP management port.
    pub http_port: u16,
}
