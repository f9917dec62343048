//! Core domain for the event relay.
//!
//! The relay forwards events from streams in an event-sourcing store to HTTP
//! webhook endpoints. This crate contains every domain concept, newtype
//! identifier, configuration record and error type used by the rest of the
//! workspace, plus the port traits infrastructure crates implement.
//!
//! ## Architectural Layer
//!
//! **Domain + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`SubscriptionId`, `StreamName`, etc.) |
//! | [`types`] | Configuration records, state-machine enums, the event envelope |
//! | [`settings`] | Engine and store connection settings |
//! | [`errors`] | Error taxonomy and retry policy |
//! | [`ports`] | Repository, store connection and dispatcher traits |

pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod settings;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{
    DeliveryError, ProviderError, RepositoryError, RetryPolicy, SubscriptionError,
    ValidationError,
};
pub use identifiers::{EventId, EventStoreServerId, GroupName, StreamName, SubscriptionId};
pub use ports::{
    ConfigurationRepository, EndpointDispatcher, StoreConnection, StoreConnectionProvider,
    SubscriptionCallbacks,
};
pub use settings::{EventStoreSettings, ServiceSettings, DEFAULT_CATCHUP_POLL_INTERVAL};
pub use types::{
    CatchupSubscriptionConfiguration, DropReason, Endpoint, EventEnvelope, EventStoreServer,
    SubscriptionConfiguration, SubscriptionDropped, SubscriptionStatus, SubscriptionType,
    Timestamp, DEFAULT_BUFFER_SIZE,
};
