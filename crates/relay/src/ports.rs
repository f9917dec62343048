//! Port traits the relay depends on.
//!
//! The engine is written against these traits only. Infrastructure crates
//! supply the implementations:
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`ConfigurationRepository`] | `repository` crate (in-memory, JSON file) |
//! | [`StoreConnectionProvider`] / [`StoreConnection`] | `store` crate |
//! | [`EndpointDispatcher`] | `webhook` crate |
//!
//! Every repository call takes a [`CancellationToken`] so shutdown can abandon
//! calls in flight. All repository operations are idempotent except
//! [`ConfigurationRepository::delete_catchup_subscription`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    CatchupSubscriptionConfiguration, DeliveryError, Endpoint, EventEnvelope, EventStoreServer,
    EventStoreServerId, GroupName, ProviderError, RepositoryError, StreamName, SubscriptionDropped,
    SubscriptionConfiguration, SubscriptionId,
};

// ---------------------------------------------------------------------------
// Configuration repository
// ---------------------------------------------------------------------------

/// CRUD over subscription and catch-up configuration records.
#[async_trait]
pub trait ConfigurationRepository: Send + Sync {
    /// All persistent subscription configurations owned by `server_id`.
    async fn list_subscription_configurations(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<Vec<SubscriptionConfiguration>, RepositoryError>;

    /// One persistent subscription configuration, or `NotFound`.
    async fn get_subscription_configuration(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionConfiguration, RepositoryError>;

    /// One catch-up configuration, or `NotFound`.
    async fn get_catchup_subscription_configuration(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<CatchupSubscriptionConfiguration, RepositoryError>;

    /// The oldest catch-up configuration (by creation time) owned by
    /// `server_id`, or `None`.
    ///
    /// This is the only claiming primitive: the relay adds no locking of its
    /// own, so several relay processes sharing one store would need the
    /// implementation to hand each record out once.
    async fn get_next_catchup_subscription_configuration(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<Option<CatchupSubscriptionConfiguration>, RepositoryError>;

    /// Clears the one-shot replay position of a subscription configuration.
    async fn reset_subscription_stream_position(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError>;

    /// Deletes a finished catch-up job. `NotFound` if it is already gone.
    async fn delete_catchup_subscription(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError>;

    /// Connection details of an event store server.
    async fn get_event_store_server(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<EventStoreServer, RepositoryError>;
}

// ---------------------------------------------------------------------------
// Store connection
// ---------------------------------------------------------------------------

/// Callbacks a store connection invokes on the subscription that opened it.
///
/// The store may call these from its own tasks, concurrently with each other
/// and with anything else the relay is doing.
#[async_trait]
pub trait SubscriptionCallbacks: Send + Sync {
    /// An event arrived.
    ///
    /// `Ok(true)` acknowledges it. `Ok(false)` means it was handled locally and
    /// must not be redelivered. `Err` leaves redelivery to the store, guided by
    /// [`DeliveryError::retry_policy`].
    async fn on_event_appeared(&self, event: EventEnvelope) -> Result<bool, DeliveryError>;

    /// The store dropped the subscription.
    async fn on_dropped(&self, dropped: SubscriptionDropped);

    /// A catch-up subscription consumed all historical events.
    async fn on_caught_up(&self, id: SubscriptionId);
}

/// Opens connections to the event store.
#[async_trait]
pub trait StoreConnectionProvider: Send + Sync {
    /// Returns a connection whose subscriptions report to `callbacks`.
    async fn get_connection(
        &self,
        callbacks: Arc<dyn SubscriptionCallbacks>,
    ) -> Result<Arc<dyn StoreConnection>, ProviderError>;
}

/// A live connection to the event store.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Creates the persistent subscription group if needed and connects to it.
    ///
    /// `start_from` positions a newly created group; an existing group keeps
    /// its server-side checkpoint.
    async fn connect_persistent(
        &self,
        stream: &StreamName,
        group: &GroupName,
        id: SubscriptionId,
        buffer_size: usize,
        start_from: Option<i64>,
    ) -> Result<(), ProviderError>;

    /// Starts a catch-up subscription after `position` (`None` for the
    /// beginning of the stream).
    async fn subscribe_catch_up_from(
        &self,
        id: SubscriptionId,
        stream: &StreamName,
        position: Option<i64>,
        endpoint: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Deletes a persistent subscription group.
    async fn delete_persistent_subscription(
        &self,
        stream: &StreamName,
        group: &GroupName,
    ) -> Result<(), ProviderError>;
}

// ---------------------------------------------------------------------------
// Endpoint dispatch
// ---------------------------------------------------------------------------

/// Sends one event to one webhook endpoint.
#[async_trait]
pub trait EndpointDispatcher: Send + Sync {
    /// Returns `Ok(())` for a 2xx response and a classified
    /// [`DeliveryError`] otherwise. Abandons the request when `cancel` fires.
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        event: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;
}
