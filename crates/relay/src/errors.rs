//! Error taxonomy and retry-policy types for the event relay.
//!
//! Each port has its own error type ([`RepositoryError`], [`ProviderError`],
//! [`DeliveryError`]); [`SubscriptionError`] is what a runtime's `start` and
//! `stop` return to their caller. None of these terminate the process: they are
//! fatal to the triggering operation only.
//!
//! [`RetryPolicy`] is a cross-cutting concern: a delivery error tells the store
//! connection whether redelivering the event can help.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EventId, SubscriptionId};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by [`DeliveryError::retry_policy`] so the store connection can
/// decide between redelivering (nack) and parking an event.
///
/// ## Rules
///
/// - `Retryable` errors: non-2xx responses, endpoint internal errors,
///   timeouts, transport failures, an unavailable configuration store.
/// - `NonRetryable` errors: cancelled dispatches, unserialisable envelopes,
///   configuration records that do not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means retry
        /// immediately or apply the caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Invalid arguments to a subscription start. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Subscription Id must not be an empty GUID")]
    EmptySubscriptionId,

    #[error("Stream Name must not be null or empty")]
    EmptyStreamName,

    #[error("Group Name must not be null or empty")]
    EmptyGroupName,
}

// ---------------------------------------------------------------------------
// Configuration repository
// ---------------------------------------------------------------------------

/// Failures reported by a [`crate::ConfigurationRepository`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// The referenced record does not exist.
    #[error("{entity} with Id {id} not found")]
    NotFound {
        /// Record kind, e.g. `"Subscription Configuration"`.
        entity: &'static str,
        id: String,
    },

    /// The backing store could not be read or written.
    #[error("Configuration store unavailable: {message}")]
    Unavailable { message: String },

    /// The call was abandoned because its cancellation token fired.
    #[error("Configuration store call cancelled")]
    Cancelled,
}

impl RepositoryError {
    /// Convenience constructor for a missing subscription configuration.
    pub fn subscription_not_found(id: SubscriptionId) -> Self {
        RepositoryError::NotFound {
            entity: "Subscription Configuration",
            id: id.to_string(),
        }
    }

    /// Convenience constructor for a missing catch-up configuration.
    pub fn catchup_not_found(id: SubscriptionId) -> Self {
        RepositoryError::NotFound {
            entity: "Catch Up Subscription",
            id: id.to_string(),
        }
    }

    /// Returns `true` for [`RepositoryError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

// ---------------------------------------------------------------------------
// Store connection provider
// ---------------------------------------------------------------------------

/// Failures opening or maintaining a store subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// No connection to the store could be established.
    #[error("Event store connection failed: {message}")]
    Connection { message: String },

    /// The store refused the subscription request.
    #[error("Event store rejected the request: {message}")]
    Rejected { message: String },
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Outcomes of forwarding one event that the store must hear about.
///
/// "Endpoint not found" is deliberately absent: it is logged and reported to
/// the store as a handled (`false`) result instead of an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The endpoint answered with a non-2xx status other than 500.
    #[error("Failed Posting to Subscription Group Endpoint [{status}]. Response [{body}]")]
    Failed {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The endpoint answered 500.
    #[error("Failed Posting to Subscription Group Endpoint - Internal Server Error")]
    EndpointInternalError { endpoint: String },

    /// The endpoint did not answer within the delivery bound.
    #[error("Error processing Event Id {event_id}. Attempted to Send to Uri: {endpoint}, request Timed out")]
    Timeout { endpoint: String, event_id: EventId },

    /// The request never produced a response (DNS, connect, TLS, ...).
    #[error("Error processing Event Id {event_id}. Attempted to Send to Uri: {endpoint}: {message}")]
    Transport {
        endpoint: String,
        event_id: EventId,
        message: String,
    },

    /// The relay is shutting down and abandoned the request.
    #[error("Delivery to {endpoint} cancelled by shutdown")]
    Cancelled { endpoint: String },

    /// The envelope could not be encoded as JSON.
    #[error("Event {event_id} could not be serialised: {message}")]
    Serialisation { event_id: EventId, message: String },

    /// The endpoint could not be resolved because the configuration store failed.
    #[error("Endpoint lookup failed: {0}")]
    Repository(#[from] RepositoryError),
}

impl DeliveryError {
    /// Whether redelivering the event could succeed.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            DeliveryError::Failed { .. }
            | DeliveryError::EndpointInternalError { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::Transport { .. } => RetryPolicy::Retryable { after: None },
            DeliveryError::Repository(RepositoryError::Unavailable { .. }) => {
                RetryPolicy::Retryable { after: None }
            }
            DeliveryError::Repository(_)
            | DeliveryError::Cancelled { .. }
            | DeliveryError::Serialisation { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription lifecycle
// ---------------------------------------------------------------------------

/// Errors returned by a subscription runtime's `start` and `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Error starting Subscription for Stream Name {stream} Group Name {group}")]
    Start {
        stream: String,
        group: String,
        #[source]
        source: ProviderError,
    },

    #[error("Error stopping Subscription for Stream Name {stream} Group Name {group}")]
    Stop {
        stream: String,
        group: String,
        #[source]
        source: ProviderError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn http_failures_are_retryable() {
        let err = DeliveryError::Failed {
            endpoint: "http://x/hook".into(),
            status: 404,
            body: "missing".into(),
        };
        assert!(err.retry_policy().is_retryable());
        assert_eq!(
            err.to_string(),
            "Failed Posting to Subscription Group Endpoint [404]. Response [missing]"
        );
    }

    #[test]
    fn cancellation_is_not_retryable() {
        let err = DeliveryError::Cancelled {
            endpoint: "http://x/hook".into(),
        };
        assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
    }

    #[test]
    fn missing_records_are_not_retryable_but_outages_are() {
        let id = SubscriptionId::from_uuid(Uuid::from_u128(3));
        let missing = DeliveryError::from(RepositoryError::subscription_not_found(id));
        assert_eq!(missing.retry_policy(), RetryPolicy::NonRetryable);

        let outage = DeliveryError::from(RepositoryError::Unavailable {
            message: "db down".into(),
        });
        assert!(outage.retry_policy().is_retryable());
    }
}
