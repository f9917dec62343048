//! Shared value types for the event relay domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! the configuration records the relay reconciles against, the runtime
//! enumerations of the subscription state machine, and the envelope that is
//! forwarded to webhook endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventId, EventStoreServerId, GroupName, StreamName, SubscriptionId};

/// Default number of in-flight events a persistent subscription may buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Subscription state machine
// ---------------------------------------------------------------------------

/// The kind of store subscription a runtime owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionType {
    /// Server-tracked subscription with per-group acknowledgement.
    #[default]
    Persistent,
    /// One-shot replay from a stream position up to the live head.
    CatchUp,
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionType::Persistent => write!(f, "Persistent"),
            SubscriptionType::CatchUp => write!(f, "CatchUp"),
        }
    }
}

/// Lifecycle status of a subscription runtime.
///
/// `NotSet → Started → Stopped`; a dropped persistent subscription goes back
/// through `start` and remains `Started`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    /// Created but never started.
    #[default]
    NotSet,
    /// Connected (or connecting) to the store.
    Started,
    /// Stopped explicitly, by a failed start, or after a catch-up completed.
    Stopped,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::NotSet => write!(f, "NotSet"),
            SubscriptionStatus::Started => write!(f, "Started"),
            SubscriptionStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Why the store dropped a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// The subscription was closed on request.
    UserInitiated,
    /// The connection to the store was closed.
    ConnectionClosed,
    /// The server reported an error for this subscription.
    ServerError,
    /// The subscriber's event handler raised an error.
    EventHandlerException,
    /// The persistent subscription group was deleted on the server.
    PersistentSubscriptionDeleted,
    /// The stream or group could not be found.
    NotFound,
    /// Anything the store could not classify.
    Unknown,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Configuration records
// ---------------------------------------------------------------------------

/// A persistent relay rule: forward events of `stream_name` consumed through
/// `group_name` to `end_point_uri`.
///
/// `stream_position_to_restart_from` is a one-shot signal, not a checkpoint:
/// a value means an administrator asked for the subscription to be restarted
/// from that position. The relay clears it once the restart has happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfiguration {
    pub subscription_id: SubscriptionId,
    pub event_store_server_id: EventStoreServerId,
    pub stream_name: String,
    pub group_name: String,
    #[serde(default)]
    pub end_point_uri: Option<String>,
    #[serde(default)]
    pub stream_position_to_restart_from: Option<i64>,
}

/// A one-shot historical replay job.
///
/// Claimed oldest-first by `create_date_time`, replayed from `position`, and
/// deleted by the relay once the replay reaches the live head of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchupSubscriptionConfiguration {
    pub subscription_id: SubscriptionId,
    pub event_store_server_id: EventStoreServerId,
    pub stream_name: String,
    pub name: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub end_point_uri: Option<String>,
    pub create_date_time: Timestamp,
}

/// A resolved webhook destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// The configuration record the endpoint was resolved from.
    pub id: SubscriptionId,
    /// Group name or catch-up job name; used in log lines.
    pub name: String,
    pub url: String,
}

/// An event store server known to the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreServer {
    pub event_store_server_id: EventStoreServerId,
    pub name: String,
    pub connection_string: String,
}

// ---------------------------------------------------------------------------
// Store events
// ---------------------------------------------------------------------------

/// The body POSTed to a webhook endpoint, and the unit the store hands to a
/// subscription's event callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: EventId,
    /// The domain event exactly as it was written to the store.
    pub serialised_data: String,
    /// The subscription (or catch-up job) that received the event.
    pub subscription_group_id: SubscriptionId,
}

/// Notification that the store dropped a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDropped {
    pub stream_name: StreamName,
    pub group_name: GroupName,
    pub subscription_type: SubscriptionType,
    pub reason: DropReason,
    /// Rendered error that caused the drop, if any.
    pub error: Option<String>,
    pub subscription_id: SubscriptionId,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
