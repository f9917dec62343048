//! Newtype domain identifiers.
//!
//! Every relay concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! a [`SubscriptionId`] with an [`EventStoreServerId`] even though both are
//! UUIDs under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for UUID-wrapped newtypes.
// Generates: struct (Copy), new_random(), from_uuid(), as_uuid(), is_nil(),
// Display.
// ---------------------------------------------------------------------------
macro_rules! uuid_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID. The nil UUID is accepted here; callers
            /// that require a real identity check [`Self::is_nil`].
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying [`Uuid`].
            pub fn as_uuid(self) -> Uuid {
                self.0
            }

            /// Returns `true` for the all-zero UUID.
            pub fn is_nil(self) -> bool {
                self.0.is_nil()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (assigned by the configuration store)
// ---------------------------------------------------------------------------

uuid_id! {
    /// Identifies a subscription configuration record and the runtime that
    /// serves it.
    ///
    /// Shared by persistent subscriptions and catch-up jobs: the runtime,
    /// its configuration record and the events it receives all carry the same
    /// value.
    SubscriptionId
}

uuid_id! {
    /// Identifies the event store server whose configuration scope a relay
    /// process serves.
    EventStoreServerId
}

uuid_id! {
    /// Identifies a single recorded event in the event store.
    EventId
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (stream and group names)
// ---------------------------------------------------------------------------

string_id! {
    /// The name of an event stream in the store (e.g. `"orders"`).
    StreamName
}

string_id! {
    /// The name of a persistent subscription consumer group, or the display
    /// name of a catch-up job.
    GroupName
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stream_name_is_rejected() {
        assert!(StreamName::new("").is_none());
        assert_eq!(StreamName::new("orders").unwrap().as_str(), "orders");
    }

    #[test]
    fn nil_subscription_id_is_detectable() {
        assert!(SubscriptionId::from_uuid(Uuid::nil()).is_nil());
        assert!(!SubscriptionId::new_random().is_nil());
    }

    #[test]
    fn uuid_ids_serialise_as_bare_strings() {
        let id = SubscriptionId::from_uuid(Uuid::from_u128(7));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", Uuid::from_u128(7)));
    }
}
