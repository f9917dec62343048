//! Subscription lifecycle engine for the event relay.
//!
//! This crate turns configuration records into live store subscriptions and
//! keeps the two in step:
//!
//! - [`cache`] polls the configuration repository and reports what was added,
//!   removed or flagged for replay since the last poll.
//! - [`subscription`] owns one store subscription and forwards each event it
//!   receives to the configured webhook endpoint.
//! - [`orchestrator`] reacts to cache notifications by starting, stopping and
//!   restarting runtimes, and claims catch-up jobs one at a time.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The engine sequences calls between the domain in
//! the [`relay`] crate and the port implementations (repository, store,
//! webhook). It performs no I/O of its own.

pub mod cache;
pub mod orchestrator;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use cache::{
    diff_configurations, CacheEvent, CacheEventKind, CacheListener, ConfigurationCache,
    ConfigurationDiff, ListenerId,
};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use subscription::{
    CompletionSender, RuntimeContext, StartOptions, SubscriptionRuntime, SubscriptionSnapshot,
};
