//! Configuration cache: turns repository polling into add/remove/update
//! notifications.
//!
//! Every `CacheTimeout` the cache fetches the configuration set for its event
//! store server and diffs it against the set it saw last time, by identifier
//! only:
//!
//! - fetched but not cached → [`CacheEvent::Added`]
//! - cached but not fetched → [`CacheEvent::Removed`]
//! - in both, with a replay position set → [`CacheEvent::Updated`]
//!
//! `Updated` compares nothing but the presence of the replay position, so it
//! fires on every tick until the consumer clears the position.
//!
//! Notifications of one tick reach every listener synchronously, in
//! added → removed → updated order, before the tick returns.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay::{
    ConfigurationRepository, EventStoreServerId, RepositoryError, ServiceSettings,
    SubscriptionConfiguration, SubscriptionId,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// The three notification kinds a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    Added,
    Removed,
    Updated,
}

/// A single configuration change detected by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Added(SubscriptionConfiguration),
    Removed(SubscriptionConfiguration),
    Updated(SubscriptionConfiguration),
}

impl CacheEvent {
    pub fn kind(&self) -> CacheEventKind {
        match self {
            CacheEvent::Added(_) => CacheEventKind::Added,
            CacheEvent::Removed(_) => CacheEventKind::Removed,
            CacheEvent::Updated(_) => CacheEventKind::Updated,
        }
    }

    pub fn configuration(&self) -> &SubscriptionConfiguration {
        match self {
            CacheEvent::Added(c) | CacheEvent::Removed(c) | CacheEvent::Updated(c) => c,
        }
    }
}

/// Receives cache notifications.
///
/// Called from the poll task while the tick is in progress, so
/// implementations must not block; hand the event to a channel instead.
pub trait CacheListener: Send + Sync {
    fn notify(&self, event: &CacheEvent);
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn notify(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Handle returned by [`ConfigurationCache::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    kind: CacheEventKind,
    listener: Arc<dyn CacheListener>,
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Result of comparing a fetched configuration set with the cached one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationDiff {
    /// In fetch order.
    pub added: Vec<SubscriptionConfiguration>,
    /// The cached records, ordered by identifier.
    pub removed: Vec<SubscriptionConfiguration>,
    /// The fetched records, in fetch order.
    pub updated: Vec<SubscriptionConfiguration>,
}

impl ConfigurationDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    fn into_events(self) -> impl Iterator<Item = CacheEvent> {
        self.added
            .into_iter()
            .map(CacheEvent::Added)
            .chain(self.removed.into_iter().map(CacheEvent::Removed))
            .chain(self.updated.into_iter().map(CacheEvent::Updated))
    }
}

/// Compares `fetched` with `cached` by subscription identifier.
///
/// Field values are never compared: a record whose endpoint changed is neither
/// added nor removed, and it only counts as updated when its replay position
/// is set. Duplicate identifiers in `fetched` count once.
pub fn diff_configurations(
    cached: &HashMap<SubscriptionId, SubscriptionConfiguration>,
    fetched: &[SubscriptionConfiguration],
) -> ConfigurationDiff {
    let mut diff = ConfigurationDiff::default();
    let mut seen = HashSet::with_capacity(fetched.len());

    for config in fetched {
        if !seen.insert(config.subscription_id) {
            continue;
        }
        if !cached.contains_key(&config.subscription_id) {
            diff.added.push(config.clone());
        } else if config.stream_position_to_restart_from.is_some() {
            diff.updated.push(config.clone());
        }
    }

    let mut removed: Vec<_> = cached
        .values()
        .filter(|c| !seen.contains(&c.subscription_id))
        .cloned()
        .collect();
    removed.sort_by_key(|c| c.subscription_id);
    diff.removed = removed;

    diff
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Identifier-keyed view of the persistent subscriptions that should be
/// running, refreshed by polling.
pub struct ConfigurationCache {
    repository: Arc<dyn ConfigurationRepository>,
    server_id: EventStoreServerId,
    poll_interval: Duration,
    configurations: Mutex<HashMap<SubscriptionId, SubscriptionConfiguration>>,
    listeners: RwLock<Vec<Registration>>,
    next_listener_id: AtomicU64,
}

impl ConfigurationCache {
    pub fn new(repository: Arc<dyn ConfigurationRepository>, settings: &ServiceSettings) -> Self {
        Self {
            repository,
            server_id: settings.event_store_server_id,
            poll_interval: settings.cache_timeout,
            configurations: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Registers `listener` for one notification kind.
    pub async fn subscribe(
        &self,
        kind: CacheEventKind,
        listener: Arc<dyn CacheListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().await.push(Registration { id, kind, listener });
        id
    }

    /// Removes a registration. Returns `false` if it was already gone.
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Number of configurations currently cached.
    pub async fn len(&self) -> usize {
        self.configurations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.configurations.lock().await.is_empty()
    }

    /// Runs one poll: fetch, diff, update the cached set, notify.
    ///
    /// A failed fetch leaves the cached set untouched.
    pub async fn refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ConfigurationDiff, RepositoryError> {
        // Held for the whole tick so overlapping refreshes cannot interleave.
        let mut cached = self.configurations.lock().await;

        if cached.is_empty() {
            info!(server_id = %self.server_id, "First Initialisation of Cache");
        }

        let fetched = self
            .repository
            .list_subscription_configurations(self.server_id, cancel)
            .await?;

        let diff = diff_configurations(&cached, &fetched);
        if diff.is_empty() {
            debug!(cached = cached.len(), "Configuration unchanged");
            return Ok(diff);
        }

        for config in &diff.added {
            cached.insert(config.subscription_id, config.clone());
        }
        for config in &diff.removed {
            cached.remove(&config.subscription_id);
        }

        let listeners = self.listeners.read().await;
        for event in diff.clone().into_events() {
            deliver(&listeners, &event);
        }

        Ok(diff)
    }

    /// Starts polling: one refresh immediately, then one every `CacheTimeout`,
    /// until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.refresh(&cancel).await {
                            Ok(diff) if !diff.is_empty() => info!(
                                added = diff.added.len(),
                                removed = diff.removed.len(),
                                updated = diff.updated.len(),
                                "Cache refreshed"
                            ),
                            Ok(_) => {}
                            Err(RepositoryError::Cancelled) => break,
                            Err(err) => error!(error = %err, "Failed to refresh subscription configuration cache"),
                        }
                    }
                }
            }

            debug!("Configuration cache polling stopped");
        })
    }
}

fn deliver(listeners: &[Registration], event: &CacheEvent) {
    let config = event.configuration();
    let kind = event.kind();
    let mut delivered = false;

    for registration in listeners.iter().filter(|r| r.kind == kind) {
        info!(
            subscription_id = %config.subscription_id,
            stream = %config.stream_name,
            group = %config.group_name,
            ?kind,
            "Raising subscription group notification"
        );
        registration.listener.notify(event);
        delivered = true;
    }

    if !delivered {
        warn!(
            subscription_id = %config.subscription_id,
            group = %config.group_name,
            ?kind,
            "No listener registered, notification dropped"
        );
    }
}
