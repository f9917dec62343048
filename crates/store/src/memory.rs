use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use relay::{
    DeliveryError, DropReason, EventEnvelope, EventId, GroupName, ProviderError, StoreConnection,
    StoreConnectionProvider, StreamName, SubscriptionCallbacks, SubscriptionDropped,
    SubscriptionId, SubscriptionType,
};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::StoreOptions;

/// Events a catch-up subscription reads per batch.
const CATCH_UP_READ_BATCH: usize = 100;

/// An event as stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event_id: EventId,
    pub stream: StreamName,
    /// Zero-based position within the stream.
    pub position: i64,
    pub data: String,
}

type GroupKey = (StreamName, GroupName);

struct Consumer {
    generation: u64,
    subscription_id: SubscriptionId,
    callbacks: Weak<dyn SubscriptionCallbacks>,
    cancel: CancellationToken,
}

struct GroupState {
    next_position: i64,
    parked: Vec<RecordedEvent>,
    consumer: Option<Consumer>,
}

struct CatchUpState {
    generation: u64,
    stream: StreamName,
    label: GroupName,
    callbacks: Weak<dyn SubscriptionCallbacks>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct StoreState {
    streams: HashMap<StreamName, Vec<RecordedEvent>>,
    groups: HashMap<GroupKey, GroupState>,
    catch_ups: HashMap<SubscriptionId, CatchUpState>,
    next_generation: u64,
}

impl StoreState {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn read(&self, stream: &StreamName, from: i64, max: usize) -> Vec<RecordedEvent> {
        let Some(events) = self.streams.get(stream) else {
            return Vec::new();
        };
        let start = usize::try_from(from.max(0)).unwrap_or(usize::MAX);
        events.iter().skip(start).take(max).cloned().collect()
    }
}

struct Inner {
    options: StoreOptions,
    state: Mutex<StoreState>,
    appended: watch::Sender<u64>,
    available: AtomicBool,
    cancel: CancellationToken,
}

enum Delivery {
    Acked,
    Parked,
    Abandoned,
}

/// In-process event store.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

impl InMemoryEventStore {
    pub fn new(options: StoreOptions) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(StoreState::default()),
                appended,
                available: AtomicBool::new(true),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Appends one event to `stream` and wakes every subscriber.
    pub async fn append(&self, stream: &StreamName, data: impl Into<String>) -> RecordedEvent {
        let recorded = {
            let mut state = self.inner.state.lock().await;
            let events = state.streams.entry(stream.clone()).or_default();
            let recorded = RecordedEvent {
                event_id: EventId::new_random(),
                stream: stream.clone(),
                position: events.len() as i64,
                data: data.into(),
            };
            events.push(recorded.clone());
            recorded
        };
        self.inner.appended.send_modify(|version| *version += 1);
        debug!(stream = %stream, position = recorded.position, event_id = %recorded.event_id, "Event appended");
        recorded
    }

    pub async fn read_stream(&self, stream: &StreamName) -> Vec<RecordedEvent> {
        self.inner
            .state
            .lock()
            .await
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// While unavailable, every connection and subscription request fails.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Disconnects the consumer of a persistent group, as a server would on a
    /// connection loss. The group and its checkpoint survive. Returns `false`
    /// when no consumer was connected.
    pub async fn drop_subscription(
        &self,
        stream: &StreamName,
        group: &GroupName,
        reason: DropReason,
    ) -> bool {
        let consumer = {
            let mut state = self.inner.state.lock().await;
            state
                .groups
                .get_mut(&(stream.clone(), group.clone()))
                .and_then(|g| g.consumer.take())
        };
        let Some(consumer) = consumer else {
            return false;
        };
        consumer.cancel.cancel();
        notify_dropped(
            consumer.callbacks,
            SubscriptionDropped {
                stream_name: stream.clone(),
                group_name: group.clone(),
                subscription_type: SubscriptionType::Persistent,
                reason,
                error: None,
                subscription_id: consumer.subscription_id,
            },
        );
        true
    }

    /// Ends a catch-up subscription and reports the drop.
    pub async fn drop_catch_up(&self, id: SubscriptionId, reason: DropReason) -> bool {
        let Some(catch_up) = self.inner.state.lock().await.catch_ups.remove(&id) else {
            return false;
        };
        catch_up.cancel.cancel();
        notify_dropped(
            catch_up.callbacks,
            SubscriptionDropped {
                stream_name: catch_up.stream,
                group_name: catch_up.label,
                subscription_type: SubscriptionType::CatchUp,
                reason,
                error: None,
                subscription_id: id,
            },
        );
        true
    }

    /// Existing persistent groups, sorted.
    pub async fn groups(&self) -> Vec<(StreamName, GroupName)> {
        let mut groups: Vec<_> = self.inner.state.lock().await.groups.keys().cloned().collect();
        groups.sort_by(|a, b| (a.0.as_str(), a.1.as_str()).cmp(&(b.0.as_str(), b.1.as_str())));
        groups
    }

    /// Position of the next event a persistent group will deliver.
    pub async fn checkpoint(&self, stream: &StreamName, group: &GroupName) -> Option<i64> {
        self.inner
            .state
            .lock()
            .await
            .groups
            .get(&(stream.clone(), group.clone()))
            .map(|g| g.next_position)
    }

    pub async fn parked(&self, stream: &StreamName, group: &GroupName) -> Vec<RecordedEvent> {
        self.inner
            .state
            .lock()
            .await
            .groups
            .get(&(stream.clone(), group.clone()))
            .map(|g| g.parked.clone())
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, stream: &StreamName, group: &GroupName) -> bool {
        self.inner
            .state
            .lock()
            .await
            .groups
            .get(&(stream.clone(), group.clone()))
            .is_some_and(|g| g.consumer.is_some())
    }

    /// Identifiers of running catch-up subscriptions, sorted.
    pub async fn catch_ups(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.inner.state.lock().await.catch_ups.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stops every subscription worker. Stored events and groups are kept.
    pub fn shutdown(&self) {
        info!(connection_name = %self.inner.options.connection_name, "Event store shutting down");
        self.inner.cancel.cancel();
    }
}

fn notify_dropped(callbacks: Weak<dyn SubscriptionCallbacks>, dropped: SubscriptionDropped) {
    let Some(callbacks) = callbacks.upgrade() else {
        debug!(subscription_id = %dropped.subscription_id, "Subscriber gone, drop not reported");
        return;
    };
    tokio::spawn(async move { callbacks.on_dropped(dropped).await });
}

#[async_trait]
impl StoreConnectionProvider for InMemoryEventStore {
    async fn get_connection(
        &self,
        callbacks: Arc<dyn SubscriptionCallbacks>,
    ) -> Result<Arc<dyn StoreConnection>, ProviderError> {
        self.inner.ensure_available()?;
        debug!(connection_name = %self.inner.options.connection_name, "Connection opened");
        Ok(Arc::new(InMemoryConnection {
            inner: self.inner.clone(),
            callbacks,
        }))
    }
}

/// A connection whose subscriptions all report to one set of callbacks.
struct InMemoryConnection {
    inner: Arc<Inner>,
    callbacks: Arc<dyn SubscriptionCallbacks>,
}

#[async_trait]
impl StoreConnection for InMemoryConnection {
    async fn connect_persistent(
        &self,
        stream: &StreamName,
        group: &GroupName,
        id: SubscriptionId,
        buffer_size: usize,
        start_from: Option<i64>,
    ) -> Result<(), ProviderError> {
        self.inner.ensure_available()?;
        let key = (stream.clone(), group.clone());
        let cancel = self.inner.cancel.child_token();

        let generation = {
            let mut state = self.inner.state.lock().await;
            let generation = state.generation();
            let group_state = state.groups.entry(key.clone()).or_insert_with(|| {
                info!(stream = %stream, group = %group, start_from = ?start_from, "Persistent subscription group created");
                GroupState {
                    next_position: start_from.unwrap_or(0).max(0),
                    parked: Vec::new(),
                    consumer: None,
                }
            });
            if let Some(previous) = group_state.consumer.replace(Consumer {
                generation,
                subscription_id: id,
                callbacks: Arc::downgrade(&self.callbacks),
                cancel: cancel.clone(),
            }) {
                previous.cancel.cancel();
            }
            generation
        };

        info!(
            connection_name = %self.inner.options.connection_name,
            stream = %stream,
            group = %group,
            subscription_id = %id,
            buffer_size,
            "Connected to persistent subscription"
        );
        tokio::spawn(run_persistent(
            self.inner.clone(),
            key,
            generation,
            id,
            buffer_size.max(1),
            Arc::downgrade(&self.callbacks),
            cancel,
        ));
        Ok(())
    }

    async fn subscribe_catch_up_from(
        &self,
        id: SubscriptionId,
        stream: &StreamName,
        position: Option<i64>,
        endpoint: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.inner.ensure_available()?;
        let label = endpoint
            .filter(|e| !e.trim().is_empty())
            .and_then(GroupName::new)
            .or_else(|| GroupName::new(id.to_string()))
            .ok_or_else(|| ProviderError::Rejected {
                message: format!("catch up subscription {id} has no name"),
            })?;
        // The position is the last event already seen.
        let start = position.map_or(0, |p| p + 1);
        let cancel = self.inner.cancel.child_token();

        let generation = {
            let mut state = self.inner.state.lock().await;
            let generation = state.generation();
            if let Some(previous) = state.catch_ups.insert(
                id,
                CatchUpState {
                    generation,
                    stream: stream.clone(),
                    label: label.clone(),
                    callbacks: Arc::downgrade(&self.callbacks),
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
            }
            generation
        };

        info!(stream = %stream, subscription_id = %id, start, endpoint = ?endpoint, "Catch up subscription started");
        tokio::spawn(run_catch_up(
            self.inner.clone(),
            id,
            stream.clone(),
            label,
            start,
            generation,
            Arc::downgrade(&self.callbacks),
            cancel,
        ));
        Ok(())
    }

    async fn delete_persistent_subscription(
        &self,
        stream: &StreamName,
        group: &GroupName,
    ) -> Result<(), ProviderError> {
        self.inner.ensure_available()?;
        let removed = self
            .inner
            .state
            .lock()
            .await
            .groups
            .remove(&(stream.clone(), group.clone()));
        let Some(removed) = removed else {
            return Err(ProviderError::Rejected {
                message: format!("Subscription group {group} on stream {stream} does not exist"),
            });
        };
        if let Some(consumer) = removed.consumer {
            consumer.cancel.cancel();
        }
        info!(stream = %stream, group = %group, "Persistent subscription group deleted");
        Ok(())
    }
}

impl Inner {
    fn ensure_available(&self) -> Result<(), ProviderError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::Connection {
                message: format!("{} cannot reach the event store", self.options.connection_name),
            })
        }
    }

    /// The next events for a group's consumer, or `None` once `generation` no
    /// longer owns the group.
    async fn next_batch(&self, key: &GroupKey, generation: u64, max: usize) -> Option<Vec<RecordedEvent>> {
        let state = self.state.lock().await;
        let group = state.groups.get(key)?;
        if group.consumer.as_ref().map(|c| c.generation) != Some(generation) {
            return None;
        }
        Some(state.read(&key.0, group.next_position, max))
    }

    /// Records the outcome of one delivery. `false` once `generation` no longer
    /// owns the group.
    async fn settle(&self, key: &GroupKey, generation: u64, event: RecordedEvent, parked: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(group) = state.groups.get_mut(key) else {
            return false;
        };
        if group.consumer.as_ref().map(|c| c.generation) != Some(generation) {
            return false;
        }
        group.next_position = event.position + 1;
        if parked {
            group.parked.push(event);
        }
        true
    }

    async fn read_from(&self, stream: &StreamName, from: i64, max: usize) -> Vec<RecordedEvent> {
        self.state.lock().await.read(stream, from, max)
    }

    async fn forget_catch_up(&self, id: SubscriptionId, generation: u64) {
        let mut state = self.state.lock().await;
        if state.catch_ups.get(&id).is_some_and(|c| c.generation == generation) {
            state.catch_ups.remove(&id);
        }
    }
}

fn envelope(event: &RecordedEvent, id: SubscriptionId) -> EventEnvelope {
    EventEnvelope {
        event_id: event.event_id,
        serialised_data: event.data.clone(),
        subscription_group_id: id,
    }
}

async fn run_persistent(
    inner: Arc<Inner>,
    key: GroupKey,
    generation: u64,
    id: SubscriptionId,
    buffer_size: usize,
    callbacks: Weak<dyn SubscriptionCallbacks>,
    cancel: CancellationToken,
) {
    let mut wake = inner.appended.subscribe();

    'consume: loop {
        wake.borrow_and_update();
        let Some(batch) = inner.next_batch(&key, generation, buffer_size).await else {
            break;
        };

        if batch.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = wake.changed() => if changed.is_err() { break },
            }
            continue;
        }

        for event in batch {
            let Some(subscriber) = callbacks.upgrade() else {
                break 'consume;
            };
            let parked = match deliver(&inner, subscriber.as_ref(), &event, id, &cancel).await {
                Delivery::Acked => false,
                Delivery::Parked => true,
                Delivery::Abandoned => break 'consume,
            };
            if parked {
                warn!(stream = %key.0, group = %key.1, position = event.position, event_id = %event.event_id, "Event parked");
            }
            if !inner.settle(&key, generation, event, parked).await {
                break 'consume;
            }
        }
    }

    debug!(stream = %key.0, group = %key.1, subscription_id = %id, "Persistent consumer stopped");
}

/// Hands one event to the subscriber, redelivering retryable failures.
async fn deliver(
    inner: &Inner,
    subscriber: &dyn SubscriptionCallbacks,
    event: &RecordedEvent,
    id: SubscriptionId,
    cancel: &CancellationToken,
) -> Delivery {
    let mut retries = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Delivery::Abandoned,
            result = subscriber.on_event_appeared(envelope(event, id)) => result,
        };

        let err: DeliveryError = match result {
            Ok(true) => return Delivery::Acked,
            Ok(false) => return Delivery::Parked,
            Err(err) => err,
        };

        let policy = err.retry_policy();
        if !policy.is_retryable() || retries >= inner.options.max_retry_count {
            error!(event_id = %event.event_id, retries, error = %err, "Event delivery failed");
            return Delivery::Parked;
        }

        retries += 1;
        let delay = match policy {
            relay::RetryPolicy::Retryable { after: Some(after) } => after,
            _ => inner.options.retry_delay,
        };
        debug!(event_id = %event.event_id, retries, ?delay, error = %err, "Redelivering event");
        tokio::select! {
            _ = cancel.cancelled() => return Delivery::Abandoned,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_catch_up(
    inner: Arc<Inner>,
    id: SubscriptionId,
    stream: StreamName,
    label: GroupName,
    mut next: i64,
    generation: u64,
    callbacks: Weak<dyn SubscriptionCallbacks>,
    cancel: CancellationToken,
) {
    let mut wake = inner.appended.subscribe();
    let mut live = false;

    'read: loop {
        wake.borrow_and_update();
        let batch = inner.read_from(&stream, next, CATCH_UP_READ_BATCH).await;
        let Some(subscriber) = callbacks.upgrade() else {
            break;
        };

        if batch.is_empty() {
            if !live {
                live = true;
                subscriber.on_caught_up(id).await;
            }
            drop(subscriber);
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = wake.changed() => if changed.is_err() { break },
            }
            continue;
        }

        for event in batch {
            let result = tokio::select! {
                _ = cancel.cancelled() => break 'read,
                result = subscriber.on_event_appeared(envelope(&event, id)) => result,
            };
            match result {
                Ok(_) => next = event.position + 1,
                Err(err) => {
                    inner.forget_catch_up(id, generation).await;
                    subscriber
                        .on_dropped(SubscriptionDropped {
                            stream_name: stream.clone(),
                            group_name: label.clone(),
                            subscription_type: SubscriptionType::CatchUp,
                            reason: DropReason::EventHandlerException,
                            error: Some(err.to_string()),
                            subscription_id: id,
                        })
                        .await;
                    return;
                }
            }
        }
    }

    inner.forget_catch_up(id, generation).await;
    debug!(stream = %stream, subscription_id = %id, "Catch up subscription stopped");
}
