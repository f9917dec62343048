//! Recording fakes for the relay ports, shared by the engine's unit tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay::{
    CatchupSubscriptionConfiguration, ConfigurationRepository, DeliveryError, Endpoint,
    EndpointDispatcher, EventEnvelope, EventId, EventStoreServer, EventStoreServerId, GroupName,
    ProviderError, RepositoryError, ServiceSettings, StoreConnection, StoreConnectionProvider,
    StreamName, SubscriptionCallbacks, SubscriptionConfiguration, SubscriptionId, Timestamp,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SERVER: u128 = 0xE5;

pub fn server_id() -> EventStoreServerId {
    EventStoreServerId::from_uuid(Uuid::from_u128(SERVER))
}

pub fn subscription_id(n: u128) -> SubscriptionId {
    SubscriptionId::from_uuid(Uuid::from_u128(n))
}

pub fn configuration(n: u128, stream: &str, group: &str) -> SubscriptionConfiguration {
    SubscriptionConfiguration {
        subscription_id: subscription_id(n),
        event_store_server_id: server_id(),
        stream_name: stream.to_string(),
        group_name: group.to_string(),
        end_point_uri: Some(format!("http://x/{group}")),
        stream_position_to_restart_from: None,
    }
}

pub fn catchup(n: u128, stream: &str, name: &str, position: i64) -> CatchupSubscriptionConfiguration {
    CatchupSubscriptionConfiguration {
        subscription_id: subscription_id(n),
        event_store_server_id: server_id(),
        stream_name: stream.to_string(),
        name: name.to_string(),
        position,
        end_point_uri: Some(format!("http://x/{name}")),
        create_date_time: Timestamp::now(),
    }
}

pub fn envelope(subscription: SubscriptionId) -> EventEnvelope {
    EventEnvelope {
        event_id: EventId::new_random(),
        serialised_data: r#"{"orderId":1}"#.to_string(),
        subscription_group_id: subscription,
    }
}

/// Polls `check` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepositoryState {
    subscriptions: Vec<SubscriptionConfiguration>,
    catchups: Vec<CatchupSubscriptionConfiguration>,
    resets: Vec<SubscriptionId>,
    deletes: Vec<SubscriptionId>,
}

#[derive(Default)]
pub struct FakeRepository {
    state: Mutex<RepositoryState>,
    fail_listing: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings::new(Duration::from_millis(20), server_id())
            .with_catchup_poll_interval(Duration::from_millis(20))
    }

    pub async fn set_subscriptions(&self, subscriptions: Vec<SubscriptionConfiguration>) {
        self.state.lock().await.subscriptions = subscriptions;
    }

    pub async fn set_catchups(&self, catchups: Vec<CatchupSubscriptionConfiguration>) {
        self.state.lock().await.catchups = catchups;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn resets(&self) -> Vec<SubscriptionId> {
        self.state.lock().await.resets.clone()
    }

    pub async fn deletes(&self) -> Vec<SubscriptionId> {
        self.state.lock().await.deletes.clone()
    }
}

#[async_trait]
impl ConfigurationRepository for FakeRepository {
    async fn list_subscription_configurations(
        &self,
        server_id: EventStoreServerId,
        _cancel: &CancellationToken,
    ) -> Result<Vec<SubscriptionConfiguration>, RepositoryError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable {
                message: "listing disabled".into(),
            });
        }
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.event_store_server_id == server_id)
            .cloned()
            .collect())
    }

    async fn get_subscription_configuration(
        &self,
        id: SubscriptionId,
        _cancel: &CancellationToken,
    ) -> Result<SubscriptionConfiguration, RepositoryError> {
        self.state
            .lock()
            .await
            .subscriptions
            .iter()
            .find(|s| s.subscription_id == id)
            .cloned()
            .ok_or_else(|| RepositoryError::subscription_not_found(id))
    }

    async fn get_catchup_subscription_configuration(
        &self,
        id: SubscriptionId,
        _cancel: &CancellationToken,
    ) -> Result<CatchupSubscriptionConfiguration, RepositoryError> {
        self.state
            .lock()
            .await
            .catchups
            .iter()
            .find(|c| c.subscription_id == id)
            .cloned()
            .ok_or_else(|| RepositoryError::catchup_not_found(id))
    }

    async fn get_next_catchup_subscription_configuration(
        &self,
        server_id: EventStoreServerId,
        _cancel: &CancellationToken,
    ) -> Result<Option<CatchupSubscriptionConfiguration>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .await
            .catchups
            .iter()
            .filter(|c| c.event_store_server_id == server_id)
            .min_by_key(|c| c.create_date_time)
            .cloned())
    }

    async fn reset_subscription_stream_position(
        &self,
        id: SubscriptionId,
        _cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.resets.push(id);
        let config = state
            .subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == id)
            .ok_or_else(|| RepositoryError::subscription_not_found(id))?;
        config.stream_position_to_restart_from = None;
        Ok(())
    }

    async fn delete_catchup_subscription(
        &self,
        id: SubscriptionId,
        _cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.deletes.push(id);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable {
                message: "deletes disabled".into(),
            });
        }
        let before = state.catchups.len();
        state.catchups.retain(|c| c.subscription_id != id);
        if state.catchups.len() == before {
            return Err(RepositoryError::catchup_not_found(id));
        }
        Ok(())
    }

    async fn get_event_store_server(
        &self,
        server_id: EventStoreServerId,
        _cancel: &CancellationToken,
    ) -> Result<EventStoreServer, RepositoryError> {
        Ok(EventStoreServer {
            event_store_server_id: server_id,
            name: "fake".into(),
            connection_string: "memory://".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Store connection provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    ConnectPersistent {
        stream: String,
        group: String,
        id: SubscriptionId,
        buffer_size: usize,
        start_from: Option<i64>,
    },
    SubscribeCatchUp {
        id: SubscriptionId,
        stream: String,
        position: Option<i64>,
        endpoint: Option<String>,
    },
    DeletePersistent {
        stream: String,
        group: String,
    },
}

#[derive(Default)]
struct ProviderState {
    calls: Vec<ProviderCall>,
    callbacks: Vec<Arc<dyn SubscriptionCallbacks>>,
    connections: usize,
}

#[derive(Default)]
pub struct FakeProvider {
    state: Arc<Mutex<ProviderState>>,
    fail_subscribe: Arc<AtomicBool>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }

    pub async fn connect_calls(&self) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| matches!(c, ProviderCall::ConnectPersistent { .. }))
            .count()
    }

    /// The callbacks handed over by the most recent `get_connection`.
    pub async fn last_callbacks(&self) -> Arc<dyn SubscriptionCallbacks> {
        match self.state.lock().await.callbacks.last() {
            Some(callbacks) => callbacks.clone(),
            None => panic!("no connection was opened"),
        }
    }
}

#[async_trait]
impl StoreConnectionProvider for FakeProvider {
    async fn get_connection(
        &self,
        callbacks: Arc<dyn SubscriptionCallbacks>,
    ) -> Result<Arc<dyn StoreConnection>, ProviderError> {
        let mut state = self.state.lock().await;
        state.connections += 1;
        state.callbacks.push(callbacks);
        Ok(Arc::new(FakeConnection {
            state: self.state.clone(),
            fail_subscribe: self.fail_subscribe.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<Mutex<ProviderState>>,
    fail_subscribe: Arc<AtomicBool>,
}

impl FakeConnection {
    async fn record(&self, call: ProviderCall) -> Result<(), ProviderError> {
        let failing = self.fail_subscribe.load(Ordering::SeqCst)
            && !matches!(call, ProviderCall::DeletePersistent { .. });
        self.state.lock().await.calls.push(call);
        if failing {
            return Err(ProviderError::Connection {
                message: "store unreachable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnection for FakeConnection {
    async fn connect_persistent(
        &self,
        stream: &StreamName,
        group: &GroupName,
        id: SubscriptionId,
        buffer_size: usize,
        start_from: Option<i64>,
    ) -> Result<(), ProviderError> {
        self.record(ProviderCall::ConnectPersistent {
            stream: stream.to_string(),
            group: group.to_string(),
            id,
            buffer_size,
            start_from,
        })
        .await
    }

    async fn subscribe_catch_up_from(
        &self,
        id: SubscriptionId,
        stream: &StreamName,
        position: Option<i64>,
        endpoint: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.record(ProviderCall::SubscribeCatchUp {
            id,
            stream: stream.to_string(),
            position,
            endpoint: endpoint.map(str::to_string),
        })
        .await
    }

    async fn delete_persistent_subscription(
        &self,
        stream: &StreamName,
        group: &GroupName,
    ) -> Result<(), ProviderError> {
        self.record(ProviderCall::DeletePersistent {
            stream: stream.to_string(),
            group: group.to_string(),
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeDispatcher {
    sent: Mutex<Vec<(String, EventEnvelope)>>,
    failure: Mutex<Option<DeliveryError>>,
}

impl FakeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_with(&self, error: DeliveryError) {
        *self.failure.lock().await = Some(error);
    }

    pub async fn sent(&self) -> Vec<(String, EventEnvelope)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EndpointDispatcher for FakeDispatcher {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        event: &EventEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .await
            .push((endpoint.url.clone(), event.clone()));
        match self.failure.lock().await.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
