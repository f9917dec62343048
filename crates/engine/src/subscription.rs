//! Subscription runtime: one live store subscription and the forwarding of its
//! events to a webhook endpoint.
//!
//! ## State machine
//!
//! ```text
//! NotSet ──start──► Started ──stop──► Stopped
//!                    │  ▲
//!                    └──┘ dropped (Persistent): start again
//!          Started ──caught up (CatchUp)──► Stopped, job deleted
//! ```
//!
//! The store invokes the [`SubscriptionCallbacks`] from its own tasks, so the
//! runtime state sits behind an async lock. The lock is never held across a
//! provider, repository or network call.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use relay::{
    ConfigurationRepository, DeliveryError, Endpoint, EndpointDispatcher, EventEnvelope, GroupName,
    ProviderError, RepositoryError, StoreConnection, StoreConnectionProvider, StreamName,
    SubscriptionCallbacks, SubscriptionDropped, SubscriptionError, SubscriptionId,
    SubscriptionStatus, SubscriptionType, ValidationError, DEFAULT_BUFFER_SIZE,
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel a runtime uses to announce that its catch-up job has finished.
pub type CompletionSender = mpsc::UnboundedSender<SubscriptionId>;

/// Everything a runtime needs from the outside world.
#[derive(Clone)]
pub struct RuntimeContext {
    pub provider: Arc<dyn StoreConnectionProvider>,
    pub repository: Arc<dyn ConfigurationRepository>,
    pub dispatcher: Arc<dyn EndpointDispatcher>,
    /// Fires on shutdown; abandons repository lookups and HTTP requests in flight.
    pub cancel: CancellationToken,
}

impl RuntimeContext {
    pub fn new(
        provider: Arc<dyn StoreConnectionProvider>,
        repository: Arc<dyn ConfigurationRepository>,
        dispatcher: Arc<dyn EndpointDispatcher>,
    ) -> Self {
        Self {
            provider,
            repository,
            dispatcher,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Optional arguments of [`SubscriptionRuntime::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub start_position: Option<i64>,
    pub endpoint: Option<String>,
    pub buffer_size: usize,
    pub subscription_type: SubscriptionType,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            start_position: None,
            endpoint: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            subscription_type: SubscriptionType::Persistent,
        }
    }
}

impl StartOptions {
    /// A persistent subscription restarted from `position`.
    pub fn persistent_from(position: Option<i64>) -> Self {
        Self {
            start_position: position,
            ..Self::default()
        }
    }

    /// A catch-up job replaying from `position` to `endpoint`.
    pub fn catch_up(position: i64, endpoint: Option<String>) -> Self {
        Self {
            start_position: Some(position),
            endpoint,
            subscription_type: SubscriptionType::CatchUp,
            ..Self::default()
        }
    }
}

/// Point-in-time view of a runtime, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: Option<SubscriptionId>,
    pub stream_name: Option<StreamName>,
    pub group_name: Option<GroupName>,
    pub start_position: Option<i64>,
    pub endpoint: Option<String>,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
}

#[derive(Default)]
struct RuntimeState {
    id: Option<SubscriptionId>,
    stream_name: Option<StreamName>,
    group_name: Option<GroupName>,
    start_position: Option<i64>,
    endpoint: Option<String>,
    subscription_type: SubscriptionType,
    status: SubscriptionStatus,
    connection: Option<Arc<dyn StoreConnection>>,
}

struct RuntimeCore {
    me: Weak<RuntimeCore>,
    context: RuntimeContext,
    completions: Option<CompletionSender>,
    state: RwLock<RuntimeState>,
}

/// Owns one subscription to one stream/group pair.
///
/// Cloning yields another handle to the same runtime.
#[derive(Clone)]
pub struct SubscriptionRuntime {
    core: Arc<RuntimeCore>,
}

impl SubscriptionRuntime {
    pub fn new(context: RuntimeContext) -> Self {
        Self::build(context, None)
    }

    /// A runtime that reports finished catch-up jobs on `completions`.
    pub fn with_completions(context: RuntimeContext, completions: CompletionSender) -> Self {
        Self::build(context, Some(completions))
    }

    fn build(context: RuntimeContext, completions: Option<CompletionSender>) -> Self {
        let core = Arc::new_cyclic(|me| RuntimeCore {
            me: me.clone(),
            context,
            completions,
            state: RwLock::new(RuntimeState::default()),
        });
        Self { core }
    }

    /// Validates the arguments, records them, and opens the store subscription.
    ///
    /// Fails with [`SubscriptionError::Validation`] before touching the store
    /// when `id` is nil or a name is empty, and with
    /// [`SubscriptionError::Start`] when the store refuses; a refused runtime
    /// is left `Stopped`.
    pub async fn start(
        &self,
        id: SubscriptionId,
        stream_name: &str,
        group_name: &str,
        options: StartOptions,
    ) -> Result<(), SubscriptionError> {
        self.core.start(id, stream_name, group_name, options).await
    }

    /// Stops forwarding. Deletes the persistent subscription on the store; a
    /// catch-up subscription has nothing to delete. The status is `Stopped`
    /// afterwards even when the delete fails.
    pub async fn stop(&self) -> Result<(), SubscriptionError> {
        self.core.stop().await
    }

    pub async fn status(&self) -> SubscriptionStatus {
        self.core.state.read().await.status
    }

    pub async fn id(&self) -> Option<SubscriptionId> {
        self.core.state.read().await.id
    }

    pub async fn subscription_type(&self) -> SubscriptionType {
        self.core.state.read().await.subscription_type
    }

    pub async fn snapshot(&self) -> SubscriptionSnapshot {
        let state = self.core.state.read().await;
        SubscriptionSnapshot {
            id: state.id,
            stream_name: state.stream_name.clone(),
            group_name: state.group_name.clone(),
            start_position: state.start_position,
            endpoint: state.endpoint.clone(),
            subscription_type: state.subscription_type,
            status: state.status,
        }
    }

    /// The callbacks the store invokes for this runtime.
    pub fn callbacks(&self) -> Arc<dyn SubscriptionCallbacks> {
        self.core.clone()
    }
}

fn validate(
    id: SubscriptionId,
    stream_name: &str,
    group_name: &str,
) -> Result<(StreamName, GroupName), ValidationError> {
    if id.is_nil() {
        return Err(ValidationError::EmptySubscriptionId);
    }
    let stream = StreamName::new(stream_name).ok_or(ValidationError::EmptyStreamName)?;
    let group = GroupName::new(group_name).ok_or(ValidationError::EmptyGroupName)?;
    Ok((stream, group))
}

impl RuntimeCore {
    fn callbacks(&self) -> Option<Arc<dyn SubscriptionCallbacks>> {
        self.me
            .upgrade()
            .map(|core| core as Arc<dyn SubscriptionCallbacks>)
    }

    /// Reuses the open connection or asks the provider for one.
    async fn connection(&self) -> Result<Arc<dyn StoreConnection>, ProviderError> {
        if let Some(connection) = self.state.read().await.connection.clone() {
            return Ok(connection);
        }
        let callbacks = self.callbacks().ok_or_else(|| ProviderError::Connection {
            message: "subscription runtime released".into(),
        })?;
        let connection = self.context.provider.get_connection(callbacks).await?;
        self.state.write().await.connection = Some(connection.clone());
        Ok(connection)
    }

    async fn start(
        &self,
        id: SubscriptionId,
        stream_name: &str,
        group_name: &str,
        options: StartOptions,
    ) -> Result<(), SubscriptionError> {
        let (stream, group) = validate(id, stream_name, group_name)?;

        {
            let mut state = self.state.write().await;
            state.id = Some(id);
            state.stream_name = Some(stream.clone());
            state.group_name = Some(group.clone());
            state.start_position = options.start_position;
            state.endpoint = options.endpoint.clone();
            state.subscription_type = options.subscription_type;
            state.status = SubscriptionStatus::Started;
        }

        let opened = match self.connection().await {
            Ok(connection) => match options.subscription_type {
                SubscriptionType::Persistent => {
                    connection
                        .connect_persistent(
                            &stream,
                            &group,
                            id,
                            options.buffer_size,
                            options.start_position,
                        )
                        .await
                }
                SubscriptionType::CatchUp => {
                    // Anything at or below -1 means "from the beginning".
                    let position = options.start_position.filter(|p| *p > -1);
                    connection
                        .subscribe_catch_up_from(id, &stream, position, options.endpoint.as_deref())
                        .await
                }
            },
            Err(err) => Err(err),
        };

        if let Err(source) = opened {
            {
                let mut state = self.state.write().await;
                state.status = SubscriptionStatus::Stopped;
                // The connection holds our callbacks; keeping it would pin this runtime.
                state.connection = None;
            }
            let err = SubscriptionError::Start {
                stream: stream.to_string(),
                group: group.to_string(),
                source,
            };
            error!(
                subscription_id = %id,
                stream = %stream,
                group = %group,
                error = %err,
                cause = %err_source(&err),
                "Failed to start subscription"
            );
            return Err(err);
        }

        info!(
            subscription_id = %id,
            stream = %stream,
            group = %group,
            subscription_type = %options.subscription_type,
            start_position = ?options.start_position,
            "Subscription Started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), SubscriptionError> {
        let (subscription_type, stream, group) = {
            let state = self.state.read().await;
            (
                state.subscription_type,
                state.stream_name.clone(),
                state.group_name.clone(),
            )
        };

        let mut result = Ok(());
        if let (SubscriptionType::Persistent, Some(stream), Some(group)) =
            (subscription_type, stream.as_ref(), group.as_ref())
        {
            let deleted = match self.connection().await {
                Ok(connection) => connection.delete_persistent_subscription(stream, group).await,
                Err(err) => Err(err),
            };
            if let Err(source) = deleted {
                error!(stream = %stream, group = %group, error = %source, "Failed to delete persistent subscription");
                result = Err(SubscriptionError::Stop {
                    stream: stream.to_string(),
                    group: group.to_string(),
                    source,
                });
            }
        }

        let mut state = self.state.write().await;
        state.status = SubscriptionStatus::Stopped;
        state.connection = None;
        info!(
            subscription_id = ?state.id,
            stream = ?stream.as_ref().map(StreamName::as_str),
            group = ?group.as_ref().map(GroupName::as_str),
            "Subscription Stopped"
        );
        result
    }

    /// Stops a catch-up runtime and tells the orchestrator to evict it.
    async fn finish(&self, id: SubscriptionId) {
        if let Err(err) = self.stop().await {
            error!(subscription_id = %id, error = %err, "Failed to stop catch up subscription");
        }

        if let Some(completions) = &self.completions {
            if completions.send(id).is_err() {
                debug!(subscription_id = %id, "Orchestrator gone, completion not reported");
            }
        }
    }

    /// Looks the destination up afresh for every event, so endpoint edits take
    /// effect without a restart. `Ok(None)` when the record has no endpoint.
    async fn resolve_endpoint(
        &self,
        id: SubscriptionId,
        subscription_type: SubscriptionType,
    ) -> Result<Option<Endpoint>, RepositoryError> {
        let repository = &self.context.repository;
        let cancel = &self.context.cancel;
        let (name, url) = match subscription_type {
            SubscriptionType::Persistent => {
                let config = repository.get_subscription_configuration(id, cancel).await?;
                (config.group_name, config.end_point_uri)
            }
            SubscriptionType::CatchUp => {
                let config = repository
                    .get_catchup_subscription_configuration(id, cancel)
                    .await?;
                (config.name, config.end_point_uri)
            }
        };

        Ok(url
            .filter(|u| !u.trim().is_empty())
            .map(|url| Endpoint { id, name, url }))
    }
}

fn err_source(err: &SubscriptionError) -> String {
    std::error::Error::source(err)
        .map(ToString::to_string)
        .unwrap_or_default()
}

#[async_trait]
impl SubscriptionCallbacks for RuntimeCore {
    async fn on_event_appeared(&self, event: EventEnvelope) -> Result<bool, DeliveryError> {
        let (id, subscription_type, status) = {
            let state = self.state.read().await;
            (state.id, state.subscription_type, state.status)
        };

        let Some(id) = id else {
            warn!(event_id = %event.event_id, "Event arrived for a subscription that was never started");
            return Ok(false);
        };
        if status == SubscriptionStatus::Stopped {
            debug!(subscription_id = %id, event_id = %event.event_id, "Subscription stopped, event not forwarded");
            return Ok(false);
        }

        let endpoint = match self.resolve_endpoint(id, subscription_type).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                error!(subscription_id = %id, event_id = %event.event_id, "No Endpoint Uri found for Subscription Id {id}");
                return Ok(false);
            }
            Err(err) if err.is_not_found() => {
                error!(subscription_id = %id, event_id = %event.event_id, error = %err, "No Endpoint Uri found for Subscription Id {id}");
                return Ok(false);
            }
            Err(err) => {
                error!(subscription_id = %id, event_id = %event.event_id, error = %err, "Endpoint lookup failed");
                return Err(err.into());
            }
        };

        match self
            .context
            .dispatcher
            .dispatch(&endpoint, &event, &self.context.cancel)
            .await
        {
            Ok(()) => {
                debug!(subscription_id = %id, event_id = %event.event_id, endpoint = %endpoint.url, "Event delivered");
                Ok(true)
            }
            Err(err) => {
                error!(
                    subscription_id = %id,
                    event_id = %event.event_id,
                    endpoint = %endpoint.url,
                    group = %endpoint.name,
                    retryable = err.retry_policy().is_retryable(),
                    error = %err,
                    "Error processing Event Id {}", event.event_id
                );
                Err(err)
            }
        }
    }

    async fn on_dropped(&self, dropped: SubscriptionDropped) {
        error!(
            subscription_id = %dropped.subscription_id,
            stream = %dropped.stream_name,
            group = %dropped.group_name,
            reason = %dropped.reason,
            error = ?dropped.error,
            "{} Subscription Dropped", dropped.subscription_type
        );

        if self.state.read().await.status == SubscriptionStatus::Stopped {
            info!(subscription_id = %dropped.subscription_id, "Subscription was stopped, not restarting");
            return;
        }
        if dropped.subscription_type == SubscriptionType::CatchUp {
            // Not restarted here; the job is still stored, so the next claim picks it up again.
            self.finish(dropped.subscription_id).await;
            return;
        }

        info!(
            stream = %dropped.stream_name,
            group = %dropped.group_name,
            "About to start subscription as subscription dropped"
        );
        // Default buffer size and type: a custom buffer size is not re-applied.
        if let Err(err) = self
            .start(
                dropped.subscription_id,
                dropped.stream_name.as_str(),
                dropped.group_name.as_str(),
                StartOptions::default(),
            )
            .await
        {
            error!(subscription_id = %dropped.subscription_id, error = %err, "Failed to restart dropped subscription");
        }
    }

    async fn on_caught_up(&self, id: SubscriptionId) {
        info!(subscription_id = %id, "LiveProcessStarted for catchUpSubscriptionId {id}");

        match self
            .context
            .repository
            .delete_catchup_subscription(id, &self.context.cancel)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                warn!(subscription_id = %id, "CatchUpSubscription {id} already deleted");
            }
            Err(err) => {
                // The job stays stored and is claimed again on a later tick.
                error!(subscription_id = %id, error = %err, "Failed to delete CatchUpSubscription {id}");
            }
        }

        self.finish(id).await;
    }
}
