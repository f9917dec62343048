//! Subscription orchestrator: keeps the set of live runtimes in line with the
//! configuration cache and claims catch-up jobs.
//!
//! A single actor task owns the live set. Cache listeners, the catch-up timer
//! and caught-up completions all reach it through channels, so the set is
//! never touched from two places at once.

use std::collections::HashMap;
use std::sync::Arc;

use relay::{
    CatchupSubscriptionConfiguration, EventStoreServerId, ServiceSettings,
    SubscriptionConfiguration, SubscriptionId, SubscriptionType,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEvent, CacheEventKind, CacheListener, ConfigurationCache, ListenerId};
use crate::subscription::{RuntimeContext, StartOptions, SubscriptionRuntime, SubscriptionSnapshot};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The actor task has exited.
    #[error("Subscription orchestrator is not running")]
    Stopped,
}

enum Command {
    Cache(CacheEvent),
    Snapshot(oneshot::Sender<Vec<SubscriptionSnapshot>>),
}

struct LiveEntry {
    runtime: SubscriptionRuntime,
    kind: SubscriptionType,
}

/// Forwards cache notifications into the actor's command channel.
struct CommandForwarder {
    commands: mpsc::UnboundedSender<Command>,
}

impl CacheListener for CommandForwarder {
    fn notify(&self, event: &CacheEvent) {
        if self.commands.send(Command::Cache(event.clone())).is_err() {
            warn!(
                subscription_id = %event.configuration().subscription_id,
                kind = ?event.kind(),
                "Orchestrator stopped, cache notification discarded"
            );
        }
    }
}

/// Running orchestrator. Dropping it without [`Orchestrator::shutdown`] leaves
/// the background tasks running until the context's cancellation token fires.
pub struct Orchestrator {
    cache: Arc<ConfigurationCache>,
    listeners: Vec<ListenerId>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    actor: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl Orchestrator {
    /// Creates the cache, registers for its three notification kinds, and
    /// starts the actor, the cache poll and the catch-up claim timer.
    ///
    /// Listeners are registered before the first poll, so the initial
    /// `Added` notifications are never lost.
    pub async fn start(settings: &ServiceSettings, context: RuntimeContext) -> Self {
        let cancel = context.cancel.clone();
        let cache = Arc::new(ConfigurationCache::new(context.repository.clone(), settings));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let forwarder: Arc<dyn CacheListener> = Arc::new(CommandForwarder {
            commands: commands.clone(),
        });
        let mut listeners = Vec::with_capacity(3);
        for kind in [CacheEventKind::Added, CacheEventKind::Removed, CacheEventKind::Updated] {
            info!(?kind, "About to add subscription group notification");
            listeners.push(cache.subscribe(kind, forwarder.clone()).await);
        }

        let actor = Actor::new(settings, context);
        let actor = tokio::spawn(actor.run(command_rx, settings.catchup_poll_interval));
        let poller = cache.clone().spawn(cancel.clone());

        info!(
            server_id = %settings.event_store_server_id,
            cache_timeout = ?settings.cache_timeout,
            catchup_poll_interval = ?settings.catchup_poll_interval,
            "Subscription orchestrator started"
        );

        Self {
            cache,
            listeners,
            commands,
            cancel,
            actor,
            poller,
        }
    }

    /// Snapshots of every live runtime, ordered by subscription id.
    pub async fn live_subscriptions(&self) -> Result<Vec<SubscriptionSnapshot>, OrchestratorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply))
            .map_err(|_| OrchestratorError::Stopped)?;
        response.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Unsubscribes from the cache, stops polling and claiming, and stops
    /// every live runtime.
    pub async fn shutdown(self) {
        for id in &self.listeners {
            self.cache.unsubscribe(*id).await;
        }
        self.cancel.cancel();

        if let Err(err) = self.poller.await {
            error!(error = %err, "Configuration cache task failed");
        }
        if let Err(err) = self.actor.await {
            error!(error = %err, "Subscription orchestrator task failed");
        }
        info!("Subscription orchestrator stopped");
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    server_id: EventStoreServerId,
    context: RuntimeContext,
    live: HashMap<SubscriptionId, LiveEntry>,
    completions: mpsc::UnboundedSender<SubscriptionId>,
    completion_rx: mpsc::UnboundedReceiver<SubscriptionId>,
}

impl Actor {
    fn new(settings: &ServiceSettings, context: RuntimeContext) -> Self {
        let (completions, completion_rx) = mpsc::unbounded_channel();
        Self {
            server_id: settings.event_store_server_id,
            context,
            live: HashMap::new(),
            completions,
            completion_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, claim_every: Duration) {
        let cancel = self.context.cancel.clone();
        // First tick fires at once: pending catch-up jobs are claimed on startup.
        let mut claim = tokio::time::interval(claim_every);
        claim.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    Command::Cache(event) => self.handle_cache_event(event).await,
                    Command::Snapshot(reply) => {
                        let _ = reply.send(self.snapshot().await);
                    }
                },
                Some(id) = self.completion_rx.recv() => self.handle_completion(id),
                _ = claim.tick() => self.claim_catch_up().await,
            }
        }

        self.stop_all().await;
    }

    async fn handle_cache_event(&mut self, event: CacheEvent) {
        match event {
            CacheEvent::Added(config) => self.on_added(config).await,
            CacheEvent::Removed(config) => self.on_removed(config).await,
            CacheEvent::Updated(config) => self.on_updated(config).await,
        }
    }

    async fn on_added(&mut self, config: SubscriptionConfiguration) {
        let id = config.subscription_id;
        if self.live.contains_key(&id) {
            warn!(subscription_id = %id, "Subscription already live, Added ignored");
            return;
        }

        let runtime = SubscriptionRuntime::new(self.context.clone());
        info!(subscription_id = %id, stream = %config.stream_name, group = %config.group_name, "About to add subscription group");
        if let Err(err) = runtime
            .start(id, &config.stream_name, &config.group_name, StartOptions::default())
            .await
        {
            // Kept so a later Updated can revive it and Removed can still find it.
            warn!(subscription_id = %id, error = %err, "Subscription failed to start, tracked as Stopped");
        }
        self.live.insert(
            id,
            LiveEntry {
                runtime,
                kind: SubscriptionType::Persistent,
            },
        );
    }

    async fn on_removed(&mut self, config: SubscriptionConfiguration) {
        let id = config.subscription_id;
        let Some(entry) = self.live.remove(&id) else {
            debug!(subscription_id = %id, "Removed subscription was not live");
            return;
        };

        info!(subscription_id = %id, stream = %config.stream_name, group = %config.group_name, "About to remove subscription group");
        if let Err(err) = entry.runtime.stop().await {
            error!(subscription_id = %id, error = %err, "Failed to stop removed subscription");
        }
    }

    async fn on_updated(&mut self, config: SubscriptionConfiguration) {
        let id = config.subscription_id;
        let Some(entry) = self.live.get(&id) else {
            debug!(subscription_id = %id, "Updated subscription is not live");
            return;
        };

        info!(
            subscription_id = %id,
            stream = %config.stream_name,
            group = %config.group_name,
            start_position = ?config.stream_position_to_restart_from,
            "About to restart subscription group"
        );
        if let Err(err) = entry.runtime.stop().await {
            error!(subscription_id = %id, error = %err, "Failed to stop subscription before restart");
        }

        let options = StartOptions::persistent_from(config.stream_position_to_restart_from);
        if entry
            .runtime
            .start(id, &config.stream_name, &config.group_name, options)
            .await
            .is_err()
        {
            // Position kept, so the next poll tries again.
            return;
        }

        if let Err(err) = self
            .context
            .repository
            .reset_subscription_stream_position(id, &self.context.cancel)
            .await
        {
            error!(subscription_id = %id, error = %err, "Failed to reset subscription stream position");
        }
    }

    fn handle_completion(&mut self, id: SubscriptionId) {
        match self.live.get(&id) {
            Some(entry) if entry.kind == SubscriptionType::CatchUp => {
                self.live.remove(&id);
                info!(subscription_id = %id, "Catch up subscription finished");
            }
            _ => debug!(subscription_id = %id, "Completion for unknown catch up subscription"),
        }
    }

    /// Starts the oldest unclaimed catch-up job, one at a time.
    async fn claim_catch_up(&mut self) {
        if self.live.values().any(|e| e.kind == SubscriptionType::CatchUp) {
            debug!("Catch up subscription already running, claim skipped");
            return;
        }

        let next = self
            .context
            .repository
            .get_next_catchup_subscription_configuration(self.server_id, &self.context.cancel)
            .await;
        let job = match next {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                error!(server_id = %self.server_id, error = %err, "Failed to fetch next catch up subscription");
                return;
            }
        };

        if self.live.contains_key(&job.subscription_id) {
            debug!(subscription_id = %job.subscription_id, "Catch up subscription already live");
            return;
        }
        self.start_catch_up(job).await;
    }

    async fn start_catch_up(&mut self, job: CatchupSubscriptionConfiguration) {
        let id = job.subscription_id;
        let runtime = SubscriptionRuntime::with_completions(self.context.clone(), self.completions.clone());
        info!(
            subscription_id = %id,
            stream = %job.stream_name,
            name = %job.name,
            position = job.position,
            "About to start catch up subscription"
        );

        let options = StartOptions::catch_up(job.position, job.end_point_uri.clone());
        if runtime
            .start(id, &job.stream_name, &job.name, options)
            .await
            .is_ok()
        {
            self.live.insert(
                id,
                LiveEntry {
                    runtime,
                    kind: SubscriptionType::CatchUp,
                },
            );
        }
    }

    async fn snapshot(&self) -> Vec<SubscriptionSnapshot> {
        let mut ids: Vec<_> = self.live.keys().copied().collect();
        ids.sort();
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.live.get(&id) {
                snapshots.push(entry.runtime.snapshot().await);
            }
        }
        snapshots
    }

    async fn stop_all(&mut self) {
        info!(live = self.live.len(), "Stopping all subscriptions");
        for (id, entry) in self.live.drain() {
            if let Err(err) = entry.runtime.stop().await {
                error!(subscription_id = %id, error = %err, "Failed to stop subscription on shutdown");
            }
        }
    }
}
