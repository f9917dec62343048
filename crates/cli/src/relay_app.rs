//! Composition root: builds the store, repository, dispatcher and
//! orchestrator from [`RelaySettings`].

use std::sync::Arc;

use anyhow::Context;
use engine::{Orchestrator, RuntimeContext};
use relay::{ConfigurationRepository, EndpointDispatcher};
use repository::{InMemoryConfigurationRepository, JsonFileConfigurationRepository};
use store::{InMemoryEventStore, StoreOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webhook::{HttpDispatcherConfig, HttpEndpointDispatcher};

use crate::settings::RelaySettings;

/// A running relay.
pub struct Relay {
    store: InMemoryEventStore,
    repository: Arc<dyn ConfigurationRepository>,
    orchestrator: Orchestrator,
    cancel: CancellationToken,
}

impl Relay {
    /// Starts a relay whose repository is chosen by the settings: the JSON
    /// file when `ConfigurationFile` is set, otherwise an empty in-memory one.
    pub async fn start(settings: &RelaySettings) -> anyhow::Result<Self> {
        let repository: Arc<dyn ConfigurationRepository> = match settings.configuration_file() {
            Some(path) => {
                info!(path = %path.display(), "Using JSON configuration file");
                Arc::new(JsonFileConfigurationRepository::new(path))
            }
            None => {
                warn!("No ConfigurationFile set, subscriptions are held in memory only");
                Arc::new(InMemoryConfigurationRepository::default())
            }
        };
        let dispatcher = HttpEndpointDispatcher::new(HttpDispatcherConfig::default())
            .context("creating webhook dispatcher")?;
        Self::start_with(settings, repository, Arc::new(dispatcher)).await
    }

    /// Starts a relay over the given repository and dispatcher.
    pub async fn start_with(
        settings: &RelaySettings,
        repository: Arc<dyn ConfigurationRepository>,
        dispatcher: Arc<dyn EndpointDispatcher>,
    ) -> anyhow::Result<Self> {
        let options = StoreOptions::from_settings(&settings.event_store)
            .context("EventStoreSettings:ConnectionString")?;
        let store = InMemoryEventStore::new(options);
        let cancel = CancellationToken::new();

        let server_id = settings.service.event_store_server_id;
        match repository.get_event_store_server(server_id, &cancel).await {
            Ok(server) => info!(server_id = %server_id, name = %server.name, "Serving event store server"),
            Err(err) => warn!(server_id = %server_id, error = %err, "Event store server not registered"),
        }

        let context = RuntimeContext::new(Arc::new(store.clone()), repository.clone(), dispatcher)
            .with_cancellation(cancel.clone());
        let orchestrator = Orchestrator::start(&settings.service, context).await;

        info!(
            server_id = %server_id,
            connection_name = %settings.event_store.connection_name,
            http_port = settings.event_store.http_port,
            "Event relay started"
        );
        Ok(Self {
            store,
            repository,
            orchestrator,
            cancel,
        })
    }

    pub fn store(&self) -> &InMemoryEventStore {
        &self.store
    }

    pub fn repository(&self) -> &Arc<dyn ConfigurationRepository> {
        &self.repository
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stops every subscription, abandons in-flight deliveries and stops the
    /// store's workers.
    pub async fn shutdown(self) {
        info!("Event relay shutting down");
        self.orchestrator.shutdown().await;
        self.cancel.cancel();
        self.store.shutdown();
    }
}
