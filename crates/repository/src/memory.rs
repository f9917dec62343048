use async_trait::async_trait;
use relay::{
    CatchupSubscriptionConfiguration, ConfigurationRepository, EventStoreServer,
    EventStoreServerId, RepositoryError, SubscriptionConfiguration, SubscriptionId,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ConfigurationDocument;

/// Configuration held in process memory.
///
/// Used for local runs and tests; administrators' changes are simulated with
/// [`InMemoryConfigurationRepository::modify`].
#[derive(Debug, Default)]
pub struct InMemoryConfigurationRepository {
    document: RwLock<ConfigurationDocument>,
}

impl InMemoryConfigurationRepository {
    pub fn new(document: ConfigurationDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// A copy of everything currently stored.
    pub async fn snapshot(&self) -> ConfigurationDocument {
        self.document.read().await.clone()
    }

    /// Applies `change` to the stored document.
    pub async fn modify<F, T>(&self, change: F) -> T
    where
        F: FnOnce(&mut ConfigurationDocument) -> T,
    {
        change(&mut *self.document.write().await)
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), RepositoryError> {
    if cancel.is_cancelled() {
        return Err(RepositoryError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl ConfigurationRepository for InMemoryConfigurationRepository {
    async fn list_subscription_configurations(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<Vec<SubscriptionConfiguration>, RepositoryError> {
        ensure_live(cancel)?;
        Ok(self.document.read().await.subscriptions_for(server_id))
    }

    async fn get_subscription_configuration(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionConfiguration, RepositoryError> {
        ensure_live(cancel)?;
        self.document.read().await.subscription(id)
    }

    async fn get_catchup_subscription_configuration(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<CatchupSubscriptionConfiguration, RepositoryError> {
        ensure_live(cancel)?;
        self.document.read().await.catchup(id)
    }

    async fn get_next_catchup_subscription_configuration(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<Option<CatchupSubscriptionConfiguration>, RepositoryError> {
        ensure_live(cancel)?;
        Ok(self.document.read().await.next_catchup(server_id))
    }

    async fn reset_subscription_stream_position(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        ensure_live(cancel)?;
        self.document.write().await.reset_stream_position(id)?;
        debug!(subscription_id = %id, "Stream position reset");
        Ok(())
    }

    async fn delete_catchup_subscription(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        ensure_live(cancel)?;
        self.document.write().await.delete_catchup(id)?;
        debug!(subscription_id = %id, "Catch up subscription deleted");
        Ok(())
    }

    async fn get_event_store_server(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<EventStoreServer, RepositoryError> {
        ensure_live(cancel)?;
        self.document.read().await.event_store_server(server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config(n: u128, server: u128) -> SubscriptionConfiguration {
        SubscriptionConfiguration {
            subscription_id: SubscriptionId::from_uuid(Uuid::from_u128(n)),
            event_store_server_id: EventStoreServerId::from_uuid(Uuid::from_u128(server)),
            stream_name: "orders".into(),
            group_name: format!("group-{n}"),
            end_point_uri: Some("http://x/hook".into()),
            stream_position_to_restart_from: Some(4),
        }
    }

    #[tokio::test]
    async fn listing_is_scoped_to_the_server() {
        let repo = InMemoryConfigurationRepository::default();
        repo.modify(|doc| {
            doc.upsert_subscription(config(1, 10));
            doc.upsert_subscription(config(2, 20));
        })
        .await;

        let listed = repo
            .list_subscription_configurations(
                EventStoreServerId::from_uuid(Uuid::from_u128(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(listed, vec![config(1, 10)]);
    }

    #[tokio::test]
    async fn reset_clears_the_replay_position_and_is_idempotent() {
        let repo = InMemoryConfigurationRepository::new(ConfigurationDocument {
            subscriptions: vec![config(1, 10)],
            ..ConfigurationDocument::default()
        });
        let id = config(1, 10).subscription_id;
        let cancel = CancellationToken::new();

        repo.reset_subscription_stream_position(id, &cancel).await.unwrap();
        repo.reset_subscription_stream_position(id, &cancel).await.unwrap();

        let stored = repo.get_subscription_configuration(id, &cancel).await.unwrap();
        assert_eq!(stored.stream_position_to_restart_from, None);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let repo = InMemoryConfigurationRepository::default();
        let id = SubscriptionId::from_uuid(Uuid::from_u128(7));
        let cancel = CancellationToken::new();

        assert!(repo.get_subscription_configuration(id, &cancel).await.unwrap_err().is_not_found());
        assert!(repo.reset_subscription_stream_position(id, &cancel).await.unwrap_err().is_not_found());
        assert!(repo.delete_catchup_subscription(id, &cancel).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cancelled_calls_fail_fast() {
        let repo = InMemoryConfigurationRepository::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = repo
            .list_subscription_configurations(EventStoreServerId::new_random(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, RepositoryError::Cancelled);
    }
}
