use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay::{
    CatchupSubscriptionConfiguration, ConfigurationRepository, EventStoreServer,
    EventStoreServerId, RepositoryError, SubscriptionConfiguration, SubscriptionId,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ConfigurationDocument;

/// Configuration stored in a JSON file.
///
/// The file is read on every call, so edits made by administrators are seen
/// on the next cache poll. Writes replace the file atomically through a
/// temporary sibling and a rename. A missing file reads as an empty document.
#[derive(Debug)]
pub struct JsonFileConfigurationRepository {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileConfigurationRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<ConfigurationDocument, RepositoryError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Configuration file missing, treating as empty");
                return Ok(ConfigurationDocument::default());
            }
            Err(err) => return Err(unavailable(&self.path, err)),
        };
        serde_json::from_slice(&bytes).map_err(|err| unavailable(&self.path, err))
    }

    /// Reads, changes and writes the document under the write lock.
    pub async fn modify<F, T>(&self, change: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut ConfigurationDocument) -> Result<T, RepositoryError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        let result = change(&mut document)?;
        self.save(&document).await?;
        Ok(result)
    }

    async fn save(&self, document: &ConfigurationDocument) -> Result<(), RepositoryError> {
        let json = serde_json::to_vec_pretty(document).map_err(|err| unavailable(&self.path, err))?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, json)
            .await
            .map_err(|err| unavailable(&temp, err))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|err| unavailable(&self.path, err))?;
        debug!(path = %self.path.display(), "Configuration file written");
        Ok(())
    }

    async fn read<T>(
        &self,
        cancel: &CancellationToken,
        query: impl FnOnce(&ConfigurationDocument) -> Result<T, RepositoryError> + Send,
    ) -> Result<T, RepositoryError>
    where
        T: Send,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(RepositoryError::Cancelled),
            document = self.load() => query(&document?),
        }
    }

    async fn write(
        &self,
        cancel: &CancellationToken,
        change: impl FnOnce(&mut ConfigurationDocument) -> Result<(), RepositoryError> + Send,
    ) -> Result<(), RepositoryError> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        // Not raced against cancellation: a half-finished write is worse than
        // a late shutdown.
        self.modify(change).await
    }
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Unavailable {
        message: format!("{}: {err}", path.display()),
    }
}

#[async_trait]
impl ConfigurationRepository for JsonFileConfigurationRepository {
    async fn list_subscription_configurations(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<Vec<SubscriptionConfiguration>, RepositoryError> {
        self.read(cancel, |doc| Ok(doc.subscriptions_for(server_id))).await
    }

    async fn get_subscription_configuration(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionConfiguration, RepositoryError> {
        self.read(cancel, |doc| doc.subscription(id)).await
    }

    async fn get_catchup_subscription_configuration(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<CatchupSubscriptionConfiguration, RepositoryError> {
        self.read(cancel, |doc| doc.catchup(id)).await
    }

    async fn get_next_catchup_subscription_configuration(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<Option<CatchupSubscriptionConfiguration>, RepositoryError> {
        self.read(cancel, |doc| Ok(doc.next_catchup(server_id))).await
    }

    async fn reset_subscription_stream_position(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        self.write(cancel, |doc| doc.reset_stream_position(id)).await
    }

    async fn delete_catchup_subscription(
        &self,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<(), RepositoryError> {
        self.write(cancel, |doc| doc.delete_catchup(id)).await
    }

    async fn get_event_store_server(
        &self,
        server_id: EventStoreServerId,
        cancel: &CancellationToken,
    ) -> Result<EventStoreServer, RepositoryError> {
        self.read(cancel, |doc| doc.event_store_server(server_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay::Timestamp;
    use uuid::Uuid;

    fn server() -> EventStoreServerId {
        EventStoreServerId::from_uuid(Uuid::from_u128(0xE5))
    }

    fn id(n: u128) -> SubscriptionId {
        SubscriptionId::from_uuid(Uuid::from_u128(n))
    }

    fn config(n: u128) -> SubscriptionConfiguration {
        SubscriptionConfiguration {
            subscription_id: id(n),
            event_store_server_id: server(),
            stream_name: "orders".into(),
            group_name: "billing".into(),
            end_point_uri: Some("http://x/hook".into()),
            stream_position_to_restart_from: Some(5),
        }
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileConfigurationRepository::new(dir.path().join("relay.json"));

        let listed = repo
            .list_subscription_configurations(server(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn edits_to_the_file_are_seen_on_the_next_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let repo = JsonFileConfigurationRepository::new(&path);
        let cancel = CancellationToken::new();

        let doc = ConfigurationDocument {
            subscriptions: vec![config(1)],
            ..ConfigurationDocument::default()
        };
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert_eq!(repo.list_subscription_configurations(server(), &cancel).await.unwrap().len(), 1);

        std::fs::write(&path, br#"{"subscriptions": []}"#).unwrap();
        assert!(repo.list_subscription_configurations(server(), &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_is_written_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let repo = JsonFileConfigurationRepository::new(&path);
        repo.modify(|doc| {
            doc.upsert_subscription(config(1));
            Ok(())
        })
        .await
        .unwrap();

        repo.reset_subscription_stream_position(id(1), &CancellationToken::new())
            .await
            .unwrap();

        let on_disk: ConfigurationDocument =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.subscriptions[0].stream_position_to_restart_from, None);
        assert!(!dir.path().join("relay.json.tmp").exists());
    }

    #[tokio::test]
    async fn catchup_jobs_are_claimed_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileConfigurationRepository::new(dir.path().join("relay.json"));
        let cancel = CancellationToken::new();
        repo.modify(|doc| {
            doc.add_catchup(CatchupSubscriptionConfiguration {
                subscription_id: id(9),
                event_store_server_id: server(),
                stream_name: "orders".into(),
                name: "backfill".into(),
                position: 3,
                end_point_uri: Some("http://x/backfill".into()),
                create_date_time: Timestamp::now(),
            });
            Ok(())
        })
        .await
        .unwrap();

        let next = repo
            .get_next_catchup_subscription_configuration(server(), &cancel)
            .await
            .unwrap();
        assert_eq!(next.map(|j| j.subscription_id), Some(id(9)));

        repo.delete_catchup_subscription(id(9), &cancel).await.unwrap();
        let err = repo.delete_catchup_subscription(id(9), &cancel).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            repo.get_next_catchup_subscription_configuration(server(), &cancel).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn malformed_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let repo = JsonFileConfigurationRepository::new(&path);

        let err = repo
            .list_subscription_configurations(server(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn cancelled_writes_do_not_touch_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let repo = JsonFileConfigurationRepository::new(&path);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = repo.reset_subscription_stream_position(id(1), &cancel).await.unwrap_err();
        assert_eq!(err, RepositoryError::Cancelled);
        assert!(!path.exists());
    }
}
