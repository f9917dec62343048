//! The configuration document both repositories serve.

use relay::{
    CatchupSubscriptionConfiguration, EventStoreServer, EventStoreServerId, RepositoryError,
    SubscriptionConfiguration, SubscriptionId,
};
use serde::{Deserialize, Serialize};

/// Every configuration record the relay reads, as one serialisable value.
///
/// This is also the on-disk layout of the JSON file repository:
///
/// ```json
/// {
///   "subscriptions": [ { "subscriptionId": "…", "eventStoreServerId": "…",
///                        "streamName": "orders", "groupName": "billing",
///                        "endPointUri": "http://x/hook" } ],
///   "catchupSubscriptions": [],
///   "eventStoreServers": []
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigurationDocument {
    pub subscriptions: Vec<SubscriptionConfiguration>,
    pub catchup_subscriptions: Vec<CatchupSubscriptionConfiguration>,
    pub event_store_servers: Vec<EventStoreServer>,
}

impl ConfigurationDocument {
    pub fn subscriptions_for(&self, server_id: EventStoreServerId) -> Vec<SubscriptionConfiguration> {
        self.subscriptions
            .iter()
            .filter(|s| s.event_store_server_id == server_id)
            .cloned()
            .collect()
    }

    pub fn subscription(&self, id: SubscriptionId) -> Result<SubscriptionConfiguration, RepositoryError> {
        self.subscriptions
            .iter()
            .find(|s| s.subscription_id == id)
            .cloned()
            .ok_or_else(|| RepositoryError::subscription_not_found(id))
    }

    pub fn catchup(&self, id: SubscriptionId) -> Result<CatchupSubscriptionConfiguration, RepositoryError> {
        self.catchup_subscriptions
            .iter()
            .find(|c| c.subscription_id == id)
            .cloned()
            .ok_or_else(|| RepositoryError::catchup_not_found(id))
    }

    /// The oldest catch-up job for `server_id`. Ties on creation time go to
    /// the lower identifier.
    pub fn next_catchup(&self, server_id: EventStoreServerId) -> Option<CatchupSubscriptionConfiguration> {
        self.catchup_subscriptions
            .iter()
            .filter(|c| c.event_store_server_id == server_id)
            .min_by_key(|c| (c.create_date_time, c.subscription_id))
            .cloned()
    }

    pub fn reset_stream_position(&mut self, id: SubscriptionId) -> Result<(), RepositoryError> {
        let config = self
            .subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == id)
            .ok_or_else(|| RepositoryError::subscription_not_found(id))?;
        config.stream_position_to_restart_from = None;
        Ok(())
    }

    pub fn delete_catchup(&mut self, id: SubscriptionId) -> Result<(), RepositoryError> {
        let before = self.catchup_subscriptions.len();
        self.catchup_subscriptions.retain(|c| c.subscription_id != id);
        if self.catchup_subscriptions.len() == before {
            return Err(RepositoryError::catchup_not_found(id));
        }
        Ok(())
    }

    pub fn event_store_server(&self, server_id: EventStoreServerId) -> Result<EventStoreServer, RepositoryError> {
        self.event_store_servers
            .iter()
            .find(|s| s.event_store_server_id == server_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "Event Store Server",
                id: server_id.to_string(),
            })
    }

    /// Inserts `config`, replacing any record with the same identifier.
    pub fn upsert_subscription(&mut self, config: SubscriptionConfiguration) {
        match self
            .subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == config.subscription_id)
        {
            Some(existing) => *existing = config,
            None => self.subscriptions.push(config),
        }
    }

    /// Returns `false` if no record had that identifier.
    pub fn remove_subscription(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.subscription_id != id);
        self.subscriptions.len() != before
    }

    /// Sets the one-shot replay position of a subscription.
    pub fn request_replay(&mut self, id: SubscriptionId, position: i64) -> Result<(), RepositoryError> {
        let config = self
            .subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == id)
            .ok_or_else(|| RepositoryError::subscription_not_found(id))?;
        config.stream_position_to_restart_from = Some(position);
        Ok(())
    }

    pub fn add_catchup(&mut self, job: CatchupSubscriptionConfiguration) {
        self.catchup_subscriptions.retain(|c| c.subscription_id != job.subscription_id);
        self.catchup_subscriptions.push(job);
    }

    pub fn add_event_store_server(&mut self, server: EventStoreServer) {
        self.event_store_servers
            .retain(|s| s.event_store_server_id != server.event_store_server_id);
        self.event_store_servers.push(server);
    }
}
