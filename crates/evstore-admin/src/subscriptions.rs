//! Read-side administration of persistent subscription groups.

use evstore_core::http::HttpClient;
use evstore_core::{EndPoint, UserCredentials};
use http::StatusCode;

use crate::error::AdminResult;
use crate::models::PersistentSubscriptionDetails;
use crate::request::AdminHttp;

#[derive(Debug, Clone)]
pub struct PersistentSubscriptionsManager {
    http: AdminHttp,
}

impl PersistentSubscriptionsManager {
    pub fn new(endpoint: EndPoint, client: HttpClient) -> Self {
        Self {
            http: AdminHttp::new(endpoint, client),
        }
    }

    pub fn with_default_credentials(mut self, credentials: UserCredentials) -> Self {
        self.http.set_default_credentials(credentials);
        self
    }

    pub async fn describe(
        &self,
        stream: &str,
        group: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<PersistentSubscriptionDetails> {
        let body = self
            .http
            .get(&format!("/subscriptions/{stream}/{group}/info"), credentials)
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Every group on the node, or only those on `stream`.
    pub async fn list(
        &self,
        stream: Option<&str>,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<Vec<PersistentSubscriptionDetails>> {
        let path = match stream {
            Some(stream) => format!("/subscriptions/{stream}"),
            None => "/subscriptions".to_string(),
        };
        let body = self.http.get(&path, credentials).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Move parked messages back into the group's delivery queue.
    pub async fn replay_parked_messages(
        &self,
        stream: &str,
        group: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<()> {
        let path = format!("/subscriptions/{stream}/{group}/replayParked");
        self.http.post(&path, "", credentials, StatusCode::OK).await
    }
}
