//! `PresenceStore` over REST: `PUT {base}/presence/{subject}` with
//! `{"status": "offline", "lastSeen": ms}`.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::{
    domain::{CredentialProvider, PresenceStatus, PresenceStore, SubjectId, Timestamp},
    error::PersistenceError,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceSnapshotRequest {
    status: PresenceStatus,
    last_seen: i64,
}

pub struct HttpPresenceStore {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpPresenceStore {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl PresenceStore for HttpPresenceStore {
    async fn persist_offline(
        &self,
        subject: &SubjectId,
        last_seen: Timestamp,
    ) -> Result<(), PersistenceError> {
        let token = self
            .credentials
            .bearer_token()
            .await
            .map_err(|e| PersistenceError::RequestFailed(e.to_string()))?;

        self.http
            .put(format!("{}/presence/{}", self.base_url, subject))
            .bearer_auth(token)
            .json(&PresenceSnapshotRequest {
                status: PresenceStatus::Offline,
                last_seen: last_seen.value(),
            })
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| PersistenceError::RequestFailed(e.to_string()))?;
        Ok(())
    }
}
