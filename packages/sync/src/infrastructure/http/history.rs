//! `HistoryRepository` over the REST history API.
//!
//! `GET {base}/conversations/{key}/messages?limit=N[&before=ID]` answers
//! `{"messages": [...], "nextCursor": "..."}` with messages in the
//! `message:new` payload shape.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    domain::{
        CanonicalId, ConversationKey, CredentialProvider, HistoryPage, HistoryRepository,
        IncomingMessage,
    },
    error::HistoryError,
    infrastructure::dto::websocket::MessagePayload,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPageResponse {
    #[serde(default)]
    messages: Vec<MessagePayload>,
    #[serde(default)]
    next_cursor: Option<String>,
}

pub struct HttpHistoryRepository {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpHistoryRepository {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }
}

fn into_page(response: HistoryPageResponse) -> Result<HistoryPage, HistoryError> {
    let messages = response
        .messages
        .into_iter()
        .map(IncomingMessage::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HistoryError::Malformed(e.to_string()))?;
    let next_cursor = response
        .next_cursor
        .map(CanonicalId::new)
        .transpose()
        .map_err(|e| HistoryError::Malformed(e.to_string()))?;
    Ok(HistoryPage {
        messages,
        next_cursor,
    })
}

#[async_trait]
impl HistoryRepository for HttpHistoryRepository {
    async fn fetch_page(
        &self,
        conversation: &ConversationKey,
        before: Option<CanonicalId>,
        limit: usize,
    ) -> Result<HistoryPage, HistoryError> {
        let token = self
            .credentials
            .bearer_token()
            .await
            .map_err(|e| HistoryError::RequestFailed(e.to_string()))?;

        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.into_string()));
        }

        let response: HistoryPageResponse = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation
            ))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| HistoryError::RequestFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| HistoryError::Malformed(e.to_string()))?;

        let page = into_page(response)?;
        tracing::debug!(
            conversation = %conversation,
            count = page.messages.len(),
            "Fetched history page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_page_converts_messages_and_cursor() {
        // テスト項目: レスポンスのメッセージとカーソルがドメイン型に変換される
        // given (前提条件):
        let response: HistoryPageResponse = serde_json::from_str(
            r#"{
                "messages": [{
                    "id": "m1",
                    "conversationKey": "dm:alice:bob",
                    "senderId": "bob",
                    "content": "hi",
                    "createdAt": 1000
                }],
                "nextCursor": "m0"
            }"#,
        )
        .unwrap();

        // when (操作):
        let page = into_page(response).unwrap();

        // then (期待する結果):
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].canonical_id.as_str(), "m1");
        assert_eq!(page.next_cursor, Some(CanonicalId::new("m0").unwrap()));
    }

    #[test]
    fn test_into_page_rejects_invalid_message() {
        // テスト項目: 不正な ID を含むページは Malformed エラーになる
        // given (前提条件):
        let response: HistoryPageResponse = serde_json::from_str(
            r#"{"messages": [{
                "id": "",
                "conversationKey": "dm:alice:bob",
                "senderId": "bob",
                "content": "hi",
                "createdAt": 1000
            }]}"#,
        )
        .unwrap();

        // when (操作):
        let result = into_page(response);

        // then (期待する結果):
        assert!(matches!(result, Err(HistoryError::Malformed(_))));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        // テスト項目: ベース URL 末尾のスラッシュが取り除かれる
        // given (前提条件):
        let credentials = Arc::new(crate::domain::StaticCredential::new("token"));

        // when (操作):
        let repository = HttpHistoryRepository::new("http://127.0.0.1:8080/api/", credentials);

        // then (期待する結果):
        assert_eq!(repository.base_url, "http://127.0.0.1:8080/api");
    }
}
