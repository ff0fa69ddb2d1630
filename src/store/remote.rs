//! HTTP 文档存储客户端
//!
//! 按 `{base_url}/{命名空间集合}/{agent_id}/{子集合}/{conversation_id}`
//! 两级路径寻址远端文档，HTTP 状态码映射到存储错误分类：
//!
//! | 状态码 | 错误 |
//! |--------|------|
//! | 400 | `InvalidArgument` |
//! | 401 / 403 | `PermissionDenied` |
//! | 404 | `NotFound` |
//! | 409 | `Conflict` |
//! | 429 / 5xx / 传输层 | `Unavailable` |
//!
//! 单个请求不设独立超时，最坏时延由上层重试控制器的退避上限约束。

use crate::conversation::Conversation;
use crate::error::{ConvoError, Result, StoreError};
use crate::store::ConversationStore;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// 远端文档存储的 REST 客户端
pub struct RemoteStore {
    client: Client,
    base_url: String,
    /// 命名空间集合名（默认 `agents`）
    namespace_collection: String,
    /// 会话子集合名（默认 `conversations`）
    subcollection: String,
    api_key: Option<String>,
}

/// 409 响应体，携带双方 revision 便于调用方重读重放
#[derive(Debug, Deserialize)]
struct ConflictBody {
    expected: u64,
    actual: u64,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace_collection: "agents".to_string(),
            subcollection: "conversations".to_string(),
            api_key: None,
        }
    }

    pub fn with_collections(
        mut self,
        namespace_collection: impl Into<String>,
        subcollection: impl Into<String>,
    ) -> Self {
        self.namespace_collection = namespace_collection.into();
        self.subcollection = subcollection.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn collection_url(&self, agent_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url, self.namespace_collection, agent_id, self.subcollection
        )
    }

    fn document_url(&self, agent_id: &str, conversation_id: &str) -> String {
        format!("{}/{}", self.collection_url(agent_id), conversation_id)
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// 非成功状态码映射为存储错误分类
    async fn classify_failure(response: Response) -> ConvoError {
        let status = response.status();
        if status == StatusCode::CONFLICT {
            if let Ok(body) = response.json::<ConflictBody>().await {
                return StoreError::Conflict {
                    expected: body.expected,
                    actual: body.actual,
                }
                .into();
            }
            return StoreError::Unavailable("conflict body unreadable".to_string()).into();
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let err = match status {
            StatusCode::BAD_REQUEST => StoreError::InvalidArgument(text),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied(text),
            StatusCode::NOT_FOUND => StoreError::NotFound(text),
            _ => StoreError::Unavailable(format!("status {}: {}", status.as_u16(), text)),
        };
        err.into()
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Unavailable(format!("invalid response body: {e}")).into())
    }
}

#[async_trait]
impl ConversationStore for RemoteStore {
    async fn create(&self, agent_id: &str, conversation: Conversation) -> Result<Conversation> {
        let url = self.collection_url(agent_id);
        let response = self
            .apply_auth(self.client.post(&url))
            .json(&conversation)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        let created: Conversation = Self::decode(response).await?;
        debug!(agent_id = %agent_id, conversation_id = %created.id, "📤 远端会话已创建");
        Ok(created)
    }

    async fn get(&self, agent_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
        let url = self.document_url(agent_id, conversation_id);
        let response = self.apply_auth(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        Ok(Some(Self::decode(response).await?))
    }

    async fn put(
        &self,
        agent_id: &str,
        conversation: Conversation,
        expected_revision: u64,
    ) -> Result<Conversation> {
        let url = self.document_url(agent_id, &conversation.id);
        let response = self
            .apply_auth(self.client.put(&url))
            .query(&[("expected_revision", expected_revision)])
            .json(&conversation)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        Self::decode(response).await
    }

    async fn list_by_user(
        &self,
        agent_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let url = self.collection_url(agent_id);
        let mut request = self
            .apply_auth(self.client.get(&url))
            .query(&[("user_id", user_id), ("order_by", "updated_at desc")]);
        if limit > 0 {
            request = request.query(&[("limit", limit)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        Self::decode(response).await
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let url = format!("{}/{}", self.base_url, self.namespace_collection);
        let response = self.apply_auth(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        Self::decode(response).await
    }
}
