//! 进程内存实现，模拟远端存储的约束校验和乐观并发语义

use crate::conversation::Conversation;
use crate::error::{Result, StoreError};
use crate::store::ConversationStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 远端文档存储的内存替身
///
/// 保留真实存储的关键行为：分配 `conv_` 前缀 id、校验载荷约束、
/// revision 比对。测试和内嵌场景可直接使用。
pub struct InMemoryStore {
    /// agent_id → conversation_id → 文档
    data: RwLock<HashMap<String, HashMap<String, Conversation>>>,
}

/// 与远端约束对齐的载荷上限（超出即 `InvalidArgument`）
const HARD_TITLE_LIMIT: usize = 1_000;
const HARD_CONTENT_LIMIT: usize = 100_000;

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// 校验文档是否满足存储约束
    fn validate(conversation: &Conversation) -> Result<()> {
        if conversation.agent_id.trim().is_empty() || conversation.user_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "agent_id and user_id must be non-empty".to_string(),
            )
            .into());
        }
        if conversation.agent_id.contains('/') || conversation.id.contains('/') {
            return Err(StoreError::InvalidArgument(
                "identifiers must not contain path separators".to_string(),
            )
            .into());
        }
        if conversation.title.chars().count() > HARD_TITLE_LIMIT {
            return Err(
                StoreError::InvalidArgument(format!("title exceeds {HARD_TITLE_LIMIT} chars")).into(),
            );
        }
        for msg in &conversation.messages {
            if msg.content.chars().count() > HARD_CONTENT_LIMIT {
                return Err(StoreError::InvalidArgument(format!(
                    "message content exceeds {HARD_CONTENT_LIMIT} chars"
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create(&self, agent_id: &str, mut conversation: Conversation) -> Result<Conversation> {
        conversation.agent_id = agent_id.to_string();
        conversation.id = format!("conv_{}", uuid::Uuid::new_v4());
        conversation.revision = 1;
        Self::validate(&conversation)?;

        let mut data = self.data.write().await;
        data.entry(agent_id.to_string())
            .or_default()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, agent_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
        let data = self.data.read().await;
        Ok(data
            .get(agent_id)
            .and_then(|ns| ns.get(conversation_id))
            .cloned())
    }

    async fn put(
        &self,
        agent_id: &str,
        mut conversation: Conversation,
        expected_revision: u64,
    ) -> Result<Conversation> {
        Self::validate(&conversation)?;
        let mut data = self.data.write().await;
        let ns = data
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(conversation.id.clone()))?;
        let stored = ns
            .get_mut(&conversation.id)
            .ok_or_else(|| StoreError::NotFound(conversation.id.clone()))?;
        if stored.revision != expected_revision {
            return Err(StoreError::Conflict {
                expected: expected_revision,
                actual: stored.revision,
            }
            .into());
        }
        conversation.revision = expected_revision + 1;
        *stored = conversation.clone();
        Ok(conversation)
    }

    async fn list_by_user(
        &self,
        agent_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let data = self.data.read().await;
        let mut result: Vec<Conversation> = data
            .get(agent_id)
            .map(|ns| {
                ns.values()
                    .filter(|c| c.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if limit > 0 {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let data = self.data.read().await;
        let mut namespaces: Vec<String> = data.keys().cloned().collect();
        namespaces.sort();
        Ok(namespaces)
    }
}
