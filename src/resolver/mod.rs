//! 跨命名空间会话定位
//!
//! 远端主地址是 `(agent_id, conversation_id)` 二元组；调用方有时只持有
//! `conversation_id`。解析分两步：
//!
//! 1. 查二级索引 `conversation_id → agent_id`（随 create/get/resolve
//!    命中增量维护），命中则一次 `get` 直达
//! 2. 索引未命中时枚举 `list_namespaces()` 逐个探测，按字典序保证
//!    确定性；首个归属校验通过的匹配即为结果
//!
//! 线性扫描的成本是 O(命名空间数)，只因命名空间数量小才可接受，
//! 索引的存在让它退化为冷启动路径。

use crate::conversation::Conversation;
use crate::error::{Result, StoreError};
use crate::store::ConversationStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub struct ConversationResolver {
    store: Arc<dyn ConversationStore>,
    /// conversation_id → agent_id 二级索引
    index: RwLock<HashMap<String, String>>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// 登记一条 id → 命名空间映射（create/get 成功后调用）
    pub async fn record(&self, conversation_id: &str, agent_id: &str) {
        self.index
            .write()
            .await
            .insert(conversation_id.to_string(), agent_id.to_string());
    }

    /// 仅凭 `conversation_id` 定位会话并校验归属
    ///
    /// 归属不符返回 `PermissionDenied`（终态），扫遍所有命名空间仍无
    /// 匹配返回 `NotFound`。
    pub async fn resolve(&self, user_id: &str, conversation_id: &str) -> Result<Conversation> {
        // 索引命中直达；文档可能已消失（索引过期），此时移除条目回退扫描
        let indexed = self.index.read().await.get(conversation_id).cloned();
        if let Some(agent_id) = indexed {
            match self.store.get(&agent_id, conversation_id).await? {
                Some(conv) => return check_owner(conv, user_id),
                None => {
                    debug!(conversation_id = %conversation_id, "索引过期，回退到全量扫描");
                    self.index.write().await.remove(conversation_id);
                }
            }
        }

        let mut namespaces = self.store.list_namespaces().await?;
        namespaces.sort();
        for agent_id in namespaces {
            if let Some(conv) = self.store.get(&agent_id, conversation_id).await? {
                let conv = check_owner(conv, user_id)?;
                self.record(conversation_id, &agent_id).await;
                debug!(conversation_id = %conversation_id, agent_id = %agent_id, "🔎 扫描定位到会话");
                return Ok(conv);
            }
        }
        Err(StoreError::NotFound(conversation_id.to_string()).into())
    }
}

fn check_owner(conversation: Conversation, user_id: &str) -> Result<Conversation> {
    if conversation.user_id != user_id {
        return Err(StoreError::PermissionDenied(format!(
            "conversation '{}' belongs to another user",
            conversation.id
        ))
        .into());
    }
    Ok(conversation)
}
