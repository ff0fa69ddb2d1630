//! 本地会话缓存
//!
//! 远端写入在重试耗尽后降级到这里：按
//! `user → agent_id → conversation_id` 三级组织的键值缓存，
//! 顶层键沿用 `local_conversations_{user_id}` 的命名约定。
//!
//! 缓存同时保存每个副本的同步状态 [`SyncState`]，迁移器据此做到
//! 会话粒度的幂等续传（shell 已建则只补消息，绝不重复建 shell）。
//!
//! ## 内置实现
//!
//! - [`InMemoryCache`]：进程内存，适合测试
//! - [`FileCache`]：JSON 文件持久化，写时立即落盘
//!
//! 缓存是最后的兜底：上层约定缓存写入失败不反噬调用方的操作，
//! 只记录日志（见 service 层）。

use crate::conversation::{Conversation, Message, LOCAL_ID_PREFIX};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

// ── SyncState ─────────────────────────────────────────────────────────────────

/// 本地副本向远端迁移的进度（随副本一起持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// 尚未开始迁移
    #[default]
    NotStarted,
    /// 远端 shell 已创建，消息回放进行中
    ShellCreated {
        /// 远端分配的会话 id
        remote_id: String,
        /// 已成功回放的消息条数，续传从此处开始
        replayed: usize,
        /// shell 当前 revision，续传追加时做乐观并发比对
        revision: u64,
    },
    /// 全部消息已回放，本地副本可删除
    Complete,
}

/// 缓存中的单个会话副本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedConversation {
    pub conversation: Conversation,
    #[serde(default)]
    pub sync_state: SyncState,
}

/// user → agent_id → conversation_id → 副本
type CacheData = HashMap<String, HashMap<String, HashMap<String, CachedConversation>>>;

/// 顶层键命名约定
fn user_key(user_id: &str) -> String {
    format!("local_conversations_{user_id}")
}

// ── LocalCache trait ──────────────────────────────────────────────────────────

/// 本地缓存的统一接口
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// 写入或覆盖一个会话副本（键取自会话自身的 user_id/agent_id/id）
    async fn put(&self, conversation: Conversation) -> Result<()>;

    /// 向已缓存的会话追加消息；副本不存在时返回 `Ok(false)`
    async fn append_message(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
        message: Message,
    ) -> Result<bool>;

    async fn get(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CachedConversation>>;

    /// 展平该用户的所有缓存会话，按 `updated_at` 降序
    async fn list_all(&self, user_id: &str) -> Result<Vec<Conversation>>;

    /// 离线创建（`local_` 前缀 id）的副本，含尚未补删的 `Complete` 残留
    async fn list_local_only(&self, user_id: &str) -> Result<Vec<CachedConversation>>;

    /// 删除副本，返回是否存在并删除
    async fn remove(&self, user_id: &str, agent_id: &str, conversation_id: &str) -> Result<bool>;

    /// 更新副本的迁移进度
    async fn set_sync_state(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
        state: SyncState,
    ) -> Result<()>;
}

// ── 共享的纯数据操作 ──────────────────────────────────────────────────────────

fn data_put(data: &mut CacheData, conversation: Conversation) {
    let convs = data
        .entry(user_key(&conversation.user_id))
        .or_default()
        .entry(conversation.agent_id.clone())
        .or_default();
    match convs.get_mut(&conversation.id) {
        // 覆盖内容但保留迁移进度，避免半迁移的会话被悄悄重置
        Some(existing) => existing.conversation = conversation,
        None => {
            convs.insert(
                conversation.id.clone(),
                CachedConversation {
                    conversation,
                    sync_state: SyncState::default(),
                },
            );
        }
    }
}

fn data_append(
    data: &mut CacheData,
    user_id: &str,
    agent_id: &str,
    conversation_id: &str,
    message: Message,
) -> bool {
    let Some(cached) = data
        .get_mut(&user_key(user_id))
        .and_then(|agents| agents.get_mut(agent_id))
        .and_then(|convs| convs.get_mut(conversation_id))
    else {
        return false;
    };
    cached.conversation.append(message);
    true
}

fn data_list_all(data: &CacheData, user_id: &str) -> Vec<Conversation> {
    let mut result: Vec<Conversation> = data
        .get(&user_key(user_id))
        .map(|agents| {
            agents
                .values()
                .flat_map(|convs| convs.values())
                .map(|c| c.conversation.clone())
                .collect()
        })
        .unwrap_or_default();
    result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    result
}

fn data_list_local_only(data: &CacheData, user_id: &str) -> Vec<CachedConversation> {
    let mut result: Vec<CachedConversation> = data
        .get(&user_key(user_id))
        .map(|agents| {
            agents
                .values()
                .flat_map(|convs| convs.values())
                .filter(|c| c.conversation.id.starts_with(LOCAL_ID_PREFIX))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    result.sort_by(|a, b| a.conversation.created_at.cmp(&b.conversation.created_at));
    result
}

fn data_remove(data: &mut CacheData, user_id: &str, agent_id: &str, conversation_id: &str) -> bool {
    data.get_mut(&user_key(user_id))
        .and_then(|agents| agents.get_mut(agent_id))
        .map(|convs| convs.remove(conversation_id).is_some())
        .unwrap_or(false)
}

fn data_set_state(
    data: &mut CacheData,
    user_id: &str,
    agent_id: &str,
    conversation_id: &str,
    state: SyncState,
) -> bool {
    data.get_mut(&user_key(user_id))
        .and_then(|agents| agents.get_mut(agent_id))
        .and_then(|convs| convs.get_mut(conversation_id))
        .map(|cached| {
            cached.sync_state = state;
        })
        .is_some()
}

// ── InMemoryCache ─────────────────────────────────────────────────────────────

/// 进程内存缓存，不持久化，适合测试
pub struct InMemoryCache {
    data: RwLock<CacheData>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LocalCache for InMemoryCache {
    async fn put(&self, conversation: Conversation) -> Result<()> {
        data_put(&mut *self.data.write().await, conversation);
        Ok(())
    }

    async fn append_message(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
        message: Message,
    ) -> Result<bool> {
        Ok(data_append(
            &mut *self.data.write().await,
            user_id,
            agent_id,
            conversation_id,
            message,
        ))
    }

    async fn get(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CachedConversation>> {
        let data = self.data.read().await;
        Ok(data
            .get(&user_key(user_id))
            .and_then(|agents| agents.get(agent_id))
            .and_then(|convs| convs.get(conversation_id))
            .cloned())
    }

    async fn list_all(&self, user_id: &str) -> Result<Vec<Conversation>> {
        Ok(data_list_all(&*self.data.read().await, user_id))
    }

    async fn list_local_only(&self, user_id: &str) -> Result<Vec<CachedConversation>> {
        Ok(data_list_local_only(&*self.data.read().await, user_id))
    }

    async fn remove(&self, user_id: &str, agent_id: &str, conversation_id: &str) -> Result<bool> {
        Ok(data_remove(
            &mut *self.data.write().await,
            user_id,
            agent_id,
            conversation_id,
        ))
    }

    async fn set_sync_state(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
        state: SyncState,
    ) -> Result<()> {
        data_set_state(
            &mut *self.data.write().await,
            user_id,
            agent_id,
            conversation_id,
            state,
        );
        Ok(())
    }
}

// ── FileCache ─────────────────────────────────────────────────────────────────

/// 基于 JSON 文件的持久化缓存
///
/// 写时立即落盘，读时从内存返回。文件解析失败时打 warn 并从空状态
/// 开始，不阻塞启动。
pub struct FileCache {
    path: PathBuf,
    data: RwLock<CacheData>,
}

impl FileCache {
    /// 打开或创建缓存文件，自动建父目录
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::IoError(format!("创建目录失败: {e}")))?;
        }
        let data: CacheData = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CacheError::IoError(format!("读取缓存文件失败: {e}")))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("缓存文件解析失败，从空状态开始: {e}");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        let user_count = data.len();
        info!(path = %path.display(), users = user_count, "🗄️ FileCache 初始化");
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    async fn flush(&self) -> Result<()> {
        let data = self.data.read().await;
        let json = serde_json::to_string_pretty(&*data)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| CacheError::IoError(format!("写入缓存文件失败: {e}")))?;
        debug!(path = %self.path.display(), "💾 缓存已持久化");
        Ok(())
    }
}

#[async_trait]
impl LocalCache for FileCache {
    async fn put(&self, conversation: Conversation) -> Result<()> {
        data_put(&mut *self.data.write().await, conversation);
        self.flush().await
    }

    async fn append_message(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
        message: Message,
    ) -> Result<bool> {
        let found = data_append(
            &mut *self.data.write().await,
            user_id,
            agent_id,
            conversation_id,
            message,
        );
        if found {
            self.flush().await?;
        }
        Ok(found)
    }

    async fn get(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CachedConversation>> {
        let data = self.data.read().await;
        Ok(data
            .get(&user_key(user_id))
            .and_then(|agents| agents.get(agent_id))
            .and_then(|convs| convs.get(conversation_id))
            .cloned())
    }

    async fn list_all(&self, user_id: &str) -> Result<Vec<Conversation>> {
        Ok(data_list_all(&*self.data.read().await, user_id))
    }

    async fn list_local_only(&self, user_id: &str) -> Result<Vec<CachedConversation>> {
        Ok(data_list_local_only(&*self.data.read().await, user_id))
    }

    async fn remove(&self, user_id: &str, agent_id: &str, conversation_id: &str) -> Result<bool> {
        let found = data_remove(
            &mut *self.data.write().await,
            user_id,
            agent_id,
            conversation_id,
        );
        if found {
            self.flush().await?;
            info!(conversation_id = %conversation_id, "🗑️ 本地副本已删除");
        }
        Ok(found)
    }

    async fn set_sync_state(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
        state: SyncState,
    ) -> Result<()> {
        let found = data_set_state(
            &mut *self.data.write().await,
            user_id,
            agent_id,
            conversation_id,
            state,
        );
        if found {
            self.flush().await?;
        }
        Ok(())
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/")
        && let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
    {
        return PathBuf::from(home).join(&s[2..]);
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;

    fn local_conv(user: &str, agent: &str, title: &str) -> Conversation {
        Conversation::new_local(agent, user, title)
    }

    #[tokio::test]
    async fn test_put_and_list_sorted() {
        let cache = InMemoryCache::new();
        let mut older = local_conv("user_1", "agent_a", "旧");
        let mut newer = local_conv("user_1", "agent_b", "新");
        older.updated_at = 100;
        newer.updated_at = 200;
        cache.put(older).await.unwrap();
        cache.put(newer).await.unwrap();

        let list = cache.list_all("user_1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].title, "新");
    }

    #[tokio::test]
    async fn test_append_to_missing_conversation() {
        let cache = InMemoryCache::new();
        let found = cache
            .append_message("user_1", "agent_a", "no-such-id", Message::user("hi"))
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn test_list_local_only_skips_remote_ids() {
        let cache = InMemoryCache::new();
        cache.put(local_conv("user_1", "agent_a", "离线")).await.unwrap();
        let mut remote = Conversation::new("agent_a", "user_1", "远端副本");
        remote.id = "conv_123".to_string();
        cache.put(remote).await.unwrap();

        let local_only = cache.list_local_only("user_1").await.unwrap();
        assert_eq!(local_only.len(), 1);
        assert_eq!(local_only[0].conversation.title, "离线");
    }

    #[tokio::test]
    async fn test_sync_state_round_trip() {
        let cache = InMemoryCache::new();
        let conv = local_conv("user_1", "agent_a", "标题");
        let conv_id = conv.id.clone();
        cache.put(conv).await.unwrap();

        cache
            .set_sync_state(
                "user_1",
                "agent_a",
                &conv_id,
                SyncState::ShellCreated {
                    remote_id: "conv_remote".to_string(),
                    replayed: 2,
                    revision: 3,
                },
            )
            .await
            .unwrap();

        let cached = cache.get("user_1", "agent_a", &conv_id).await.unwrap().unwrap();
        assert_eq!(
            cached.sync_state,
            SyncState::ShellCreated {
                remote_id: "conv_remote".to_string(),
                replayed: 2,
                revision: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_put_preserves_sync_state_on_overwrite() {
        let cache = InMemoryCache::new();
        let conv = local_conv("user_1", "agent_a", "标题");
        let conv_id = conv.id.clone();
        cache.put(conv.clone()).await.unwrap();
        cache
            .set_sync_state(
                "user_1",
                "agent_a",
                &conv_id,
                SyncState::ShellCreated {
                    remote_id: "conv_remote".to_string(),
                    replayed: 1,
                    revision: 2,
                },
            )
            .await
            .unwrap();

        // 同一 id 覆盖写入不得把进度重置回 NotStarted
        let mut updated = conv;
        updated.title = "新标题".to_string();
        cache.put(updated).await.unwrap();

        let cached = cache.get("user_1", "agent_a", &conv_id).await.unwrap().unwrap();
        assert_eq!(cached.conversation.title, "新标题");
        assert!(matches!(
            cached.sync_state,
            SyncState::ShellCreated { replayed: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_complete_leftover_still_listed_as_local() {
        let cache = InMemoryCache::new();
        let conv = local_conv("user_1", "agent_a", "残留");
        let conv_id = conv.id.clone();
        cache.put(conv).await.unwrap();
        cache
            .set_sync_state("user_1", "agent_a", &conv_id, SyncState::Complete)
            .await
            .unwrap();

        // Complete 残留必须对迁移器可见，否则无人补删
        let local_only = cache.list_local_only("user_1").await.unwrap();
        assert_eq!(local_only.len(), 1);
        assert_eq!(local_only[0].sync_state, SyncState::Complete);
    }

    #[tokio::test]
    async fn test_file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        {
            let cache = FileCache::new(&path).unwrap();
            let mut conv = local_conv("user_1", "agent_a", "持久化");
            conv.append(Message::user("m1"));
            cache.put(conv).await.unwrap();
        }

        let cache = FileCache::new(&path).unwrap();
        let list = cache.list_all("user_1").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "持久化");
        assert_eq!(list[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "这不是 JSON").unwrap();

        let cache = FileCache::new(&path).unwrap();
        assert!(cache.list_all("user_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = InMemoryCache::new();
        let conv = local_conv("user_1", "agent_a", "待删除");
        let conv_id = conv.id.clone();
        cache.put(conv).await.unwrap();

        assert!(cache.remove("user_1", "agent_a", &conv_id).await.unwrap());
        assert!(!cache.remove("user_1", "agent_a", &conv_id).await.unwrap());
        assert!(cache.list_all("user_1").await.unwrap().is_empty());
    }
}
