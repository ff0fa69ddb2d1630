//! 本地副本向远端的迁移（Reconciler）
//!
//! 远端恢复可达后，把离线创建的会话搬回远端并保持消息时序。迁移以
//! 会话为粒度幂等：进度状态 [`SyncState`] 随本地副本持久化，中断后
//! 的重试从上次进度续传，而不是重建 shell 造成远端重复。
//!
//! 单个会话的迁移流程：
//!
//! 1. `NotStarted` → 远端 `create` 一个不带消息的 shell，
//!    记录 `ShellCreated { remote_id, replayed: 0 }`
//! 2. `ShellCreated` → 按原始顺序逐条回放消息，每成功一条推进
//!    `replayed` 并落盘
//! 3. 全部回放完 → 标记 `Complete` 并删除本地副本
//!
//! 部分失败时本地副本原样保留，等待下一轮。

use crate::cache::{CachedConversation, LocalCache, SyncState};
use crate::conversation::Conversation;
use crate::error::{ConvoError, Result, StoreError, SyncError};
use crate::retry::{Retrier, RetryDecision, RetryPolicy};
use crate::sanitize::{self, Strictness, MAX_TITLE_LEN};
use crate::store::ConversationStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一轮迁移的结果统计
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    /// 完整迁移并删除本地副本的会话数
    pub migrated: usize,
    /// 本轮失败、留待下次续传的会话数
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn ConversationStore>,
    cache: Arc<dyn LocalCache>,
    retrier: Retrier,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        cache: Arc<dyn LocalCache>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            retrier: Retrier::new(policy),
        }
    }

    /// 轻量可达性探测：命名空间枚举成功即视为远端恢复
    pub async fn probe(&self) -> bool {
        self.store.list_namespaces().await.is_ok()
    }

    /// 迁移该用户的全部离线会话
    ///
    /// 远端不可达时整轮跳过；单个会话失败不影响其余会话。
    pub async fn sync_user(&self, user_id: &str) -> Result<SyncReport> {
        if !self.probe().await {
            return Err(SyncError::RemoteUnreachable("可达性探测失败".to_string()).into());
        }

        let pending = self.cache.list_local_only(user_id).await?;
        if pending.is_empty() {
            debug!(user_id = %user_id, "无待迁移的本地会话");
            return Ok(SyncReport::default());
        }
        info!(user_id = %user_id, pending = pending.len(), "🔄 开始迁移本地会话");

        let mut report = SyncReport::default();
        for cached in &pending {
            match self.migrate_one(cached).await {
                Ok(()) => report.migrated += 1,
                Err(e) => {
                    warn!(
                        conversation_id = %cached.conversation.id,
                        error = %e,
                        "会话迁移失败，本地副本保留待续传"
                    );
                    report.failed += 1;
                }
            }
        }
        info!(
            user_id = %user_id,
            migrated = report.migrated,
            failed = report.failed,
            "🔄 本轮迁移结束"
        );
        Ok(report)
    }

    /// 迁移单个会话，从持久化的进度状态续传
    async fn migrate_one(&self, cached: &CachedConversation) -> Result<()> {
        let conv = &cached.conversation;
        let (user_id, agent_id, local_id) = (&conv.user_id, &conv.agent_id, &conv.id);

        let (mut remote_doc, mut replayed) = match &cached.sync_state {
            SyncState::NotStarted => {
                let shell = self.create_shell(conv).await?;
                self.cache
                    .set_sync_state(
                        user_id,
                        agent_id,
                        local_id,
                        SyncState::ShellCreated {
                            remote_id: shell.id.clone(),
                            replayed: 0,
                            revision: shell.revision,
                        },
                    )
                    .await?;
                (shell, 0)
            }
            SyncState::ShellCreated { remote_id, replayed, .. } => {
                let doc = self
                    .store
                    .get(agent_id, remote_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(remote_id.clone()))?;
                debug!(
                    conversation_id = %local_id,
                    remote_id = %remote_id,
                    replayed = replayed,
                    "续传已建 shell 的消息回放"
                );
                (doc, *replayed)
            }
            SyncState::Complete => {
                // 上一轮删除本地副本前中断，补删即可
                self.cache.remove(user_id, agent_id, local_id).await?;
                return Ok(());
            }
        };

        // 按原始顺序回放，每成功一条推进并落盘进度
        for message in conv.messages.iter().skip(replayed) {
            let expected = remote_doc.revision;
            let mut next = remote_doc.clone();
            next.append(message.clone());
            remote_doc = match self.put_with_retry(agent_id, next, expected).await {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(conversation_id = %local_id, replayed = replayed, error = %e, "消息回放中断");
                    return Err(SyncError::ReplayInterrupted {
                        conversation_id: local_id.clone(),
                        replayed,
                    }
                    .into());
                }
            };
            replayed += 1;
            self.cache
                .set_sync_state(
                    user_id,
                    agent_id,
                    local_id,
                    SyncState::ShellCreated {
                        remote_id: remote_doc.id.clone(),
                        replayed,
                        revision: remote_doc.revision,
                    },
                )
                .await?;
        }

        self.cache
            .set_sync_state(user_id, agent_id, local_id, SyncState::Complete)
            .await?;
        self.cache.remove(user_id, agent_id, local_id).await?;
        info!(
            conversation_id = %local_id,
            remote_id = %remote_doc.id,
            messages = replayed,
            "✅ 本地会话迁移完成"
        );
        Ok(())
    }

    /// 创建不带消息的远端 shell，`InvalidArgument` 时升级清洗后重试
    async fn create_shell(&self, conv: &Conversation) -> Result<Conversation> {
        let mut attempt = 1u32;
        // 只有被拒才升级清洗强度，网络类重试原样重发
        let mut rejected = 0u32;
        loop {
            let level = Strictness::for_attempt(rejected + 1);
            let mut shell = Conversation::new(
                conv.agent_id.clone(),
                conv.user_id.clone(),
                sanitize::sanitize_text(&conv.title, MAX_TITLE_LEN, level),
            );
            shell.agent_type = conv.agent_type;
            shell.metadata = conv
                .metadata
                .as_ref()
                .and_then(|m| sanitize::sanitize_metadata(&serde_json::Value::Object(m.clone()), level));
            shell.created_at = conv.created_at;
            shell.updated_at = conv.updated_at;

            match self.store.create(&conv.agent_id, shell).await {
                Ok(created) => return Ok(created),
                Err(e) => {
                    if matches!(e.as_store_error(), Some(StoreError::InvalidArgument(_))) {
                        rejected += 1;
                    }
                    match self.retrier.decide(attempt, &e) {
                        RetryDecision::Retry { delay } => {
                            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, error = %e, "shell 创建失败，退避重试");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::Stop => return Err(e),
                    }
                }
            }
        }
    }

    async fn put_with_retry(
        &self,
        agent_id: &str,
        conversation: Conversation,
        expected_revision: u64,
    ) -> Result<Conversation> {
        let mut attempt = 1u32;
        loop {
            match self
                .store
                .put(agent_id, conversation.clone(), expected_revision)
                .await
            {
                Ok(doc) => return Ok(doc),
                Err(e) => match self.retrier.decide(attempt, &e) {
                    RetryDecision::Retry { delay } => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::Stop => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::conversation::Message;
    use crate::testing::MockStore;

    fn local_with_messages(n: usize) -> Conversation {
        let mut conv = Conversation::new_local("agent_a", "user_1", "离线会话");
        for i in 1..=n {
            conv.append(Message::user(format!("消息 {i}")));
        }
        conv
    }

    #[tokio::test]
    async fn test_migrates_messages_in_order_and_removes_local() {
        let store = Arc::new(MockStore::new());
        let cache = Arc::new(InMemoryCache::new());
        cache.put(local_with_messages(3)).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), cache.clone(), RetryPolicy::default());
        let report = reconciler.sync_user("user_1").await.unwrap();
        assert_eq!(report, SyncReport { migrated: 1, failed: 0 });

        // 远端恰好一个会话，消息按原始顺序
        let remote = store.list_by_user("agent_a", "user_1", 0).await.unwrap();
        assert_eq!(remote.len(), 1);
        let contents: Vec<&str> = remote[0].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["消息 1", "消息 2", "消息 3"]);

        // 本地副本已删除
        assert!(cache.list_local_only("user_1").await.unwrap().is_empty());
        assert!(cache.list_all("user_1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_resumes_without_duplicate_shell() {
        // 脚本：probe、shell 创建、第 1 条回放放行，第 2 条回放的
        // 三次尝试全部断网，迫使本轮在 replayed=1 处中断
        let store = Arc::new(MockStore::new().with_passes(3).with_failures([
            StoreError::Unavailable("断网".to_string()),
            StoreError::Unavailable("断网".to_string()),
            StoreError::Unavailable("断网".to_string()),
        ]));
        let cache = Arc::new(InMemoryCache::new());
        let conv = local_with_messages(3);
        let local_id = conv.id.clone();
        cache.put(conv).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), cache.clone(), RetryPolicy::default());
        let report = reconciler.sync_user("user_1").await.unwrap();
        assert_eq!(report, SyncReport { migrated: 0, failed: 1 });

        // 进度已持久化：shell 已建，1 条消息已回放
        let cached = cache.get("user_1", "agent_a", &local_id).await.unwrap().unwrap();
        let SyncState::ShellCreated { remote_id, replayed, .. } = cached.sync_state else {
            panic!("expected ShellCreated, got {:?}", cached.sync_state);
        };
        assert_eq!(replayed, 1);
        assert_eq!(store.count_of("create"), 1);

        // 远端恢复后续传：沿用已建 shell，绝不重复创建
        let report = reconciler.sync_user("user_1").await.unwrap();
        assert_eq!(report, SyncReport { migrated: 1, failed: 0 });
        assert_eq!(store.count_of("create"), 1);

        let remote = store.list_by_user("agent_a", "user_1", 0).await.unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].id, remote_id);
        let contents: Vec<&str> = remote[0].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["消息 1", "消息 2", "消息 3"]);
        assert!(cache.list_local_only("user_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_leftover_is_purged() {
        // 上一轮在标记 Complete 之后、删除副本之前中断：
        // 下一轮必须补删残留，而不是让它永远留在合并视图里
        let store = Arc::new(MockStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let conv = local_with_messages(2);
        let local_id = conv.id.clone();
        cache.put(conv).await.unwrap();
        cache
            .set_sync_state("user_1", "agent_a", &local_id, SyncState::Complete)
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), cache.clone(), RetryPolicy::default());
        reconciler.sync_user("user_1").await.unwrap();

        // 不重建 shell，残留已清理
        assert_eq!(store.count_of("create"), 0);
        assert!(cache.list_all("user_1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_retry_keeps_title_on_network_failure() {
        // 网络类失败的重试不升级清洗，标题原样到达远端
        let store = Arc::new(MockStore::new().with_passes(1).with_failures([
            StoreError::Unavailable("断网".to_string()),
            StoreError::Unavailable("断网".to_string()),
        ]));
        let cache = Arc::new(InMemoryCache::new());
        let mut conv = local_with_messages(1);
        conv.title = "🚀 发射计划".to_string();
        cache.put(conv).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), cache.clone(), RetryPolicy::default());
        let report = reconciler.sync_user("user_1").await.unwrap();
        assert_eq!(report, SyncReport { migrated: 1, failed: 0 });

        let remote = store.list_by_user("agent_a", "user_1", 0).await.unwrap();
        assert_eq!(remote[0].title, "🚀 发射计划");
        assert_eq!(store.count_of("create"), 3);
    }

    #[tokio::test]
    async fn test_unreachable_remote_skips_round() {
        let store = Arc::new(MockStore::new());
        store.fail_always(StoreError::Unavailable("断网".to_string()));
        let cache = Arc::new(InMemoryCache::new());
        cache.put(local_with_messages(1)).await.unwrap();

        let reconciler = Reconciler::new(store, cache.clone(), RetryPolicy::default());
        let err = reconciler.sync_user("user_1").await.unwrap_err();
        assert!(matches!(err, ConvoError::Sync(SyncError::RemoteUnreachable(_))));
        // 本地副本原样保留
        assert_eq!(cache.list_local_only("user_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cache_is_noop() {
        let store = Arc::new(MockStore::new());
        let reconciler = Reconciler::new(store, Arc::new(InMemoryCache::new()), RetryPolicy::default());
        let report = reconciler.sync_user("user_1").await.unwrap();
        assert_eq!(report, SyncReport::default());
    }
}
