//! 会话服务门面
//!
//! 系统其余部分（聊天视图、工作流面板）只调用这里的六个操作，
//! 不直接接触清洗器、重试控制器或缓存：
//!
//! | 操作 | 语义 |
//! |------|------|
//! | [`create_conversation_with_fallback`] | 远端创建，重试耗尽后降级为本地会话 |
//! | [`add_message_with_fallback`] | 远端追加（CAS 读-改-写），耗尽后降级缓存 |
//! | [`get_conversation`] | 按主地址读取 + 归属校验，远端不可用时回落缓存 |
//! | [`find_conversation_by_id`] | 仅凭 id 跨命名空间定位 |
//! | [`list_conversations`] | 远端 + 缓存合并视图，同 id 以 `updated_at` 新者胜 |
//! | [`sync_local_conversations`] | 触发一轮本地会话迁移 |
//!
//! 控制流：调用方 → 清洗 → 重试 → 远端存储；耗尽 → 本地缓存；
//! 之后由迁移器把缓存搬回远端。降级只打 warn 日志，不向终端用户
//! 抛硬错误；用户可见的失败仅发生在远端和本地同时写不进去时。
//!
//! [`create_conversation_with_fallback`]: ConversationService::create_conversation_with_fallback
//! [`add_message_with_fallback`]: ConversationService::add_message_with_fallback
//! [`get_conversation`]: ConversationService::get_conversation
//! [`find_conversation_by_id`]: ConversationService::find_conversation_by_id
//! [`list_conversations`]: ConversationService::list_conversations
//! [`sync_local_conversations`]: ConversationService::sync_local_conversations

use crate::cache::LocalCache;
use crate::conversation::{
    Conversation, CreateConversationParams, Message, NewMessageParams, LOCAL_ID_PREFIX,
};
use crate::error::{ConvoError, Result, StoreError};
use crate::resolver::ConversationResolver;
use crate::retry::{Retrier, RetryDecision, RetryPolicy};
use crate::sanitize::{self, CleanParams, Strictness};
use crate::store::ConversationStore;
use crate::sync::{Reconciler, SyncReport};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    cache: Arc<dyn LocalCache>,
    resolver: ConversationResolver,
    retrier: Retrier,
    reconciler: Reconciler,
}

impl ConversationService {
    pub fn new(store: Arc<dyn ConversationStore>, cache: Arc<dyn LocalCache>) -> Self {
        Self::with_policy(store, cache, RetryPolicy::default())
    }

    pub fn with_policy(
        store: Arc<dyn ConversationStore>,
        cache: Arc<dyn LocalCache>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            resolver: ConversationResolver::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), cache.clone(), policy.clone()),
            retrier: Retrier::new(policy),
            store,
            cache,
        }
    }

    // ── 创建 ─────────────────────────────────────────────────────────────────

    /// 创建会话；远端重试耗尽后降级为本地（`local_` 前缀 id）会话
    ///
    /// `PermissionDenied` 是终态，直接向上传播，不降级。
    pub async fn create_conversation_with_fallback(
        &self,
        params: &CreateConversationParams,
    ) -> Result<Conversation> {
        let mut attempt = 1u32;
        // 清洗强度只跟被拒次数走：网络类重试必须原样重发同一载荷
        let mut rejected = 0u32;
        let last_err = loop {
            let clean =
                sanitize::sanitize_create_params(params, Strictness::for_attempt(rejected + 1));
            let conversation = build_conversation(&clean, false);
            match self.store.create(&clean.agent_id, conversation).await {
                Ok(created) => {
                    self.resolver.record(&created.id, &created.agent_id).await;
                    info!(
                        conversation_id = %created.id,
                        agent_id = %created.agent_id,
                        "💬 会话已创建"
                    );
                    return Ok(created);
                }
                Err(e) => {
                    if matches!(e.as_store_error(), Some(StoreError::InvalidArgument(_))) {
                        rejected += 1;
                    }
                    match self.retrier.decide(attempt, &e) {
                        RetryDecision::Retry { delay } => {
                            debug!(
                                attempt = attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "远端创建失败，退避重试"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::Stop => break e,
                    }
                }
            }
        };

        if matches!(last_err.as_store_error(), Some(StoreError::PermissionDenied(_))) {
            return Err(last_err);
        }

        // 降级：本地会话，待远端恢复后由迁移器搬回
        warn!(error = %last_err, "远端创建重试耗尽，降级为本地会话");
        let clean = sanitize::sanitize_create_params(params, Strictness::Lenient);
        let conversation = build_conversation(&clean, true);
        if let Err(cache_err) = self.cache.put(conversation.clone()).await {
            // 远端和本地同时失败才把错误暴露给调用方
            error!(error = %cache_err, "本地缓存写入也失败");
            return Err(last_err);
        }
        Ok(conversation)
    }

    // ── 追加消息 ─────────────────────────────────────────────────────────────

    /// 向会话追加消息；远端重试耗尽后把副本留在缓存
    ///
    /// 远端路径是完整的读-改-写：读取全量消息列表、追加、带 revision
    /// 写回。`Conflict` 说明有并发写入者，重读后重放。
    pub async fn add_message_with_fallback(
        &self,
        user_id: &str,
        agent_id: &str,
        params: &NewMessageParams,
    ) -> Result<Message> {
        let (role, content, metadata) =
            sanitize::sanitize_message_params(params, Strictness::Lenient);
        let mut message = Message::new(role, content);
        message.metadata = metadata;
        let conversation_id = &params.conversation_id;

        // 本地会话只存在于缓存
        if conversation_id.starts_with(LOCAL_ID_PREFIX) {
            let found = self
                .cache
                .append_message(user_id, agent_id, conversation_id, message.clone())
                .await?;
            if !found {
                return Err(StoreError::NotFound(conversation_id.clone()).into());
            }
            return Ok(message);
        }

        let mut attempt = 1u32;
        let mut last_known: Option<Conversation> = None;
        let last_err = loop {
            let result = self
                .append_remote(user_id, agent_id, conversation_id, &message, &mut last_known)
                .await;
            match result {
                Ok(()) => {
                    self.resolver.record(conversation_id, agent_id).await;
                    return Ok(message);
                }
                Err(e) => match self.retrier.decide(attempt, &e) {
                    RetryDecision::Retry { delay } => {
                        debug!(attempt = attempt, error = %e, "远端追加失败，退避重试");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::Stop => break e,
                },
            }
        };

        // 归属/不存在类错误必须浮出，不做降级
        if matches!(
            last_err.as_store_error(),
            Some(StoreError::PermissionDenied(_) | StoreError::NotFound(_))
        ) {
            return Err(last_err);
        }

        warn!(
            conversation_id = %conversation_id,
            error = %last_err,
            "远端追加重试耗尽，消息留在本地缓存"
        );
        let cached = self
            .cache
            .append_message(user_id, agent_id, conversation_id, message.clone())
            .await;
        match cached {
            Ok(true) => Ok(message),
            // 缓存尚无该会话的副本：以最后一次成功读取的远端快照落底
            Ok(false) => {
                if let Some(mut conv) = last_known {
                    conv.append(message.clone());
                    if let Err(cache_err) = self.cache.put(conv).await {
                        error!(error = %cache_err, "本地缓存写入也失败");
                        return Err(last_err);
                    }
                    Ok(message)
                } else {
                    Err(last_err)
                }
            }
            Err(cache_err) => {
                error!(error = %cache_err, "本地缓存写入也失败");
                Err(last_err)
            }
        }
    }

    /// 单次远端读-改-写（归属校验 → 追加 → CAS 写回）
    async fn append_remote(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
        message: &Message,
        last_known: &mut Option<Conversation>,
    ) -> Result<()> {
        let conversation = self
            .store
            .get(agent_id, conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        let conversation = check_owner(conversation, user_id)?;
        *last_known = Some(conversation.clone());

        let expected = conversation.revision;
        let mut next = conversation;
        next.append(message.clone());
        self.store.put(agent_id, next, expected).await?;
        Ok(())
    }

    // ── 读取 ─────────────────────────────────────────────────────────────────

    /// 按主地址读取会话并校验归属；远端不可用或未命中时回落缓存
    pub async fn get_conversation(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation> {
        if conversation_id.starts_with(LOCAL_ID_PREFIX) {
            return self.get_cached(user_id, agent_id, conversation_id).await;
        }

        match self.store.get(agent_id, conversation_id).await {
            Ok(Some(conversation)) => {
                let conversation = check_owner(conversation, user_id)?;
                self.resolver.record(conversation_id, agent_id).await;
                Ok(conversation)
            }
            Ok(None) => self.get_cached(user_id, agent_id, conversation_id).await,
            Err(e) => {
                if e.as_store_error().is_some_and(StoreError::is_transient) {
                    warn!(conversation_id = %conversation_id, error = %e, "远端读取失败，回落缓存");
                    self.get_cached(user_id, agent_id, conversation_id).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn get_cached(
        &self,
        user_id: &str,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation> {
        let cached = self
            .cache
            .get(user_id, agent_id, conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        check_owner(cached.conversation, user_id)
    }

    /// 仅凭 id 定位会话：先查缓存中的本地会话，再走跨命名空间解析
    pub async fn find_conversation_by_id(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation> {
        if conversation_id.starts_with(LOCAL_ID_PREFIX) {
            let local = self
                .cache
                .list_all(user_id)
                .await?
                .into_iter()
                .find(|c| c.id == conversation_id);
            return local
                .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()).into())
                .and_then(|c| check_owner(c, user_id));
        }
        self.resolver.resolve(user_id, conversation_id).await
    }

    /// 用户的全量会话视图：远端各命名空间 + 本地缓存合并
    ///
    /// 同一 id 同时存在远端和缓存副本时，按 `updated_at` 新者胜。
    /// 远端不可用时退化为纯缓存视图（记 warn，不报错）。
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let mut merged: Vec<Conversation> = Vec::new();

        match self.list_remote(user_id).await {
            Ok(remote) => merged.extend(remote),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "远端列表不可用，退化为缓存视图");
            }
        }

        for cached in self.cache.list_all(user_id).await? {
            match merged.iter_mut().find(|c| c.id == cached.id) {
                Some(existing) => {
                    if cached.updated_at > existing.updated_at {
                        *existing = cached;
                    }
                }
                None => merged.push(cached),
            }
        }

        merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(merged)
    }

    async fn list_remote(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let namespaces = self.store.list_namespaces().await?;
        let mut result = Vec::new();
        for agent_id in namespaces {
            result.extend(self.store.list_by_user(&agent_id, user_id, 0).await?);
        }
        Ok(result)
    }

    // ── 同步 ─────────────────────────────────────────────────────────────────

    /// 触发一轮本地会话迁移（通常在可达性恢复后调用）
    pub async fn sync_local_conversations(&self, user_id: &str) -> Result<SyncReport> {
        self.reconciler.sync_user(user_id).await
    }
}

fn build_conversation(clean: &CleanParams, local: bool) -> Conversation {
    let mut conversation = if local {
        Conversation::new_local(&clean.agent_id, &clean.user_id, &clean.title)
    } else {
        Conversation::new(&clean.agent_id, &clean.user_id, &clean.title)
    };
    conversation.agent_type = clean.agent_type;
    conversation.metadata = clean.metadata.clone();
    if let Some(content) = &clean.initial_message {
        conversation.append(Message::user(content.clone()));
    }
    conversation
}

fn check_owner(conversation: Conversation, user_id: &str) -> Result<Conversation> {
    if conversation.user_id != user_id {
        return Err(ConvoError::Store(StoreError::PermissionDenied(format!(
            "conversation '{}' belongs to another user",
            conversation.id
        ))));
    }
    Ok(conversation)
}
