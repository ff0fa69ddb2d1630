//! 可脚本化的远端存储替身
//!
//! 每次远端调用前先消费脚本队列：队首是预设失败则返回该错误，
//! 否则委托给内部的 [`InMemoryStore`]。队列耗尽后全部放行。

use crate::conversation::Conversation;
use crate::error::{Result, StoreError};
use crate::store::{ConversationStore, InMemoryStore};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// 远端存储 Mock
///
/// ```rust
/// use convo_sync::testing::MockStore;
/// use convo_sync::error::StoreError;
/// use convo_sync::store::ConversationStore;
/// use convo_sync::conversation::Conversation;
///
/// # #[tokio::main]
/// # async fn main() {
/// let store = MockStore::new()
///     .with_failure(StoreError::Unavailable("抖动".to_string()));
///
/// // 第一次调用失败，第二次放行
/// let conv = Conversation::new("agent_a", "user_1", "标题");
/// assert!(store.create("agent_a", conv.clone()).await.is_err());
/// assert!(store.create("agent_a", conv).await.is_ok());
/// assert_eq!(store.call_count(), 2);
/// # }
/// ```
pub struct MockStore {
    inner: InMemoryStore,
    /// 按序消费的脚本（`Some` = 注入失败，`None` = 放行）
    script: Arc<Mutex<VecDeque<Option<StoreError>>>>,
    /// 设置后所有调用恒定失败（优先于脚本队列）
    permanent_failure: Arc<Mutex<Option<StoreError>>>,
    /// 每次调用的操作名，按序记录
    calls: Arc<Mutex<Vec<String>>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            permanent_failure: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 追加一次预设失败（下一次未被消费的调用返回它）
    pub fn with_failure(self, err: StoreError) -> Self {
        self.script.lock().unwrap().push_back(Some(err));
        self
    }

    /// 批量追加预设失败
    pub fn with_failures(self, errs: impl IntoIterator<Item = StoreError>) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            for err in errs {
                script.push_back(Some(err));
            }
        }
        self
    }

    /// 追加 `n` 次放行（用于"前几次成功、之后失败"的脚本）
    pub fn with_passes(self, n: usize) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            for _ in 0..n {
                script.push_back(None);
            }
        }
        self
    }

    /// 运行中追加一次预设失败
    pub fn push_failure(&self, err: StoreError) {
        self.script.lock().unwrap().push_back(Some(err));
    }

    /// 运行中追加一次放行
    pub fn push_pass(&self) {
        self.script.lock().unwrap().push_back(None);
    }

    /// 之后的所有调用恒定失败，直到 [`clear_failures`](Self::clear_failures)
    pub fn fail_always(&self, err: StoreError) {
        *self.permanent_failure.lock().unwrap() = Some(err);
    }

    /// 清除恒定失败与剩余脚本，恢复放行
    pub fn clear_failures(&self) {
        *self.permanent_failure.lock().unwrap() = None;
        self.script.lock().unwrap().clear();
    }

    /// 已发生的远端调用总数
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// 指定操作的调用次数
    pub fn count_of(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    /// 按序记录的操作名快照
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// 记录调用并消费脚本；返回本次应注入的失败
    fn intercept(&self, op: &str) -> Option<StoreError> {
        self.calls.lock().unwrap().push(op.to_string());
        if let Some(err) = self.permanent_failure.lock().unwrap().as_ref() {
            return Some(err.clone());
        }
        self.script.lock().unwrap().pop_front().flatten()
    }
}

#[async_trait]
impl ConversationStore for MockStore {
    async fn create(&self, agent_id: &str, conversation: Conversation) -> Result<Conversation> {
        if let Some(err) = self.intercept("create") {
            return Err(err.into());
        }
        self.inner.create(agent_id, conversation).await
    }

    async fn get(&self, agent_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
        if let Some(err) = self.intercept("get") {
            return Err(err.into());
        }
        self.inner.get(agent_id, conversation_id).await
    }

    async fn put(
        &self,
        agent_id: &str,
        conversation: Conversation,
        expected_revision: u64,
    ) -> Result<Conversation> {
        if let Some(err) = self.intercept("put") {
            return Err(err.into());
        }
        self.inner.put(agent_id, conversation, expected_revision).await
    }

    async fn list_by_user(
        &self,
        agent_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        if let Some(err) = self.intercept("list_by_user") {
            return Err(err.into());
        }
        self.inner.list_by_user(agent_id, user_id, limit).await
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        if let Some(err) = self.intercept("list_namespaces") {
            return Err(err.into());
        }
        self.inner.list_namespaces().await
    }
}
