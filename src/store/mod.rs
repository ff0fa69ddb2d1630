//! 远端会话存储抽象
//!
//! [`ConversationStore`] 是对层级式文档存储的统一接口：文档按
//! `{命名空间集合}/{agent_id}/{子集合}/{conversation_id}` 两级寻址，
//! 所有操作都同时需要 `agent_id` 和 `conversation_id`。
//!
//! ## 内置实现
//!
//! - [`InMemoryStore`]：进程内存，适合测试和内嵌场景
//! - [`RemoteStore`]：HTTP 文档存储客户端
//!
//! 存储本身不感知用户/角色，归属校验（`user_id` 比对）由调用方在
//! 读取之后执行。

pub mod memory;
pub mod remote;

pub use memory::InMemoryStore;
pub use remote::RemoteStore;

use crate::conversation::Conversation;
use crate::error::Result;
use async_trait::async_trait;

/// 层级式文档存储的会话读写契约
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 在 `agent_id` 命名空间下写入新文档，由存储分配 id 和初始 revision。
    ///
    /// 载荷违反存储约束时返回 `InvalidArgument`，无访问权限时返回
    /// `PermissionDenied`，瞬态故障返回 `Unavailable`。
    async fn create(&self, agent_id: &str, conversation: Conversation) -> Result<Conversation>;

    /// 按主地址读取；不存在返回 `Ok(None)`。归属校验由调用方完成。
    async fn get(&self, agent_id: &str, conversation_id: &str) -> Result<Option<Conversation>>;

    /// 整文档替换，带乐观并发校验：存储中的 revision 与
    /// `expected_revision` 不一致时返回 `Conflict`，调用方应重读后重放。
    /// 成功时返回 revision 已推进的新文档。
    async fn put(
        &self,
        agent_id: &str,
        conversation: Conversation,
        expected_revision: u64,
    ) -> Result<Conversation>;

    /// 列出命名空间下属于 `user_id` 的会话，按 `updated_at` 降序。
    /// `limit = 0` 表示不限制。
    async fn list_by_user(
        &self,
        agent_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>>;

    /// 枚举已知命名空间（仅供跨命名空间解析器使用）
    async fn list_namespaces(&self) -> Result<Vec<String>>;
}
