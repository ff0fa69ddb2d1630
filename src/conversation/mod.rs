//! 会话数据模型
//!
//! 定义 [`Conversation`] / [`Message`] 两个核心值类型及其身份规则：
//!
//! - 远端主地址由 `(agent_id, id)` 二元组构成，单独的 `id` 不足以定位会话
//! - 每个会话归属且仅归属一个 `user_id`，所有读写路径必须校验归属
//! - `messages` 只追加、永不重排，`updated_at` 在每次追加时严格递增
//! - 离线创建的会话使用 `local_` 前缀 id，同步器据此识别待迁移副本

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// 离线创建会话的 id 前缀，同步器据此识别待迁移副本
pub const LOCAL_ID_PREFIX: &str = "local_";

// ── MessageRole ───────────────────────────────────────────────────────────────

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Function,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Function => "function",
        }
    }

    /// 解析角色字符串，未知值返回 `None`（清洗层负责兜底到 `User`）
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            "function" => Some(MessageRole::Function),
            _ => None,
        }
    }
}

// ── AgentType ─────────────────────────────────────────────────────────────────

/// Agent 类别（固定枚举集），未知值一律折算为 [`AgentType::Assistant`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    #[default]
    Assistant,
    Workflow,
    Research,
    Support,
    Custom,
}

impl AgentType {
    /// 宽松解析：未知/缺失类别折算为默认值而非报错
    pub fn coerce(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("workflow") => AgentType::Workflow,
            Some("research") => AgentType::Research,
            Some("support") => AgentType::Support,
            Some("custom") => AgentType::Custom,
            _ => AgentType::Assistant,
        }
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// 会话内的单条消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 会话内唯一（UUID v4）
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Unix 毫秒，同一会话内单调不减（追加时由 [`Conversation::append`] 校正）
    pub timestamp: u64,
    /// 有界的键值附加信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: now_millis(),
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ── Conversation ──────────────────────────────────────────────────────────────

/// 多轮会话文档
///
/// 生命周期：创建（可携带首条消息）→ 反复追加消息 → 可选改标题/批注 →
/// 本子系统内永不硬删除；离线副本在成功迁移到远端后删除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// 远端创建时由存储分配；离线创建时为 `local_` 前缀 id
    pub id: String,
    /// 所属命名空间
    pub agent_id: String,
    /// 归属用户
    pub user_id: String,
    pub title: String,
    pub agent_type: AgentType,
    /// 只追加的有序消息序列
    pub messages: Vec<Message>,
    pub created_at: u64,
    pub updated_at: u64,
    /// 乐观并发令牌：每次成功写入远端后 +1，写入时比对
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Conversation {
    /// 创建一个尚未分配远端 id 的会话骨架（id 留空，由存储在 create 时分配）
    pub fn new(agent_id: impl Into<String>, user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: String::new(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            title: title.into(),
            agent_type: AgentType::default(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
            metadata: None,
        }
    }

    /// 创建离线（仅本地）会话，id 带 [`LOCAL_ID_PREFIX`] 标记
    pub fn new_local(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let mut conv = Self::new(agent_id, user_id, title);
        conv.id = format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4());
        conv
    }

    /// 该会话是否为离线创建、尚未迁移到远端的本地副本
    pub fn is_local_only(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// 追加一条消息，维护两条不变式：
    ///
    /// - 消息 `timestamp` 单调不减（落后于上一条时钳制到上一条）
    /// - `updated_at` 严格递增（时钟未动也至少 +1）
    pub fn append(&mut self, mut message: Message) {
        if let Some(last) = self.messages.last()
            && message.timestamp < last.timestamp
        {
            message.timestamp = last.timestamp;
        }
        self.updated_at = now_millis().max(self.updated_at + 1);
        self.messages.push(message);
    }

    /// 从首条消息推导标题（取前 60 个字符），无消息时返回 `None`
    pub fn derive_title(first_message: &str) -> Option<String> {
        let trimmed = first_message.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(trimmed.chars().take(60).collect())
    }
}

// ── 调用方输入参数 ────────────────────────────────────────────────────────────

/// 创建会话的原始入参，来自任意调用方，未经清洗
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConversationParams {
    pub agent_id: String,
    pub user_id: String,
    pub title: Option<String>,
    /// 类别字符串，清洗层折算到 [`AgentType`]
    pub agent_type: Option<String>,
    pub initial_message: Option<String>,
    pub metadata: Option<Value>,
}

/// 追加消息的原始入参
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessageParams {
    pub conversation_id: String,
    pub content: String,
    /// 角色字符串，未知值折算为 `user`
    pub role: Option<String>,
    pub metadata: Option<Value>,
}

/// 当前 Unix 毫秒时间戳
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
