//! 入参清洗
//!
//! 畸形输入是远端写入返回 `InvalidArgument` 的首要来源。本模块把任意调用方
//! 提供的创建/追加参数约束到存储可接受的形态：有界长度、安全字符集、
//! 固定枚举、受限元数据。
//!
//! 纯数据变换，无 I/O 无副作用，可独立测试。清洗强度随重试次数升级
//! （见 [`Strictness::for_attempt`]）：首次尝试只做轻量裁剪，前一次因
//! `InvalidArgument` 失败后逐级收紧。

use crate::conversation::{AgentType, Conversation, CreateConversationParams, MessageRole, NewMessageParams};
use serde_json::{Map, Value};

/// 标题上限（字符数）
pub const MAX_TITLE_LEN: usize = 100;
/// 单条消息内容上限（字符数）
pub const MAX_MESSAGE_LEN: usize = 10_000;
/// 元数据对象键数上限
pub const MAX_META_ENTRIES: usize = 32;
/// 元数据数组长度上限
pub const MAX_META_ARRAY_LEN: usize = 20;
/// 元数据字符串值上限（字符数），超出部分截断
pub const MAX_META_STRING_LEN: usize = 256;
/// 标识符上限（字符数）
pub const MAX_ID_LEN: usize = 64;

/// 标识符缺失/非法时的确定性占位符（宁可降级也不让整个操作失败）
pub const PLACEHOLDER_AGENT: &str = "unknown_agent";
pub const PLACEHOLDER_USER: &str = "unknown_user";
/// 标题清洗后为空时的兜底字面量
pub const DEFAULT_TITLE: &str = "Untitled conversation";

/// 存储路径语法的保留字符，元数据键中出现时重写为 `_`
const RESERVED_KEY_CHARS: &[char] = &['/', '.', '~', '*', '[', ']', '#'];

// ── Strictness ────────────────────────────────────────────────────────────────

/// 清洗强度，随载荷被远端拒收的次数逐级收紧
///
/// 网络类失败的重试不升级强度：只有 `InvalidArgument` 说明载荷本身
/// 有问题，值得清洗得更狠。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strictness {
    /// 尚未被拒：裁剪长度、去控制字符
    Lenient,
    /// 被拒一次：标识符白名单化、剥离非字符码点、元数据限深
    Standard,
    /// 被拒两次及以上：只保留字母数字与基本标点，元数据仅留顶层原始值
    Aggressive,
}

impl Strictness {
    /// 从清洗轮次（1 起计，前一轮被拒后 +1）映射清洗强度
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => Strictness::Lenient,
            2 => Strictness::Standard,
            _ => Strictness::Aggressive,
        }
    }
}

// ── 清洗结果 ─────────────────────────────────────────────────────────────────

/// 经过清洗、可安全送往远端的创建参数
#[derive(Debug, Clone)]
pub struct CleanParams {
    pub agent_id: String,
    pub user_id: String,
    pub title: String,
    pub agent_type: AgentType,
    pub initial_message: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

/// 清洗创建会话入参
pub fn sanitize_create_params(params: &CreateConversationParams, level: Strictness) -> CleanParams {
    let agent_id = sanitize_identifier(&params.agent_id, PLACEHOLDER_AGENT, level);
    let user_id = sanitize_identifier(&params.user_id, PLACEHOLDER_USER, level);

    let initial_message = params
        .initial_message
        .as_deref()
        .map(|m| sanitize_text(m, MAX_MESSAGE_LEN, level))
        .filter(|m| !m.is_empty());

    // 标题优先取显式入参，否则从首条消息推导，再否则兜底字面量
    let raw_title = params
        .title
        .as_deref()
        .map(str::to_string)
        .or_else(|| initial_message.as_deref().and_then(Conversation::derive_title));
    let title = match raw_title {
        Some(t) => {
            let cleaned = sanitize_text(&t, MAX_TITLE_LEN, level);
            if cleaned.is_empty() {
                DEFAULT_TITLE.to_string()
            } else {
                cleaned
            }
        }
        None => DEFAULT_TITLE.to_string(),
    };

    CleanParams {
        agent_id,
        user_id,
        title,
        agent_type: AgentType::coerce(params.agent_type.as_deref()),
        initial_message,
        metadata: params
            .metadata
            .as_ref()
            .and_then(|v| sanitize_metadata(v, level)),
    }
}

/// 清洗追加消息入参，返回可直接入库的 (角色, 内容, 元数据)
pub fn sanitize_message_params(
    params: &NewMessageParams,
    level: Strictness,
) -> (MessageRole, String, Option<Map<String, Value>>) {
    let role = params
        .role
        .as_deref()
        .and_then(MessageRole::parse)
        .unwrap_or(MessageRole::User);
    let content = sanitize_text(&params.content, MAX_MESSAGE_LEN, level);
    let metadata = params
        .metadata
        .as_ref()
        .and_then(|v| sanitize_metadata(v, level));
    (role, content, metadata)
}

// ── 标识符 ────────────────────────────────────────────────────────────────────

/// 标识符必须非空；非法时替换为确定性占位符而非让操作失败
pub fn sanitize_identifier(raw: &str, placeholder: &str, level: Strictness) -> String {
    let trimmed = raw.trim();
    let cleaned: String = if level >= Strictness::Standard {
        trimmed
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .take(MAX_ID_LEN)
            .collect()
    } else {
        trimmed.chars().take(MAX_ID_LEN).collect()
    };
    if cleaned.is_empty() {
        placeholder.to_string()
    } else {
        cleaned
    }
}

// ── 文本 ─────────────────────────────────────────────────────────────────────

/// 有界文本清洗：截断长度，逐级收紧字符集
///
/// Rust 字符串天然不含未配对代理项，这里额外剥离部分存储会拒收的
/// Unicode 非字符码点（U+FDD0..=U+FDEF 及各平面的 U+xFFFE/U+xFFFF）。
pub fn sanitize_text(raw: &str, max_len: usize, level: Strictness) -> String {
    raw.trim()
        .chars()
        .filter(|c| match level {
            Strictness::Lenient => !c.is_control() || *c == '\n',
            Strictness::Standard => !c.is_control() && !is_noncharacter(*c),
            Strictness::Aggressive => {
                c.is_alphanumeric() || c.is_whitespace() || is_basic_punct(*c)
            }
        })
        .take(max_len)
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_noncharacter(c: char) -> bool {
    let v = c as u32;
    (0xFDD0..=0xFDEF).contains(&v) || (v & 0xFFFE) == 0xFFFE
}

fn is_basic_punct(c: char) -> bool {
    ",.!?;:'\"()-_，。！？；：、（）《》".contains(c)
}

// ── 元数据 ────────────────────────────────────────────────────────────────────

/// 元数据只保留原始值和小型数组/对象；过大或不可序列化的值被摘要
/// （字符串化后截断）或丢弃；键重写以避开存储路径保留字符。
///
/// 返回 `None` 表示整个元数据被丢弃（顶层不是对象，或清洗后为空）。
pub fn sanitize_metadata(value: &Value, level: Strictness) -> Option<Map<String, Value>> {
    let max_depth = match level {
        Strictness::Lenient => 3,
        Strictness::Standard => 2,
        Strictness::Aggressive => 1,
    };
    let obj = value.as_object()?;
    let mut out = Map::new();
    for (key, val) in obj.iter().take(MAX_META_ENTRIES) {
        // 顶层对象本身占掉一层深度：Aggressive 下顶层值剩 0 层，
        // 复合值直接摘要
        if let Some(clean) = sanitize_meta_value(val, max_depth - 1) {
            out.insert(sanitize_meta_key(key), clean);
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

fn sanitize_meta_key(key: &str) -> String {
    key.chars()
        .map(|c| if RESERVED_KEY_CHARS.contains(&c) { '_' } else { c })
        .take(MAX_ID_LEN)
        .collect()
}

fn sanitize_meta_value(value: &Value, depth: usize) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => Some(value.clone()),
        Value::String(s) => Some(Value::String(truncate_chars(s, MAX_META_STRING_LEN))),
        Value::Array(arr) => {
            if depth == 0 {
                // 深度耗尽：摘要为截断字符串而非整体丢弃
                return Some(Value::String(summarize(value)));
            }
            let items: Vec<Value> = arr
                .iter()
                .take(MAX_META_ARRAY_LEN)
                .filter_map(|v| sanitize_meta_value(v, depth - 1))
                .collect();
            Some(Value::Array(items))
        }
        Value::Object(obj) => {
            if depth == 0 {
                return Some(Value::String(summarize(value)));
            }
            let mut out = Map::new();
            for (k, v) in obj.iter().take(MAX_META_ENTRIES) {
                if let Some(clean) = sanitize_meta_value(v, depth - 1) {
                    out.insert(sanitize_meta_key(k), clean);
                }
            }
            Some(Value::Object(out))
        }
    }
}

fn summarize(value: &Value) -> String {
    truncate_chars(&value.to_string(), MAX_META_STRING_LEN)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params_with_title(title: &str) -> CreateConversationParams {
        CreateConversationParams {
            agent_id: "agent_a".to_string(),
            user_id: "user_1".to_string(),
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_title_truncated_to_max() {
        let long = "标".repeat(500);
        let clean = sanitize_create_params(&params_with_title(&long), Strictness::Lenient);
        assert_eq!(clean.title.chars().count(), MAX_TITLE_LEN);
    }

    #[test]
    fn test_empty_title_falls_back() {
        let clean = sanitize_create_params(&params_with_title("   \u{0007} "), Strictness::Lenient);
        assert_eq!(clean.title, DEFAULT_TITLE);
    }

    #[test]
    fn test_title_derived_from_initial_message() {
        let params = CreateConversationParams {
            agent_id: "agent_a".to_string(),
            user_id: "user_1".to_string(),
            initial_message: Some("帮我查一下明天的天气".to_string()),
            ..Default::default()
        };
        let clean = sanitize_create_params(&params, Strictness::Lenient);
        assert_eq!(clean.title, "帮我查一下明天的天气");
    }

    #[test]
    fn test_unknown_agent_type_coerced() {
        let params = CreateConversationParams {
            agent_id: "agent_a".to_string(),
            user_id: "user_1".to_string(),
            agent_type: Some("galaxy-brain".to_string()),
            ..Default::default()
        };
        let clean = sanitize_create_params(&params, Strictness::Lenient);
        assert_eq!(clean.agent_type, AgentType::Assistant);
    }

    #[test]
    fn test_invalid_identifiers_get_placeholders() {
        let params = CreateConversationParams {
            agent_id: "   ".to_string(),
            user_id: "".to_string(),
            ..Default::default()
        };
        let clean = sanitize_create_params(&params, Strictness::Standard);
        assert_eq!(clean.agent_id, PLACEHOLDER_AGENT);
        assert_eq!(clean.user_id, PLACEHOLDER_USER);
    }

    #[test]
    fn test_identifier_whitelisted_at_standard() {
        let id = sanitize_identifier("agent/../etc!", "fallback", Strictness::Standard);
        assert_eq!(id, "agentetc");
    }

    #[test]
    fn test_metadata_array_truncated() {
        let huge: Vec<i32> = (0..10_000).collect();
        let meta = sanitize_metadata(&json!({ "tags": huge }), Strictness::Lenient).unwrap();
        assert_eq!(meta["tags"].as_array().unwrap().len(), MAX_META_ARRAY_LEN);
    }

    #[test]
    fn test_metadata_reserved_key_chars_rewritten() {
        let meta =
            sanitize_metadata(&json!({ "a/b.c": 1 }), Strictness::Lenient).unwrap();
        assert!(meta.contains_key("a_b_c"));
    }

    #[test]
    fn test_metadata_deep_object_summarized_at_aggressive() {
        let meta = sanitize_metadata(
            &json!({ "nested": { "x": { "y": 1 } } }),
            Strictness::Aggressive,
        )
        .unwrap();
        assert!(meta["nested"].is_string());
    }

    #[test]
    fn test_non_object_metadata_dropped() {
        assert!(sanitize_metadata(&json!("just a string"), Strictness::Lenient).is_none());
        assert!(sanitize_metadata(&json!({}), Strictness::Lenient).is_none());
    }

    #[test]
    fn test_noncharacter_stripped_at_standard() {
        let dirty = format!("正常{}文本", '\u{FDD0}');
        let clean = sanitize_text(&dirty, MAX_MESSAGE_LEN, Strictness::Standard);
        assert_eq!(clean, "正常文本");
    }

    #[test]
    fn test_unknown_role_coerced_to_user() {
        let params = NewMessageParams {
            conversation_id: "conv_1".to_string(),
            content: "hello".to_string(),
            role: Some("overlord".to_string()),
            metadata: None,
        };
        let (role, content, _) = sanitize_message_params(&params, Strictness::Lenient);
        assert_eq!(role, MessageRole::User);
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_strictness_escalation_mapping() {
        assert_eq!(Strictness::for_attempt(1), Strictness::Lenient);
        assert_eq!(Strictness::for_attempt(2), Strictness::Standard);
        assert_eq!(Strictness::for_attempt(3), Strictness::Aggressive);
        assert_eq!(Strictness::for_attempt(7), Strictness::Aggressive);
    }
}
