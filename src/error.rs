use std::fmt;

/// 会话同步子系统的统一错误类型
#[derive(Debug)]
pub enum ConvoError {
    /// 远端文档存储错误
    Store(StoreError),
    /// 本地缓存错误
    Cache(CacheError),
    /// 同步迁移错误
    Sync(SyncError),
    /// 配置错误
    Config(ConfigError),
    /// 其他错误
    Other(String),
}

/// 远端存储错误，按可恢复性分类
///
/// - `InvalidArgument`：载荷不合法，可通过升级清洗后重试
/// - `Unavailable` / `Conflict`：瞬态，可原样重试
/// - `PermissionDenied` / `NotFound`：终态，永不重试
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// 载荷违反存储约束（超长字符串、非法字符、畸形嵌套值）
    InvalidArgument(String),
    /// 归属校验失败或调用方无访问权限
    PermissionDenied(String),
    /// 目标文档不存在
    NotFound(String),
    /// 网络或服务瞬态故障
    Unavailable(String),
    /// 乐观并发校验失败：写入时 revision 已被他人推进
    Conflict { expected: u64, actual: u64 },
}

impl StoreError {
    /// 瞬态错误类别，读路径据此决定是否回落缓存
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict { .. })
    }
}

/// 本地缓存错误
#[derive(Debug)]
pub enum CacheError {
    /// 文件读写失败
    IoError(String),
    /// 序列化/反序列化失败
    SerializationError(String),
}

/// 同步迁移错误
#[derive(Debug)]
pub enum SyncError {
    /// 消息回放中断，记录已回放条数以便续传
    ReplayInterrupted {
        conversation_id: String,
        replayed: usize,
    },
    /// 远端不可达，本轮同步跳过
    RemoteUnreachable(String),
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 缺少必需的配置项
    MissingField(String),
}

impl ConvoError {
    /// 若底层是存储错误则返回其引用，供重试控制器分类
    pub fn as_store_error(&self) -> Option<&StoreError> {
        match self {
            ConvoError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConvoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvoError::Store(e) => write!(f, "Store Error: {}", e),
            ConvoError::Cache(e) => write!(f, "Cache Error: {}", e),
            ConvoError::Sync(e) => write!(f, "Sync Error: {}", e),
            ConvoError::Config(e) => write!(f, "Config Error: {}", e),
            ConvoError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            StoreError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            StoreError::NotFound(id) => write!(f, "Not found: {}", id),
            StoreError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            StoreError::Conflict { expected, actual } => {
                write!(
                    f,
                    "Revision conflict: expected {}, stored {}",
                    expected, actual
                )
            }
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::IoError(msg) => write!(f, "IO error: {}", msg),
            CacheError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::ReplayInterrupted {
                conversation_id,
                replayed,
            } => write!(
                f,
                "Replay interrupted for '{}' after {} messages",
                conversation_id, replayed
            ),
            SyncError::RemoteUnreachable(msg) => write!(f, "Remote unreachable: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::MissingField(field) => write!(f, "Missing config field: {}", field),
        }
    }
}

impl std::error::Error for ConvoError {}
impl std::error::Error for StoreError {}
impl std::error::Error for CacheError {}
impl std::error::Error for SyncError {}
impl std::error::Error for ConfigError {}

impl From<reqwest::Error> for ConvoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConvoError::Store(StoreError::Unavailable("Request timeout".to_string()))
        } else if err.is_connect() {
            ConvoError::Store(StoreError::Unavailable(format!(
                "Connection failed: {}",
                err
            )))
        } else {
            ConvoError::Store(StoreError::Unavailable(err.to_string()))
        }
    }
}

impl From<serde_yaml::Error> for ConvoError {
    fn from(err: serde_yaml::Error) -> Self {
        ConvoError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<StoreError> for ConvoError {
    fn from(err: StoreError) -> Self {
        ConvoError::Store(err)
    }
}

impl From<CacheError> for ConvoError {
    fn from(err: CacheError) -> Self {
        ConvoError::Cache(err)
    }
}

impl From<SyncError> for ConvoError {
    fn from(err: SyncError) -> Self {
        ConvoError::Sync(err)
    }
}

impl From<ConfigError> for ConvoError {
    fn from(err: ConfigError) -> Self {
        ConvoError::Config(err)
    }
}

/// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, ConvoError>;
