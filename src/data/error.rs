//! 统一错误类型定义
//!
//! 使用 `thiserror` 定义缓存引擎的所有错误类型，并提供与 `anyhow` 的兼容层。
//!
//! 注意：语句不可缓存（eligibility）不是错误，见 `QueryResponse::NotCacheable`。

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// 语句执行失败时携带的上下文
///
/// 包含足够的信息（语句、表名、引擎、底层消息）以便无需重跑即可定位问题。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementFailure {
    /// 出错的 SQL 语句
    pub sql: String,
    /// 涉及的表（已知时）
    pub table: Option<String>,
    /// 数据库引擎标识
    pub engine: String,
    /// 底层驱动返回的消息
    pub message: String,
    /// 是否为权限不足
    pub permission_denied: bool,
}

impl fmt::Display for StatementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.permission_denied {
            write!(f, "[{}] 权限不足", self.engine)?;
        } else {
            write!(f, "[{}] {}", self.engine, self.message)?;
        }
        if let Some(table) = &self.table {
            write!(f, " (表: {table})")?;
        }
        write!(f, " | SQL: {}", self.sql)?;
        if self.permission_denied {
            write!(f, " | {}", self.message)?;
        }
        Ok(())
    }
}

/// 缓存引擎的统一错误类型
#[derive(Error, Debug)]
pub enum CacheError {
    /// 无法建立或复用数据库连接
    #[error("数据库连接错误 [{engine}]: {message}")]
    Connection { engine: String, message: String },

    /// 读语句执行失败
    #[error("读取失败: {0}")]
    TableRead(StatementFailure),

    /// 写语句执行失败
    #[error("写入失败: {0}")]
    TableWrite(StatementFailure),

    /// 文件 I/O 错误
    #[error("文件 I/O 错误: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 负载编码/解码错误
    #[error("序列化错误: {0}")]
    Serialization(String),

    /// JSON 序列化/反序列化错误
    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 本地数据库错误（未绑定具体语句）
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// 锁服务不可恢复的故障
    #[error("锁错误: {resource}: {message}")]
    Lock { resource: String, message: String },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 资源未找到
    #[error("未找到资源: {0}")]
    NotFound(String),
}

/// 便于与现有代码集成的类型别名
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// 从 `std::io::Error` 和路径创建 I/O 错误
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// 创建锁错误
    pub fn lock(resource: impl Into<String>, message: impl ToString) -> Self {
        Self::Lock {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// 是否为权限不足导致的语句失败
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::TableRead(f) | Self::TableWrite(f) => f.permission_denied,
            _ => false,
        }
    }
}
