// lib.rs - 透明 SQL 结果集缓存

pub mod connectors; // 数据库连接器与方言适配
pub mod core; // 日志等基础设施
pub mod data; // 键、编码、锁、双后端存储
pub mod models;
pub mod services; // 变更检测、统计淘汰、查询编排、维护
pub mod utils;

pub use models::*;

pub use connectors::{
    ChangeTimes, DbConnector, DriverError, DriverErrorKind, Engine, MsSqlConnector,
    MySqlConnector, SqlDriver, SqliteConnector,
};
pub use data::cache::{derive_key, extract_tables, is_cacheable};
pub use data::lock::{FileLockProvider, LocalLockProvider, LockGuard, LockProvider};
pub use data::store::{CacheStore, StoredEntry};
pub use data::{CacheError, Result, StatementFailure};
pub use services::{
    maintenance, CacheRegistry, CacheState, CachedQuery, ChangeDetector, QueryCache,
    QueryRequest, QueryResponse, Staleness, StatsManager,
};

pub use crate::core::{init_logger, update_log_level};
