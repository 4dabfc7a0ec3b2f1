//! 缓存数据层
//!
//! # 模块组织
//!
//! - `error`: 统一错误类型定义
//! - `cache`: 键派生、表名提取、可缓存性记忆化
//! - `codec`: 负载编码管线（bincode + gzip + base64）
//! - `lock`: 命名锁服务
//! - `store`: 双后端存储（关系表行 / 文件）
//!
//! # 使用示例
//!
//! ```rust
//! use crate::data::store::CacheStore;
//!
//! let store = CacheStore::new(connector, locks, &settings, "main")?;
//! store.ensure_schema()?;
//! if let Some(entry) = store.fetch(&key)? {
//!     // ...
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod error;
pub mod lock;
pub mod store;

pub use error::{CacheError, Result, StatementFailure};
pub use lock::{with_lock, FileLockProvider, LocalLockProvider, LockGuard, LockProvider};
pub use store::{CacheStore, StoredEntry};
