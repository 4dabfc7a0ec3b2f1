//! 缓存层基础组件
//!
//! - `lru`: 通用 LRU 缓存（容量限制）
//! - `key`: 缓存键派生
//! - `sql_cache`: 表名提取与可缓存性判断（带记忆化）

pub mod key;
pub mod lru;
pub mod sql_cache;

pub use key::{derive_key, normalize_sql, KEY_LEN};
pub use lru::LruCache;
pub use sql_cache::{extract_tables, is_cacheable, EligibilityMemo};
