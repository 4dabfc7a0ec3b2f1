pub mod config;
pub mod entry;
pub mod value;

pub use config::{CacheSettings, LockMode, LogConfig, LogFormat, LogLevel, LogOutput, StoreMode};
pub use entry::{AccessStats, CacheEntryMeta, DbStats, PayloadLocation};
pub use value::{ResultSet, Value};
