// 服务层模块
//
// - detector: 表变更检测（时钟偏差校正、三种策略）
// - table_times: 持久化的表时间戳缓存
// - stats: 统计、事务日志与淘汰
// - query_cache: 查询编排
// - registry: 按连接管理缓存实例
// - maintenance: 签名比对与重建

pub mod detector;
pub mod maintenance;
pub mod query_cache;
pub mod registry;
pub mod stats;
pub mod table_times;

// 重新导出服务
pub use detector::{ChangeDetector, DetectionPass, Staleness};
pub use maintenance::{MaintenanceReport, MaintenanceSignature};
pub use query_cache::{
    CacheState, CachedQuery, EntryReport, QueryCache, QueryRequest, QueryResponse,
};
pub use registry::CacheRegistry;
pub use stats::{
    importance, AggregateStats, EvictionReport, Outcome, SlowestCase, StatsManager,
    TransactionLog, TxRecord,
};
pub use table_times::TableTimestampCache;
