//! 数据库连接器
//!
//! `DbConnector` 是缓存核心与各数据库引擎之间的能力契约：
//! 读/写执行、字面量转义、表变更时间、数据库时钟、表存在性与缓存表结构。
//!
//! 不同引擎的变更检测策略差异只体现在 `table_change_times` 的实现上：
//! - `sqlite`: 触发器维护的实时时间戳（可关闭，关闭后恒为 Unknown）
//! - `mysql`: `information_schema.TABLES.UPDATE_TIME`（实时）
//! - `mssql`: `sys.dm_db_index_usage_stats`（服务重启后清零，需持久化回退）

pub mod mssql;
pub mod mysql;
pub mod sqlite;

pub use mssql::MsSqlConnector;
pub use mysql::MySqlConnector;
pub use sqlite::SqliteConnector;

use crate::data::cache::extract_tables;
use crate::data::{CacheError, Result, StatementFailure};
use crate::models::ResultSet;
use std::collections::HashMap;
use std::fmt;

/// 支持的数据库引擎
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Sqlite,
    MySql,
    MsSql,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::MySql => "mysql",
            Engine::MsSql => "mssql",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 引擎报告的表变更时间（数据库时钟，未做偏差校正）
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeTimes {
    /// 实时、单调更新的时间戳
    Live(HashMap<String, i64>),
    /// 服务重启后清零的统计
    ///
    /// `None` 表示自 `server_start` 以来该表没有更新记录。
    Volatile {
        server_start: i64,
        last_updates: HashMap<String, Option<i64>>,
    },
    /// 无法可靠回答，调用方必须视所有表为已变更
    Unknown,
}

/// 数据库连接器能力契约
pub trait DbConnector: Send + Sync {
    /// 引擎标识
    fn engine(&self) -> Engine;

    /// 执行读语句
    fn execute_read(&self, sql: &str) -> Result<ResultSet>;

    /// 执行写语句/DDL，返回受影响行数
    fn execute_write(&self, sql: &str) -> Result<usize>;

    /// 文本转为 SQL 字面量（含引号）
    fn escape_text(&self, text: &str) -> String;

    /// 二进制转为 SQL 字面量
    fn escape_binary(&self, bytes: &[u8]) -> String;

    /// 标识符加引号
    fn quote_identifier(&self, name: &str) -> String;

    /// 查询表的最后变更时间
    fn table_change_times(&self, tables: &[String]) -> Result<ChangeTimes>;

    /// 数据库报告的当前 Unix 时间（秒）
    fn db_unix_time(&self) -> Result<i64>;

    /// 时钟偏差 = 本地时间 − 数据库时间
    fn clock_offset_seconds(&self, local_now: i64) -> Result<i64> {
        Ok(local_now - self.db_unix_time()?)
    }

    /// 表是否存在
    fn table_exists(&self, name: &str) -> Result<bool>;

    /// 元数据表的列类型
    fn column_types(&self) -> ColumnTypes;

    /// 元数据表建表语句
    fn cache_schema(&self, table: &str) -> Vec<String> {
        vec![metadata_table_ddl(&self.quote_identifier(table), &self.column_types())]
    }

    /// 创建元数据表（已存在时不做任何事）
    fn create_cache_schema(&self, table: &str) -> Result<()> {
        if self.table_exists(table)? {
            return Ok(());
        }
        for statement in self.cache_schema(table) {
            self.execute_write(&statement)?;
        }
        tracing::info!(engine = %self.engine(), table = %table, "已创建缓存元数据表");
        Ok(())
    }

    /// 删除元数据表
    fn drop_cache_schema(&self, table: &str) -> Result<()> {
        if self.table_exists(table)? {
            self.execute_write(&format!("DROP TABLE {}", self.quote_identifier(table)))?;
        }
        Ok(())
    }
}

/// 元数据表各列的方言类型
#[derive(Debug, Clone, Copy)]
pub struct ColumnTypes {
    pub key: &'static str,
    pub text: &'static str,
    pub large_text: &'static str,
    pub integer: &'static str,
    pub real: &'static str,
    pub short_text: &'static str,
}

/// 元数据表的列（读取顺序固定）
pub const METADATA_COLUMNS: [&str; 13] = [
    "hash",
    "script",
    "description",
    "tables_csv",
    "create_time",
    "access_time",
    "impressions",
    "avg_cost",
    "cache_create_time",
    "cache_access_time",
    "cache_impressions",
    "location",
    "resultset",
];

/// 生成元数据表建表语句
pub fn metadata_table_ddl(quoted_table: &str, types: &ColumnTypes) -> String {
    format!(
        "CREATE TABLE {quoted_table} (\
hash {key} NOT NULL PRIMARY KEY, \
script {large} NOT NULL, \
description {text} NOT NULL, \
tables_csv {text} NOT NULL, \
create_time {int} NOT NULL, \
access_time {int} NOT NULL, \
impressions {int} NOT NULL, \
avg_cost {real} NOT NULL, \
cache_create_time {int} NOT NULL, \
cache_access_time {int} NOT NULL, \
cache_impressions {int} NOT NULL, \
location {short} NOT NULL, \
resultset {large} NULL)",
        key = types.key,
        large = types.large_text,
        text = types.text,
        int = types.integer,
        real = types.real,
        short = types.short_text,
    )
}

// ==================== 驱动抽象 ====================

/// 驱动错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// 连接建立/复用失败
    Connection,
    /// 语句执行失败（含超时、取消）
    Statement,
}

/// 驱动返回的原始错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// 引擎错误码（如 MySQL 1142、MSSQL 229）
    pub code: Option<i64>,
    pub message: String,
}

impl DriverError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Connection,
            code: None,
            message: message.into(),
        }
    }

    pub fn statement(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Statement,
            code,
            message: message.into(),
        }
    }
}

/// 原始 SQL 执行驱动
///
/// 方言适配器（MySQL/MSSQL）只依赖此最小接口，具体驱动由宿主程序提供。
pub trait SqlDriver: Send + Sync {
    fn query(&self, sql: &str) -> std::result::Result<ResultSet, DriverError>;
    fn execute(&self, sql: &str) -> std::result::Result<usize, DriverError>;
}

/// 读/写方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// 把驱动错误映射为缓存错误，附带语句、表名、引擎上下文
pub(crate) fn map_driver_error(
    engine: Engine,
    direction: Direction,
    sql: &str,
    err: DriverError,
    permission_codes: &[i64],
) -> CacheError {
    if err.kind == DriverErrorKind::Connection {
        return CacheError::Connection {
            engine: engine.to_string(),
            message: err.message,
        };
    }
    let permission_denied = err.code.is_some_and(|c| permission_codes.contains(&c))
        || looks_like_permission_denied(&err.message);
    statement_error(engine, direction, sql, err.message, permission_denied)
}

pub(crate) fn statement_error(
    engine: Engine,
    direction: Direction,
    sql: &str,
    message: String,
    permission_denied: bool,
) -> CacheError {
    let failure = StatementFailure {
        sql: sql.to_string(),
        table: extract_tables(sql).and_then(|t| t.into_iter().next()),
        engine: engine.to_string(),
        message,
        permission_denied,
    };
    match direction {
        Direction::Read => CacheError::TableRead(failure),
        Direction::Write => CacheError::TableWrite(failure),
    }
}

fn looks_like_permission_denied(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("permission denied")
        || lower.contains("access denied")
        || lower.contains("command denied")
}

/// 二进制转十六进制（用于 `X'..'` / `0x..` 字面量）
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// 以逗号连接的文本字面量列表（用于 `IN (...)`）
pub(crate) fn literal_list(connector: &dyn DbConnector, names: &[String]) -> String {
    names
        .iter()
        .map(|n| connector.escape_text(n))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
pub(crate) mod testing {
    //! 按脚本应答的驱动，供方言适配器测试使用

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedDriver {
        /// (语句片段, 应答)，按注册顺序匹配第一个包含该片段的语句
        responses: Mutex<Vec<(String, std::result::Result<ResultSet, DriverError>)>>,
        pub executed: Mutex<Vec<String>>,
    }

    impl ScriptedDriver {
        pub fn respond(self, fragment: &str, result: ResultSet) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push((fragment.to_string(), Ok(result)));
            self
        }

        pub fn fail(self, fragment: &str, err: DriverError) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push((fragment.to_string(), Err(err)));
            self
        }

        fn lookup(&self, sql: &str) -> std::result::Result<ResultSet, DriverError> {
            self.executed.lock().unwrap().push(sql.to_string());
            self.responses
                .lock()
                .unwrap()
                .iter()
                .find(|(fragment, _)| sql.contains(fragment.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| Ok(ResultSet::default()))
        }
    }

    impl SqlDriver for ScriptedDriver {
        fn query(&self, sql: &str) -> std::result::Result<ResultSet, DriverError> {
            self.lookup(sql)
        }

        fn execute(&self, sql: &str) -> std::result::Result<usize, DriverError> {
            self.lookup(sql).map(|rs| rs.len())
        }
    }
}
