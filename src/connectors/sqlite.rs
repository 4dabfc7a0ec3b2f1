//! SQLite 连接器（嵌入式文件数据库）
//!
//! SQLite 本身不记录表的修改时间，这里用触发器维护 `qc_table_changes`：
//! 第一次查询某表的变更时间时为其安装 INSERT/UPDATE/DELETE 触发器，
//! 并把安装前一秒记为变更时间（安装前的修改无从得知，按刚刚变更处理）。
//!
//! 关闭变更追踪后 `table_change_times` 恒为 `Unknown`，每次都会回源刷新。
//!
//! # 使用示例
//!
//! ```rust
//! use std::path::Path;
//! use crate::connectors::SqliteConnector;
//!
//! let connector = SqliteConnector::open(Path::new("app.db"))?;
//! let rows = connector.execute_read("SELECT * FROM users u JOIN teams t ON u.team = t.id")?;
//! ```

use super::{statement_error, ChangeTimes, ColumnTypes, DbConnector, Direction, Engine};
use crate::data::{CacheError, Result};
use crate::models::{ResultSet, Value};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// 变更时间表
pub const CHANGE_TABLE: &str = "qc_table_changes";

const NOW_EXPR: &str = "CAST(strftime('%s','now') AS INTEGER)";

/// SQLite 连接器
pub struct SqliteConnector {
    /// 数据库连接
    conn: Arc<Mutex<Connection>>,
    /// 数据库路径（用于错误报告）
    db_path: PathBuf,
    /// 是否启用触发器变更追踪
    track_changes: bool,
}

impl SqliteConnector {
    /// 打开数据库文件（启用变更追踪）
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Self::open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
            track_changes: true,
        })
    }

    /// 内存数据库（测试使用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CacheError::Connection {
            engine: Engine::Sqlite.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
            track_changes: true,
        })
    }

    /// 关闭变更追踪（变更时间恒为 Unknown）
    pub fn without_change_tracking(mut self) -> Self {
        self.track_changes = false;
        self
    }

    /// 打开数据库连接
    fn open_connection(path: &Path) -> Result<Connection> {
        // 创建父目录
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        let conn = Connection::open(path).map_err(|e| CacheError::Connection {
            engine: Engine::Sqlite.to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        // 多进程共享同一文件时等待而不是立即报 SQLITE_BUSY
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .map_err(CacheError::Database)?;
        Ok(conn)
    }

    /// 获取数据库路径
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| CacheError::Connection {
            engine: Engine::Sqlite.to_string(),
            message: format!("连接互斥锁中毒: {e}"),
        })
    }

    fn map_error(direction: Direction, sql: &str, err: rusqlite::Error) -> CacheError {
        let permission_denied = matches!(
            err.sqlite_error_code(),
            Some(ErrorCode::PermissionDenied) | Some(ErrorCode::ReadOnly) | Some(ErrorCode::AuthorizationForStatementDenied)
        );
        if matches!(err.sqlite_error_code(), Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase)) {
            return CacheError::Connection {
                engine: Engine::Sqlite.to_string(),
                message: err.to_string(),
            };
        }
        statement_error(Engine::Sqlite, direction, sql, err.to_string(), permission_denied)
    }

    /// 将 rusqlite::Row 转换为值列表
    fn row_to_values(row: &Row, column_count: usize) -> rusqlite::Result<Vec<Value>> {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = match row.get_ref(i)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => Value::Integer(i),
                ValueRef::Real(f) => Value::Real(f),
                ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
                ValueRef::Blob(b) => Value::Blob(b.to_vec()),
            };
            values.push(value);
        }
        Ok(values)
    }

    fn table_exists_locked(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1 COLLATE NOCASE",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 追踪记录使用的表名（SQLite 标识符对 ASCII 大小写不敏感）
    fn tracking_key(table: &str) -> String {
        table.to_ascii_lowercase()
    }

    /// 为表安装变更追踪触发器，并返回当前记录的变更时间
    ///
    /// 同一张表无论以何种大小写引用，都对应同一条追踪记录和同一组触发器。
    fn ensure_tracked(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
        let key = Self::tracking_key(table);
        let select = format!("SELECT changed_at FROM {CHANGE_TABLE} WHERE table_name = ?1");
        if let Some(changed_at) = conn
            .query_row(&select, [&key], |row| row.get::<_, i64>(0))
            .optional()?
        {
            return Ok(changed_at);
        }

        let ident = table.replace('"', "\"\"");
        let literal = key.replace('\'', "''");
        let trigger_base = format!("qc_track_{}", key.replace('"', "\"\""));
        let mut ddl = String::new();
        for event in ["INSERT", "UPDATE", "DELETE"] {
            ddl.push_str(&format!(
                "CREATE TRIGGER IF NOT EXISTS \"{trigger_base}_{ev}\" AFTER {event} ON \"{ident}\" BEGIN \
                 INSERT OR REPLACE INTO {CHANGE_TABLE}(table_name, changed_at) VALUES ('{literal}', {NOW_EXPR}); \
                 END;\n",
                ev = event.to_ascii_lowercase(),
            ));
        }
        // 安装时刻记为上一秒：调用方在安装之后才执行查询，
        // 与查询同一秒的修改仍会晚于该时间
        ddl.push_str(&format!(
            "INSERT OR REPLACE INTO {CHANGE_TABLE}(table_name, changed_at) VALUES ('{literal}', {NOW_EXPR} - 1);"
        ));
        conn.execute_batch(&ddl)?;
        tracing::debug!(table = %table, "已为表安装变更追踪触发器");

        conn.query_row(&select, [&key], |row| row.get(0))
    }
}

impl DbConnector for SqliteConnector {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    fn execute_read(&self, sql: &str) -> Result<ResultSet> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Self::map_error(Direction::Read, sql, e))?;

        // 获取列名
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = columns.len();

        let rows = stmt
            .query_map([], |row| Self::row_to_values(row, column_count))
            .map_err(|e| Self::map_error(Direction::Read, sql, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Self::map_error(Direction::Read, sql, e))?;

        Ok(ResultSet::new(columns, rows))
    }

    fn execute_write(&self, sql: &str) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(sql, [])
            .map_err(|e| Self::map_error(Direction::Write, sql, e))
    }

    fn escape_text(&self, text: &str) -> String {
        format!("'{}'", text.replace('\'', "''"))
    }

    fn escape_binary(&self, bytes: &[u8]) -> String {
        format!("X'{}'", super::hex_encode(bytes))
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn table_change_times(&self, tables: &[String]) -> Result<ChangeTimes> {
        if !self.track_changes {
            return Ok(ChangeTimes::Unknown);
        }

        let conn = self.lock()?;
        let bootstrap = format!(
            "CREATE TABLE IF NOT EXISTS {CHANGE_TABLE} (table_name TEXT PRIMARY KEY, changed_at INTEGER NOT NULL)"
        );
        conn.execute_batch(&bootstrap)
            .map_err(|e| Self::map_error(Direction::Write, &bootstrap, e))?;

        let mut times = HashMap::with_capacity(tables.len());
        for table in tables {
            let exists = Self::table_exists_locked(&conn, table)
                .map_err(|e| Self::map_error(Direction::Read, "sqlite_master", e))?;
            if !exists {
                // 视图或无法识别的名称，无法追踪
                tracing::debug!(table = %table, "表不存在，变更时间未知");
                return Ok(ChangeTimes::Unknown);
            }
            let changed_at = Self::ensure_tracked(&conn, table)
                .map_err(|e| Self::map_error(Direction::Write, CHANGE_TABLE, e))?;
            times.insert(table.clone(), changed_at);
        }
        Ok(ChangeTimes::Live(times))
    }

    fn db_unix_time(&self) -> Result<i64> {
        let conn = self.lock()?;
        let sql = format!("SELECT {NOW_EXPR}");
        conn.query_row(&sql, [], |row| row.get(0))
            .map_err(|e| Self::map_error(Direction::Read, &sql, e))
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        Self::table_exists_locked(&conn, name)
            .map_err(|e| Self::map_error(Direction::Read, "sqlite_master", e))
    }

    fn column_types(&self) -> ColumnTypes {
        ColumnTypes {
            key: "TEXT",
            text: "TEXT",
            large_text: "TEXT",
            integer: "INTEGER",
            real: "REAL",
            short_text: "TEXT",
        }
    }
}
