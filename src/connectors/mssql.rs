//! SQL Server 方言适配器
//!
//! `sys.dm_db_index_usage_stats` 只记录自实例启动以来的访问，重启后清零。
//! 这里如实上报（`Volatile`），由变更检测器结合持久化的表时间戳缓存回退。

use super::{
    literal_list, map_driver_error, statement_error, ChangeTimes, ColumnTypes, DbConnector,
    Direction, Engine, SqlDriver,
};
use crate::data::Result;
use crate::models::ResultSet;
use std::collections::HashMap;

/// 权限相关错误码
const PERMISSION_CODES: &[i64] = &[229, 230, 262, 297, 300, 18456];

const EPOCH_SECONDS: &str = "DATEDIFF_BIG(SECOND, '1970-01-01'";

pub struct MsSqlConnector<D: SqlDriver> {
    driver: D,
}

impl<D: SqlDriver> MsSqlConnector<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn query(&self, sql: &str) -> Result<ResultSet> {
        self.driver
            .query(sql)
            .map_err(|e| map_driver_error(Engine::MsSql, Direction::Read, sql, e, PERMISSION_CODES))
    }

    fn query_scalar_i64(&self, sql: &str) -> Result<i64> {
        let rs = self.query(sql)?;
        rs.scalar().and_then(|v| v.as_i64()).ok_or_else(|| {
            statement_error(
                Engine::MsSql,
                Direction::Read,
                sql,
                "查询未返回整数结果".to_string(),
                false,
            )
        })
    }

    /// 实例启动时间（Unix 秒，数据库时钟）
    pub fn server_start_time(&self) -> Result<i64> {
        self.query_scalar_i64(&format!(
            "SELECT {EPOCH_SECONDS}, sqlserver_start_time) FROM sys.dm_os_sys_info"
        ))
    }
}

impl<D: SqlDriver> DbConnector for MsSqlConnector<D> {
    fn engine(&self) -> Engine {
        Engine::MsSql
    }

    fn execute_read(&self, sql: &str) -> Result<ResultSet> {
        self.query(sql)
    }

    fn execute_write(&self, sql: &str) -> Result<usize> {
        self.driver
            .execute(sql)
            .map_err(|e| map_driver_error(Engine::MsSql, Direction::Write, sql, e, PERMISSION_CODES))
    }

    fn escape_text(&self, text: &str) -> String {
        format!("N'{}'", text.replace('\'', "''"))
    }

    fn escape_binary(&self, bytes: &[u8]) -> String {
        format!("0x{}", super::hex_encode(bytes))
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn table_change_times(&self, tables: &[String]) -> Result<ChangeTimes> {
        let server_start = self.server_start_time()?;

        let mut last_updates: HashMap<String, Option<i64>> =
            tables.iter().map(|t| (t.clone(), None)).collect();
        if tables.is_empty() {
            return Ok(ChangeTimes::Volatile {
                server_start,
                last_updates,
            });
        }

        let sql = format!(
            "SELECT OBJECT_NAME(s.object_id), {EPOCH_SECONDS}, MAX(s.last_user_update)) \
             FROM sys.dm_db_index_usage_stats s \
             WHERE s.database_id = DB_ID() AND OBJECT_NAME(s.object_id) IN ({}) \
             GROUP BY s.object_id",
            literal_list(self, tables)
        );
        let rs = self.query(&sql)?;

        for row in &rs.rows {
            let Some(name) = row.first().and_then(|v| v.as_str()) else {
                continue;
            };
            let time = row.get(1).and_then(|v| v.as_i64());
            if let Some(slot) = last_updates
                .iter_mut()
                .find(|(table, _)| table.eq_ignore_ascii_case(name))
                .map(|(_, slot)| slot)
            {
                *slot = time;
            }
        }

        Ok(ChangeTimes::Volatile {
            server_start,
            last_updates,
        })
    }

    fn db_unix_time(&self) -> Result<i64> {
        self.query_scalar_i64(&format!("SELECT {EPOCH_SECONDS}, GETUTCDATE())"))
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = {}",
            self.escape_text(name)
        );
        let rs = self.query(&sql)?;
        Ok(rs.scalar().and_then(|v| v.as_i64()).unwrap_or(0) > 0)
    }

    fn column_types(&self) -> ColumnTypes {
        ColumnTypes {
            key: "CHAR(64)",
            text: "NVARCHAR(MAX)",
            large_text: "NVARCHAR(MAX)",
            integer: "BIGINT",
            real: "FLOAT",
            short_text: "VARCHAR(8)",
        }
    }
}
