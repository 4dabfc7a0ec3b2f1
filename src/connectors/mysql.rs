//! MySQL 方言适配器
//!
//! 变更时间来自 `information_schema.TABLES.UPDATE_TIME`。该列为 NULL 时
//! （例如 InnoDB 在服务重启后尚未写入）无法判断，整体返回 Unknown。

use super::{
    literal_list, map_driver_error, ChangeTimes, ColumnTypes, DbConnector, Direction, Engine,
    SqlDriver,
};
use crate::data::Result;
use crate::models::ResultSet;
use std::collections::HashMap;

/// 权限相关错误码：表/列/库访问被拒、认证失败
const PERMISSION_CODES: &[i64] = &[1044, 1045, 1142, 1143];

pub struct MySqlConnector<D: SqlDriver> {
    driver: D,
}

impl<D: SqlDriver> MySqlConnector<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn query(&self, sql: &str) -> Result<ResultSet> {
        self.driver
            .query(sql)
            .map_err(|e| map_driver_error(Engine::MySql, Direction::Read, sql, e, PERMISSION_CODES))
    }
}

impl<D: SqlDriver> DbConnector for MySqlConnector<D> {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    fn execute_read(&self, sql: &str) -> Result<ResultSet> {
        self.query(sql)
    }

    fn execute_write(&self, sql: &str) -> Result<usize> {
        self.driver
            .execute(sql)
            .map_err(|e| map_driver_error(Engine::MySql, Direction::Write, sql, e, PERMISSION_CODES))
    }

    fn escape_text(&self, text: &str) -> String {
        let mut escaped = String::with_capacity(text.len() + 2);
        escaped.push('\'');
        for c in text.chars() {
            match c {
                '\\' => escaped.push_str("\\\\"),
                '\'' => escaped.push_str("\\'"),
                '\0' => escaped.push_str("\\0"),
                '\n' => escaped.push_str("\\n"),
                '\r' => escaped.push_str("\\r"),
                '\x1a' => escaped.push_str("\\Z"),
                _ => escaped.push(c),
            }
        }
        escaped.push('\'');
        escaped
    }

    fn escape_binary(&self, bytes: &[u8]) -> String {
        format!("X'{}'", super::hex_encode(bytes))
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn table_change_times(&self, tables: &[String]) -> Result<ChangeTimes> {
        if tables.is_empty() {
            return Ok(ChangeTimes::Live(HashMap::new()));
        }

        let sql = format!(
            "SELECT TABLE_NAME, UNIX_TIMESTAMP(UPDATE_TIME) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME IN ({})",
            literal_list(self, tables)
        );
        let rs = self.query(&sql)?;

        let mut reported: HashMap<String, i64> = HashMap::with_capacity(rs.len());
        for row in &rs.rows {
            let name = row.first().and_then(|v| v.as_str()).map(str::to_ascii_lowercase);
            let time = row.get(1).and_then(|v| v.as_i64());
            if let (Some(name), Some(time)) = (name, time) {
                reported.insert(name, time);
            }
        }

        let mut times = HashMap::with_capacity(tables.len());
        for table in tables {
            match reported.get(&table.to_ascii_lowercase()) {
                Some(&time) => {
                    times.insert(table.clone(), time);
                }
                None => {
                    tracing::debug!(table = %table, "UPDATE_TIME 不可用，变更时间未知");
                    return Ok(ChangeTimes::Unknown);
                }
            }
        }
        Ok(ChangeTimes::Live(times))
    }

    fn db_unix_time(&self) -> Result<i64> {
        let sql = "SELECT UNIX_TIMESTAMP()";
        let rs = self.query(sql)?;
        rs.scalar().and_then(|v| v.as_i64()).ok_or_else(|| {
            super::statement_error(
                Engine::MySql,
                Direction::Read,
                sql,
                "数据库未返回当前时间".to_string(),
                false,
            )
        })
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = {}",
            self.escape_text(name)
        );
        let rs = self.query(&sql)?;
        Ok(rs.scalar().and_then(|v| v.as_i64()).unwrap_or(0) > 0)
    }

    fn column_types(&self) -> ColumnTypes {
        ColumnTypes {
            key: "CHAR(64)",
            text: "TEXT",
            large_text: "LONGTEXT",
            integer: "BIGINT",
            real: "DOUBLE",
            short_text: "VARCHAR(8)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::testing::ScriptedDriver;
    use crate::connectors::DriverError;
    use crate::data::CacheError;
    use crate::models::Value;

    fn rs(columns: &[&str], rows: Vec<Vec<Value>>) -> ResultSet {
        ResultSet::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    #[test]
    fn test_escape_text() {
        let connector = MySqlConnector::new(ScriptedDriver::default());
        assert_eq!(connector.escape_text("it's"), "'it\\'s'");
        assert_eq!(connector.escape_text("a\\b"), "'a\\\\b'");
        assert_eq!(connector.escape_text("line\nbreak"), "'line\\nbreak'");
        assert_eq!(connector.quote_identifier("qc`x"), "`qc``x`");
        assert_eq!(connector.escape_binary(&[0xDE, 0xAD]), "X'DEAD'");
    }

    #[test]
    fn test_live_change_times() {
        let driver = ScriptedDriver::default().respond(
            "information_schema.TABLES",
            rs(
                &["TABLE_NAME", "UPDATE_TIME"],
                vec![
                    vec![Value::Text("orders".into()), Value::Integer(500)],
                    vec![Value::Text("Customers".into()), Value::Text("700".into())],
                ],
            ),
        );
        let connector = MySqlConnector::new(driver);
        let times = connector
            .table_change_times(&["orders".to_string(), "customers".to_string()])
            .unwrap();

        let mut expected = HashMap::new();
        expected.insert("orders".to_string(), 500);
        expected.insert("customers".to_string(), 700);
        assert_eq!(times, ChangeTimes::Live(expected));

        let executed = connector.driver().executed.lock().unwrap();
        assert!(executed[0].contains("IN ('orders', 'customers')"));
    }

    #[test]
    fn test_null_update_time_is_unknown() {
        let driver = ScriptedDriver::default().respond(
            "information_schema.TABLES",
            rs(
                &["TABLE_NAME", "UPDATE_TIME"],
                vec![
                    vec![Value::Text("orders".into()), Value::Integer(500)],
                    vec![Value::Text("customers".into()), Value::Null],
                ],
            ),
        );
        let connector = MySqlConnector::new(driver);
        let times = connector
            .table_change_times(&["orders".to_string(), "customers".to_string()])
            .unwrap();
        assert_eq!(times, ChangeTimes::Unknown);
    }

    #[test]
    fn test_clock_offset() {
        let driver = ScriptedDriver::default().respond(
            "UNIX_TIMESTAMP()",
            rs(&["now"], vec![vec![Value::Integer(990)]]),
        );
        let connector = MySqlConnector::new(driver);
        assert_eq!(connector.clock_offset_seconds(1000).unwrap(), 10);
    }

    #[test]
    fn test_permission_denied_read() {
        let driver = ScriptedDriver::default().fail(
            "secrets",
            DriverError::statement(Some(1142), "SELECT command denied to user 'app'"),
        );
        let connector = MySqlConnector::new(driver);
        let err = connector
            .execute_read("SELECT * FROM secrets s JOIN keys k ON s.id = k.id")
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(matches!(err, CacheError::TableRead(_)));
    }

    #[test]
    fn test_write_failure_is_table_write() {
        let driver = ScriptedDriver::default()
            .fail("INSERT", DriverError::statement(Some(1062), "Duplicate entry"));
        let connector = MySqlConnector::new(driver);
        let err = connector
            .execute_write("INSERT INTO qc_cache_main (hash) VALUES ('x')")
            .unwrap_err();
        match err {
            CacheError::TableWrite(f) => {
                assert!(!f.permission_denied);
                assert_eq!(f.engine, "mysql");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_table_exists() {
        let driver = ScriptedDriver::default()
            .respond("'qc_cache_main'", rs(&["c"], vec![vec![Value::Integer(1)]]))
            .respond("COUNT(*)", rs(&["c"], vec![vec![Value::Integer(0)]]));
        let connector = MySqlConnector::new(driver);
        assert!(connector.table_exists("qc_cache_main").unwrap());
        assert!(!connector.table_exists("other").unwrap());
    }
}
