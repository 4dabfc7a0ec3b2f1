//! 关系表后端：元数据一行一条，小负载同行存放

use crate::connectors::{DbConnector, METADATA_COLUMNS};
use crate::data::{CacheError, Result};
use crate::models::{AccessStats, CacheEntryMeta, DbStats, PayloadLocation, Value};
use std::sync::Arc;

/// 元数据行解析结果
pub(super) struct MetaRow {
    pub meta: CacheEntryMeta,
    pub location: PayloadLocation,
    pub payload: Option<String>,
}

pub(super) struct RowBackend {
    connector: Arc<dyn DbConnector>,
    table: String,
    quoted: String,
}

impl RowBackend {
    pub fn new(connector: Arc<dyn DbConnector>, table: String) -> Self {
        let quoted = connector.quote_identifier(&table);
        Self {
            connector,
            table,
            quoted,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.connector.create_cache_schema(&self.table)
    }

    pub fn drop_schema(&self) -> Result<()> {
        self.connector.drop_cache_schema(&self.table)
    }

    /// 按键读取一行；`with_payload` 为 false 时不读取负载列
    pub fn select(&self, key: &str, with_payload: bool) -> Result<Option<MetaRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE hash = {}",
            self.column_list(with_payload),
            self.quoted,
            self.connector.escape_text(key)
        );
        let rs = self.connector.execute_read(&sql)?;
        match rs.rows.first() {
            Some(row) => parse_row(row).map(Some),
            None => Ok(None),
        }
    }

    /// 写入整行（插入或覆盖）
    pub fn write(
        &self,
        meta: &CacheEntryMeta,
        location: PayloadLocation,
        payload: Option<&str>,
        exists: bool,
    ) -> Result<()> {
        let c = &self.connector;
        let payload_literal = payload
            .map(|p| c.escape_text(p))
            .unwrap_or_else(|| "NULL".to_string());

        let sql = if exists {
            format!(
                "UPDATE {} SET script = {}, description = {}, tables_csv = {}, {}, location = {}, resultset = {} WHERE hash = {}",
                self.quoted,
                c.escape_text(&meta.sql),
                c.escape_text(&meta.description),
                c.escape_text(&meta.tables_csv()),
                self.stats_assignments(meta),
                c.escape_text(location.as_str()),
                payload_literal,
                c.escape_text(&meta.key),
            )
        } else {
            let values = [
                c.escape_text(&meta.key),
                c.escape_text(&meta.sql),
                c.escape_text(&meta.description),
                c.escape_text(&meta.tables_csv()),
                meta.db_stats.create_time.to_string(),
                meta.db_stats.last_access_time.to_string(),
                meta.db_stats.impression_count.to_string(),
                format_real(meta.db_stats.avg_cost_ms),
                meta.cache_stats.create_time.to_string(),
                meta.cache_stats.last_access_time.to_string(),
                meta.cache_stats.impression_count.to_string(),
                c.escape_text(location.as_str()),
                payload_literal,
            ];
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.quoted,
                METADATA_COLUMNS.join(", "),
                values.join(", ")
            )
        };
        c.execute_write(&sql)?;
        Ok(())
    }

    /// 只更新统计列
    pub fn update_stats(&self, meta: &CacheEntryMeta) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {} WHERE hash = {}",
            self.quoted,
            self.stats_assignments(meta),
            self.connector.escape_text(&meta.key)
        );
        self.connector.execute_write(&sql)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE hash = {}",
            self.quoted,
            self.connector.escape_text(key)
        );
        Ok(self.connector.execute_write(&sql)? > 0)
    }

    /// 全部条目元数据（不含负载）
    pub fn list(&self) -> Result<Vec<CacheEntryMeta>> {
        let sql = format!("SELECT {} FROM {}", self.column_list(false), self.quoted);
        let rs = self.connector.execute_read(&sql)?;
        let mut metas = Vec::with_capacity(rs.len());
        for row in &rs.rows {
            match parse_row(row) {
                Ok(parsed) => metas.push(parsed.meta),
                Err(e) => tracing::warn!(table = %self.table, error = ?e, "跳过无法解析的元数据行"),
            }
        }
        Ok(metas)
    }

    pub fn count(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.quoted);
        let rs = self.connector.execute_read(&sql)?;
        Ok(rs.scalar().and_then(Value::as_i64).unwrap_or(0).max(0) as usize)
    }

    pub fn clear(&self) -> Result<usize> {
        self.connector
            .execute_write(&format!("DELETE FROM {}", self.quoted))
    }

    fn column_list(&self, with_payload: bool) -> String {
        let take = if with_payload {
            METADATA_COLUMNS.len()
        } else {
            METADATA_COLUMNS.len() - 1
        };
        METADATA_COLUMNS[..take].join(", ")
    }

    fn stats_assignments(&self, meta: &CacheEntryMeta) -> String {
        format!(
            "create_time = {}, access_time = {}, impressions = {}, avg_cost = {}, \
             cache_create_time = {}, cache_access_time = {}, cache_impressions = {}",
            meta.db_stats.create_time,
            meta.db_stats.last_access_time,
            meta.db_stats.impression_count,
            format_real(meta.db_stats.avg_cost_ms),
            meta.cache_stats.create_time,
            meta.cache_stats.last_access_time,
            meta.cache_stats.impression_count,
        )
    }
}

fn format_real(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.3}")
    } else {
        "0".to_string()
    }
}

/// 按 `METADATA_COLUMNS` 顺序解析一行
fn parse_row(row: &[Value]) -> Result<MetaRow> {
    let column = |i: usize| -> Result<&Value> {
        row.get(i).ok_or_else(|| {
            CacheError::Serialization(format!("元数据行缺少列: {}", METADATA_COLUMNS[i]))
        })
    };
    let int = |i: usize| -> Result<i64> {
        column(i)?.as_i64().ok_or_else(|| {
            CacheError::Serialization(format!("元数据列不是整数: {}", METADATA_COLUMNS[i]))
        })
    };
    let text = |i: usize| -> Result<String> {
        match column(i)? {
            Value::Text(s) => Ok(s.clone()),
            Value::Blob(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            Value::Null => Ok(String::new()),
            other => Ok(other.as_i64().map(|v| v.to_string()).unwrap_or_default()),
        }
    };

    let location = PayloadLocation::parse(&text(11)?).ok_or_else(|| {
        CacheError::Serialization("元数据列 location 取值无效".to_string())
    })?;
    let payload = match row.get(12) {
        Some(Value::Null) | None => None,
        Some(_) => Some(text(12)?),
    };

    let meta = CacheEntryMeta {
        key: text(0)?,
        sql: text(1)?,
        description: text(2)?,
        tables: CacheEntryMeta::parse_tables_csv(&text(3)?),
        db_stats: DbStats {
            create_time: int(4)?,
            last_access_time: int(5)?,
            impression_count: int(6)?.max(0) as u64,
            avg_cost_ms: column(7)?.as_f64().unwrap_or(0.0),
        },
        cache_stats: AccessStats {
            create_time: int(8)?,
            last_access_time: int(9)?,
            impression_count: int(10)?.max(0) as u64,
        },
    };

    Ok(MetaRow {
        meta,
        location,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_row_accepts_textual_numbers() {
        let row = vec![
            Value::Text("k".into()),
            Value::Text("SELECT 1".into()),
            Value::Text("".into()),
            Value::Text("a,b".into()),
            Value::Text("100".into()),
            Value::Integer(120),
            Value::Text("3".into()),
            Value::Text("12.500".into()),
            Value::Integer(0),
            Value::Integer(0),
            Value::Integer(0),
            Value::Text("file".into()),
            Value::Null,
        ];
        let parsed = parse_row(&row).unwrap();
        assert_eq!(parsed.meta.tables, vec!["a", "b"]);
        assert_eq!(parsed.meta.db_stats.impression_count, 3);
        assert_eq!(parsed.meta.db_stats.avg_cost_ms, 12.5);
        assert_eq!(parsed.location, PayloadLocation::File);
        assert!(parsed.payload.is_none());
    }

    #[test]
    fn test_parse_row_rejects_bad_location() {
        let mut row: Vec<Value> = (0..13).map(|_| Value::Integer(0)).collect();
        row[11] = Value::Text("cloud".into());
        assert!(parse_row(&row).is_err());
    }
}
