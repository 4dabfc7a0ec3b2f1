//! 事务日志与汇总统计
//!
//! 日志每行一条记录：`unixTime,outcome(db|qc),cacheMillis,dbMillis,sql`，
//! 未知耗时写为空字段，SQL 中的换行替换为空格。
//!
//! 追加只写入一行；汇总中记录着日志行数，超过上限加上余量后才压缩文件，
//! 丢弃最旧的记录。读取时只返回最新的上限条记录。
//!
//! 汇总统计（JSON）在每次追加时增量更新；文件缺失或损坏时从完整日志重建一次。
//! 日志与汇总的读-改-写在同一把锁内完成。

use crate::data::lock::LockProvider;
use crate::data::{CacheError, Result};
use crate::utils::atomic_write;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LOG_FILE: &str = "transactions.log";
pub const STATS_FILE: &str = "stats.json";

/// 查询由谁服务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// 数据库执行
    Db,
    /// 缓存命中
    Cache,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Db => "db",
            Outcome::Cache => "qc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "db" => Some(Outcome::Db),
            "qc" => Some(Outcome::Cache),
            _ => None,
        }
    }
}

/// 一条日志记录
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    pub time: i64,
    pub outcome: Outcome,
    /// 缓存路径耗时（毫秒）
    pub cache_ms: Option<f64>,
    /// 数据库路径耗时（毫秒）；命中时为该条目的平均执行耗时
    pub db_ms: Option<f64>,
    pub sql: String,
}

impl TxRecord {
    /// 命中节省的时间（两侧耗时都已知时）
    pub fn saved_ms(&self) -> Option<f64> {
        match (self.outcome, self.cache_ms, self.db_ms) {
            (Outcome::Cache, Some(cache), Some(db)) => Some(db - cache),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        let millis = |v: Option<f64>| v.map(|m| format!("{m:.3}")).unwrap_or_default();
        let sql: String = self
            .sql
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        format!(
            "{},{},{},{},{}",
            self.time,
            self.outcome.as_str(),
            millis(self.cache_ms),
            millis(self.db_ms),
            sql
        )
    }

    /// 解析一行；格式不正确时返回 None
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(5, ',');
        let time = parts.next()?.trim().parse().ok()?;
        let outcome = Outcome::parse(parts.next()?)?;
        let millis = |s: &str| -> Option<f64> {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                s.parse().ok()
            }
        };
        let cache_ms = millis(parts.next()?);
        let db_ms = millis(parts.next()?);
        let sql = parts.next()?.to_string();
        Some(Self {
            time,
            outcome,
            cache_ms,
            db_ms,
            sql,
        })
    }
}

impl fmt::Display for TxRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// 耗时差最大的一次命中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowestCase {
    pub millis: f64,
    pub sql: String,
    pub time: i64,
}

/// 汇总统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub first_log_time: i64,
    pub total_saved_millis: f64,
    pub slowest_case: Option<SlowestCase>,
    /// 日志文件当前的记录数
    #[serde(default)]
    pub log_records: usize,
}

impl AggregateStats {
    /// 计入一条记录
    pub fn absorb(&mut self, record: &TxRecord) {
        self.log_records += 1;
        if self.first_log_time == 0 || record.time < self.first_log_time {
            self.first_log_time = record.time;
        }
        if let Some(saved) = record.saved_ms() {
            self.total_saved_millis += saved;
            let slower = self
                .slowest_case
                .as_ref()
                .map_or(true, |current| saved > current.millis);
            if slower {
                self.slowest_case = Some(SlowestCase {
                    millis: saved,
                    sql: record.sql.clone(),
                    time: record.time,
                });
            }
        }
    }

    /// 从完整日志重建
    pub fn rebuild<'a>(records: impl IntoIterator<Item = &'a TxRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.absorb(record);
        }
        stats
    }
}

/// 有界事务日志
pub struct TransactionLog {
    log_path: PathBuf,
    stats_path: PathBuf,
    max_records: usize,
    locks: Arc<dyn LockProvider>,
}

impl TransactionLog {
    pub fn new(dir: &Path, max_records: usize, locks: Arc<dyn LockProvider>) -> Self {
        Self {
            log_path: dir.join(LOG_FILE),
            stats_path: dir.join(STATS_FILE),
            max_records: max_records.max(1),
            locks,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn stats_path(&self) -> &Path {
        &self.stats_path
    }

    fn lock_name(&self) -> String {
        format!("txlog:{}", self.log_path.display())
    }

    /// 压缩前允许超出上限的记录数
    fn slack(&self) -> usize {
        (self.max_records / 10).max(1)
    }

    /// 日志文件中的全部记录
    fn read_all(&self) -> Result<Vec<TxRecord>> {
        let content = match std::fs::read_to_string(&self.log_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&self.log_path, e)),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| {
                let parsed = TxRecord::parse_line(line);
                if parsed.is_none() {
                    tracing::debug!(line = %line, "跳过无法解析的日志行");
                }
                parsed
            })
            .collect())
    }

    /// 最新的至多 `max_records` 条记录
    fn read_records(&self) -> Result<Vec<TxRecord>> {
        let mut records = self.read_all()?;
        let excess = records.len().saturating_sub(self.max_records);
        records.drain(..excess);
        Ok(records)
    }

    fn append_line(&self, record: &TxRecord) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        let mut line = record.to_line();
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|e| CacheError::io(&self.log_path, e))
    }

    /// 只保留最新的 `max_records` 条记录，返回保留的条数
    fn compact(&self) -> Result<usize> {
        let records = self.read_records()?;
        let mut content = String::with_capacity(records.len() * 96);
        for r in &records {
            content.push_str(&r.to_line());
            content.push('\n');
        }
        atomic_write(&self.log_path, content.as_bytes())?;
        tracing::debug!(path = ?self.log_path, retained = records.len(), "已压缩事务日志");
        Ok(records.len())
    }

    fn read_stats(&self) -> Result<Option<AggregateStats>> {
        let content = match std::fs::read_to_string(&self.stats_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&self.stats_path, e)),
        };
        match serde_json::from_str(&content) {
            Ok(stats) => Ok(Some(stats)),
            Err(e) => {
                tracing::warn!(path = ?self.stats_path, error = ?e, "汇总统计损坏，将从日志重建");
                Ok(None)
            }
        }
    }

    fn write_stats(&self, stats: &AggregateStats) -> Result<()> {
        atomic_write(&self.stats_path, &serde_json::to_vec_pretty(stats)?)
    }

    /// 追加一条记录并更新汇总
    pub fn append(&self, record: &TxRecord) -> Result<()> {
        let _guard = self.locks.acquire(&self.lock_name())?;

        let mut stats = match self.read_stats()? {
            Some(stats) => stats,
            None => {
                let records = self.read_all()?;
                tracing::info!(records = records.len(), "从事务日志重建汇总统计");
                AggregateStats::rebuild(&records)
            }
        };

        self.append_line(record)?;
        stats.absorb(record);
        if stats.log_records > self.max_records + self.slack() {
            stats.log_records = self.compact()?;
        }
        self.write_stats(&stats)
    }

    /// 读取汇总（缺失或损坏时从日志重建并写回）
    pub fn aggregate(&self) -> Result<AggregateStats> {
        let _guard = self.locks.acquire(&self.lock_name())?;
        if let Some(stats) = self.read_stats()? {
            return Ok(stats);
        }
        let records = self.read_all()?;
        let stats = AggregateStats::rebuild(&records);
        if !records.is_empty() {
            self.write_stats(&stats)?;
        }
        Ok(stats)
    }

    /// 最近 `n` 条记录（按时间顺序）
    pub fn recent(&self, n: usize) -> Result<Vec<TxRecord>> {
        let _guard = self.locks.acquire(&self.lock_name())?;
        let mut records = self.read_records()?;
        let skip = records.len().saturating_sub(n);
        records.drain(..skip);
        Ok(records)
    }
}
