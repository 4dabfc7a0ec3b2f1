//! 缓存条目元数据
//!
//! 一条记录对应一个不同的缓存查询。`db_stats` 在每次数据库刷新时更新，
//! `cache_stats` 在每次缓存命中时更新，两者的 `impression_count` 只增不减。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 缓存命中侧统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessStats {
    pub create_time: i64,
    pub last_access_time: i64,
    pub impression_count: u64,
}

impl AccessStats {
    /// 记录一次访问
    pub fn record(&mut self, now: i64) {
        if self.impression_count == 0 && self.create_time == 0 {
            self.create_time = now;
        }
        self.last_access_time = now;
        self.impression_count += 1;
    }
}

/// 数据库执行侧统计（含执行耗时的累积移动平均）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DbStats {
    pub create_time: i64,
    pub last_access_time: i64,
    pub impression_count: u64,
    /// 数据库执行耗时的累积移动平均（毫秒）
    pub avg_cost_ms: f64,
}

impl DbStats {
    /// 记录一次数据库执行
    ///
    /// 平均值按 `(新样本 + 旧平均 × 旧次数) / 新次数` 计算。
    pub fn record(&mut self, now: i64, sample_ms: f64) {
        if self.impression_count == 0 && self.create_time == 0 {
            self.create_time = now;
        }
        self.last_access_time = now;
        let old_count = self.impression_count as f64;
        self.impression_count += 1;
        self.avg_cost_ms = (sample_ms + self.avg_cost_ms * old_count) / self.impression_count as f64;
    }
}

/// 负载所在的后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadLocation {
    /// 与元数据同存于关系表行
    Row,
    /// 独立文件
    File,
}

impl PayloadLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadLocation::Row => "row",
            PayloadLocation::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "row" => Some(PayloadLocation::Row),
            "file" => Some(PayloadLocation::File),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 缓存条目元数据（不含负载）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub key: String,
    pub sql: String,
    #[serde(default)]
    pub description: String,
    /// 语句读取的表，非空
    pub tables: Vec<String>,
    pub db_stats: DbStats,
    pub cache_stats: AccessStats,
}

impl CacheEntryMeta {
    pub fn new(key: String, sql: String, description: String, tables: Vec<String>) -> Self {
        Self {
            key,
            sql,
            description,
            tables,
            db_stats: DbStats::default(),
            cache_stats: AccessStats::default(),
        }
    }

    /// 表名的 CSV 形式（用于持久化）
    pub fn tables_csv(&self) -> String {
        self.tables.join(",")
    }

    /// 从 CSV 解析表名
    pub fn parse_tables_csv(csv: &str) -> Vec<String> {
        csv.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// 最近一次访问（数据库或缓存）
    pub fn last_access_time(&self) -> i64 {
        self.db_stats
            .last_access_time
            .max(self.cache_stats.last_access_time)
    }
}
