//! 查询编排
//!
//! 每次查询从已存元数据重新推导状态，内存中不保存状态机实例：
//!
//! ```text
//! 不可缓存 ─────────────────────────────────────────────> NotCacheable
//! 未见过 (Unseen) ── 执行 → 写入 → 记录 db ──────────────> 返回
//! 已缓存 ── 表未变更 (Fresh) ── 解码 → 命中统计 → 记录 qc ─> 返回
//!        └─ 表已变更/未知 (Stale) ── 执行 → 重写 → 记录 db ─> 返回
//! ```
//!
//! 数据库执行不串行化，只有元数据/负载的提交在条目锁内完成；
//! 并发未命中会各自执行一次查询，最后一个写入者生效。
//! 连接器错误原样向上传递，不吞掉也不重试。

use crate::connectors::DbConnector;
use crate::data::cache::{derive_key, extract_tables, normalize_sql, EligibilityMemo};
use crate::data::codec::{decode_result_set, encode_result_set};
use crate::data::store::{CacheStore, StoredEntry};
use crate::data::Result;
use crate::models::{CacheEntryMeta, CacheSettings, PayloadLocation, ResultSet};
use crate::services::detector::{ChangeDetector, Staleness};
use crate::services::stats::{importance, EvictionReport, Outcome, StatsManager, TxRecord};
use crate::utils::Clock;
use std::sync::Arc;
use std::time::Instant;

/// 变更时间的精度（秒）
///
/// 与刷新同一秒提交的修改无法与刷新时间区分，比较基准向前推一个精度单位，
/// 这类修改总会触发一次刷新。
const CHANGE_TIME_RESOLUTION: i64 = 1;

/// 条目的变更比较基准
fn change_baseline(meta: &CacheEntryMeta) -> i64 {
    meta.db_stats.last_access_time - CHANGE_TIME_RESOLUTION
}

/// 查询请求
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub sql: String,
    /// 显式指定的表（跳过可缓存性判断与表名提取）
    pub tables: Option<Vec<String>>,
    pub call_site: Option<String>,
    pub description: Option<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn call_site(mut self, site: impl Into<String>) -> Self {
        self.call_site = Some(site.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// 本次查询所处的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// 首次出现
    Unseen,
    /// 缓存有效，直接返回
    Fresh,
    /// 表已变更（或无法判断），重新执行
    Stale,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Unseen => "unseen",
            CacheState::Fresh => "fresh",
            CacheState::Stale => "stale",
        }
    }
}

/// 已服务的查询
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub result: ResultSet,
    pub state: CacheState,
    pub key: String,
    /// 负载当前所在后端
    pub location: PayloadLocation,
    pub elapsed_ms: f64,
}

/// 查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Served(CachedQuery),
    /// 语句不可缓存，调用方应直接查询数据库
    NotCacheable,
}

impl QueryResponse {
    pub fn served(self) -> Option<CachedQuery> {
        match self {
            QueryResponse::Served(q) => Some(q),
            QueryResponse::NotCacheable => None,
        }
    }
}

/// 条目概况（供命令行与监控展示）
#[derive(Debug, Clone, PartialEq)]
pub struct EntryReport {
    pub meta: CacheEntryMeta,
    pub importance: f64,
    pub staleness: Staleness,
}

pub struct QueryCache {
    connector: Arc<dyn DbConnector>,
    store: CacheStore,
    detector: ChangeDetector,
    stats: Arc<StatsManager>,
    memo: EligibilityMemo,
    clock: Arc<dyn Clock>,
    key_includes_call_site: bool,
}

impl QueryCache {
    pub fn new(
        connector: Arc<dyn DbConnector>,
        store: CacheStore,
        detector: ChangeDetector,
        stats: Arc<StatsManager>,
        clock: Arc<dyn Clock>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            connector,
            store,
            detector,
            stats,
            memo: EligibilityMemo::new(settings.memo_capacity),
            clock,
            key_includes_call_site: settings.key_includes_call_site,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn stats(&self) -> &StatsManager {
        &self.stats
    }

    pub fn connector(&self) -> &Arc<dyn DbConnector> {
        &self.connector
    }

    /// 请求对应的缓存键
    pub fn key_for(&self, request: &QueryRequest) -> String {
        let normalized = normalize_sql(&request.sql);
        if self.key_includes_call_site {
            derive_key(
                &normalized,
                request.call_site.as_deref(),
                request.description.as_deref(),
            )
        } else {
            derive_key(&normalized, None, None)
        }
    }

    /// 解析请求涉及的表；不可缓存时返回 None
    fn resolve_tables(&self, request: &QueryRequest) -> Option<Vec<String>> {
        match &request.tables {
            Some(explicit) => {
                let mut tables: Vec<String> = Vec::with_capacity(explicit.len());
                for t in explicit.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
                    if !tables.iter().any(|x| x == t) {
                        tables.push(t.to_string());
                    }
                }
                (!tables.is_empty()).then_some(tables)
            }
            None => {
                if !self.memo.check(&request.sql) {
                    return None;
                }
                extract_tables(&request.sql).filter(|t| !t.is_empty())
            }
        }
    }

    /// 执行一次查询
    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let Some(tables) = self.resolve_tables(request) else {
            tracing::debug!(sql = %request.sql, "语句不可缓存");
            return Ok(QueryResponse::NotCacheable);
        };
        let key = self.key_for(request);
        let started = Instant::now();

        let served = match self.store.fetch(&key)? {
            None => self.refresh(request, &key, tables, CacheState::Unseen, started)?,
            Some(entry) => {
                let staleness = self
                    .detector
                    .changed_since(&entry.meta.tables, change_baseline(&entry.meta))?;
                match staleness {
                    Staleness::Unchanged => match self.serve_cached(request, &key, entry, started)? {
                        Some(served) => served,
                        None => self.refresh(request, &key, tables, CacheState::Stale, started)?,
                    },
                    Staleness::Changed(changed) => {
                        tracing::debug!(key = %key, tables = ?changed, "表已变更，刷新缓存");
                        self.refresh(request, &key, tables, CacheState::Stale, started)?
                    }
                    Staleness::Unknown => {
                        tracing::debug!(key = %key, "无法判断表变更，刷新缓存");
                        self.refresh(request, &key, tables, CacheState::Stale, started)?
                    }
                }
            }
        };

        self.maybe_maintain(served.state)?;
        Ok(QueryResponse::Served(served))
    }

    fn serve_cached(
        &self,
        request: &QueryRequest,
        key: &str,
        entry: StoredEntry,
        started: Instant,
    ) -> Result<Option<CachedQuery>> {
        let result = match decode_result_set(&entry.payload) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(key = %key, error = ?e, "缓存负载无法解码，按过期处理");
                return Ok(None);
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let updated = self
            .store
            .update_meta(key, |meta| self.stats.record_hit(meta))?;
        let avg_cost = updated
            .as_ref()
            .map(|m| m.db_stats.avg_cost_ms)
            .unwrap_or(entry.meta.db_stats.avg_cost_ms);

        self.stats.log_query(&TxRecord {
            time: self.clock.now(),
            outcome: Outcome::Cache,
            cache_ms: Some(elapsed_ms),
            db_ms: Some(avg_cost),
            sql: request.sql.clone(),
        })?;
        tracing::debug!(key = %key, location = %entry.location, rows = result.len(), "缓存命中");

        Ok(Some(CachedQuery {
            result,
            state: CacheState::Fresh,
            key: key.to_string(),
            location: entry.location,
            elapsed_ms,
        }))
    }

    fn refresh(
        &self,
        request: &QueryRequest,
        key: &str,
        tables: Vec<String>,
        state: CacheState,
        started: Instant,
    ) -> Result<CachedQuery> {
        // 先让引擎开始追踪这些表，再取执行时间：
        // 执行期间提交的修改必须晚于该时间才能被识别为变更
        self.detector.change_times(&tables)?;
        let executed_at = self.clock.now();
        let db_started = Instant::now();
        let result = self.connector.execute_read(&request.sql)?;
        let cost_ms = db_started.elapsed().as_secs_f64() * 1000.0;

        let payload = encode_result_set(&result)?;
        let description = request.description.clone().unwrap_or_default();
        let (_, location) = self.store.upsert(key, &payload, |previous| {
            let mut meta = match previous {
                Some(mut meta) => {
                    meta.sql = request.sql.clone();
                    meta.description = description;
                    meta.tables = tables;
                    meta
                }
                None => CacheEntryMeta::new(key.to_string(), request.sql.clone(), description, tables),
            };
            self.stats.record_refresh(&mut meta, executed_at, cost_ms);
            meta
        })?;

        self.stats.log_query(&TxRecord {
            time: executed_at,
            outcome: Outcome::Db,
            cache_ms: None,
            db_ms: Some(cost_ms),
            sql: request.sql.clone(),
        })?;
        tracing::debug!(
            key = %key,
            state = state.as_str(),
            location = %location,
            rows = result.len(),
            cost_ms = cost_ms,
            "已从数据库刷新缓存"
        );

        Ok(CachedQuery {
            result,
            state,
            key: key.to_string(),
            location,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// 按概率或超过高水位时执行维护
    fn maybe_maintain(&self, state: CacheState) -> Result<Option<EvictionReport>> {
        let over_high_water =
            state == CacheState::Unseen && self.stats.over_high_water(self.store.count()?);
        if over_high_water || self.stats.roll_maintenance() {
            return self.maintain().map(Some);
        }
        Ok(None)
    }

    /// 立即执行一次维护
    pub fn maintain(&self) -> Result<EvictionReport> {
        self.stats.run_maintenance(&self.store)
    }

    /// 删除某条语句的缓存（按不含调用点的键）
    pub fn invalidate(&self, sql: &str) -> Result<bool> {
        let key = derive_key(&normalize_sql(sql), None, None);
        let removed = self.store.remove(&key)?;
        if removed {
            tracing::debug!(key = %key, "已失效缓存条目");
        }
        Ok(removed)
    }

    /// 清空本连接的全部缓存
    pub fn clear(&self) -> Result<usize> {
        self.store.clear()
    }

    /// 全部条目的重要度与新鲜度
    pub fn entries(&self) -> Result<Vec<EntryReport>> {
        let now = self.clock.now();
        let mut pass = self.detector.pass();
        let mut reports = Vec::new();
        for meta in self.store.list()? {
            let staleness = pass.changed_since(&meta.tables, change_baseline(&meta))?;
            reports.push(EntryReport {
                importance: importance(&meta, now),
                staleness,
                meta,
            });
        }
        reports.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(reports)
    }
}
