//! 统计与淘汰
//!
//! - 条目重要度评分（复用次数、最近访问、平均执行耗时）
//! - 事务日志与汇总统计（见 `txlog`）
//! - 维护：超过高水位或按概率触发，按重要度降序保留到低水位

pub mod txlog;

pub use txlog::{AggregateStats, Outcome, SlowestCase, TransactionLog, TxRecord};

use crate::data::lock::{with_lock, LockProvider};
use crate::data::store::CacheStore;
use crate::data::Result;
use crate::models::{CacheEntryMeta, CacheSettings};
use crate::utils::Clock;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;

/// 条目重要度（越高越值得保留）
///
/// 对缓存命中次数、平均执行耗时单调递增，对距上次访问的时长单调递减。
pub fn importance(meta: &CacheEntryMeta, now: i64) -> f64 {
    let hits = meta.cache_stats.impression_count as f64;
    let cost = meta.db_stats.avg_cost_ms.max(0.0);
    let idle_hours = (now - meta.last_access_time()).max(0) as f64 / 3600.0;
    (1.0 + hits.ln_1p()) * (1.0 + cost.ln_1p()) / (1.0 + idle_hours)
}

/// 一次维护的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub before: usize,
    pub evicted: Vec<String>,
    pub after: usize,
}

pub struct StatsManager {
    log: TransactionLog,
    locks: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
    high_water_mark: usize,
    low_water_mark: usize,
    maintenance_probability: f64,
}

impl StatsManager {
    pub fn new(settings: &CacheSettings, locks: Arc<dyn LockProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            log: TransactionLog::new(&settings.cache_dir, settings.max_log_records, locks.clone()),
            locks,
            clock,
            high_water_mark: settings.max_entries,
            low_water_mark: settings.low_water_mark(),
            maintenance_probability: settings.maintenance_probability,
        }
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    /// 数据库刷新后的统计更新
    pub fn record_refresh(&self, meta: &mut CacheEntryMeta, started_at: i64, cost_ms: f64) {
        meta.db_stats.record(started_at, cost_ms);
    }

    /// 缓存命中后的统计更新
    pub fn record_hit(&self, meta: &mut CacheEntryMeta) {
        meta.cache_stats.record(self.clock.now());
    }

    /// 记录一次查询
    pub fn log_query(&self, record: &TxRecord) -> Result<()> {
        self.log.append(record)
    }

    pub fn aggregate(&self) -> Result<AggregateStats> {
        self.log.aggregate()
    }

    pub fn recent_records(&self, n: usize) -> Result<Vec<TxRecord>> {
        self.log.recent(n)
    }

    /// 本次请求是否按概率触发维护
    pub fn roll_maintenance(&self) -> bool {
        let p = self.maintenance_probability;
        p > 0.0 && rand::thread_rng().gen_bool(p.min(1.0))
    }

    pub fn over_high_water(&self, count: usize) -> bool {
        count > self.high_water_mark
    }

    /// 维护：按重要度降序排列，删除低水位之后的条目
    pub fn run_maintenance(&self, store: &CacheStore) -> Result<EvictionReport> {
        let resource = format!("evict:{}", store.namespace());
        with_lock(self.locks.as_ref(), &resource, || self.evict_locked(store))
    }

    fn evict_locked(&self, store: &CacheStore) -> Result<EvictionReport> {
        let now = self.clock.now();
        let mut ranked: Vec<(f64, CacheEntryMeta)> = store
            .list()?
            .into_iter()
            .map(|meta| (importance(&meta, now), meta))
            .collect();
        let before = ranked.len();
        if before <= self.low_water_mark {
            return Ok(EvictionReport {
                before,
                evicted: Vec::new(),
                after: before,
            });
        }

        ranked.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .partial_cmp(a_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut evicted = Vec::with_capacity(before - self.low_water_mark);
        for (score, meta) in ranked.into_iter().skip(self.low_water_mark) {
            if store.remove(&meta.key)? {
                tracing::debug!(key = %meta.key, importance = score, "已淘汰缓存条目");
            }
            evicted.push(meta.key);
        }

        let after = before - evicted.len();
        tracing::info!(
            namespace = %store.namespace(),
            before = before,
            evicted = evicted.len(),
            after = after,
            "缓存维护完成"
        );
        Ok(EvictionReport {
            before,
            evicted,
            after,
        })
    }
}
