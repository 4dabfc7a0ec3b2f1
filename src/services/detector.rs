//! 表变更检测
//!
//! 回答 "这些表自时间 T 以来是否变更"。引擎返回的时间先加上时钟偏差
//! （本地时间 − 数据库时间，每个连接首次使用时测量一次）再与 T 比较，
//! 变更时间严格大于 T 才算变更。
//!
//! 三种策略：
//! - `Live`: 直接使用引擎报告的时间
//! - `Volatile`: 引擎统计自启动后才有效；没有启动后的记录时回退到持久化值，
//!   持久化值早于启动时间则按启动时间计（启动前的窗口无从观测），
//!   完全没有记录时按当前时间计。与持久化值不同的结果会写回缓存
//! - `Unknown`: 所有表都视为已变更

use crate::connectors::{ChangeTimes, DbConnector};
use crate::data::Result;
use crate::services::table_times::TableTimestampCache;
use crate::utils::Clock;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// 检测结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// 所有表都未变更
    Unchanged,
    /// 这些表发生了变更
    Changed(Vec<String>),
    /// 引擎无法回答，视为全部变更
    Unknown,
}

impl Staleness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Staleness::Unchanged)
    }
}

pub struct ChangeDetector {
    connector: Arc<dyn DbConnector>,
    clock: Arc<dyn Clock>,
    table_times: TableTimestampCache,
    offset: Mutex<Option<i64>>,
}

impl ChangeDetector {
    pub fn new(
        connector: Arc<dyn DbConnector>,
        clock: Arc<dyn Clock>,
        table_times: TableTimestampCache,
    ) -> Self {
        Self {
            connector,
            clock,
            table_times,
            offset: Mutex::new(None),
        }
    }

    pub fn table_times(&self) -> &TableTimestampCache {
        &self.table_times
    }

    /// 时钟偏差（首次调用时测量并缓存）
    pub fn clock_offset(&self) -> Result<i64> {
        let mut cached = self
            .offset
            .lock()
            .map_err(|e| crate::data::CacheError::lock("clock-offset", e.to_string()))?;
        if let Some(offset) = *cached {
            return Ok(offset);
        }
        let offset = self.connector.clock_offset_seconds(self.clock.now())?;
        tracing::debug!(engine = %self.connector.engine(), offset = offset, "已测量数据库时钟偏差");
        *cached = Some(offset);
        Ok(offset)
    }

    /// 查询表的变更时间（已校正为本地时钟）
    ///
    /// `None` 表示引擎无法回答。
    pub fn change_times(&self, tables: &[String]) -> Result<Option<HashMap<String, i64>>> {
        let raw = self.connector.table_change_times(tables)?;
        match raw {
            ChangeTimes::Unknown => Ok(None),
            ChangeTimes::Live(times) => {
                let offset = self.clock_offset()?;
                Ok(Some(
                    times.into_iter().map(|(t, time)| (t, time + offset)).collect(),
                ))
            }
            ChangeTimes::Volatile {
                server_start,
                last_updates,
            } => {
                let offset = self.clock_offset()?;
                self.resolve_volatile(server_start + offset, last_updates, offset)
                    .map(Some)
            }
        }
    }

    fn resolve_volatile(
        &self,
        server_start: i64,
        last_updates: HashMap<String, Option<i64>>,
        offset: i64,
    ) -> Result<HashMap<String, i64>> {
        let persisted = self.table_times.load()?;
        let now = self.clock.now();

        let mut resolved = HashMap::with_capacity(last_updates.len());
        let mut observed = BTreeMap::new();
        for (table, native) in last_updates {
            let time = match (native, persisted.get(&table)) {
                (Some(native), _) => native + offset,
                (None, Some(&stored)) => stored.max(server_start),
                (None, None) => now,
            };
            if persisted.get(&table) != Some(&time) {
                observed.insert(table.clone(), time);
            }
            resolved.insert(table, time);
        }
        self.table_times.merge(&observed)?;
        Ok(resolved)
    }

    /// 判断表自 `since`（本地时间）以来是否变更
    pub fn changed_since(&self, tables: &[String], since: i64) -> Result<Staleness> {
        self.pass().changed_since(tables, since)
    }

    /// 开始一次检测，同一次检测内已解析的表不会重复查询
    pub fn pass(&self) -> DetectionPass<'_> {
        DetectionPass {
            detector: self,
            resolved: HashMap::new(),
            unknown: false,
        }
    }
}

/// 一次检测（按表记忆已解析的时间）
pub struct DetectionPass<'a> {
    detector: &'a ChangeDetector,
    resolved: HashMap<String, i64>,
    unknown: bool,
}

impl DetectionPass<'_> {
    pub fn changed_since(&mut self, tables: &[String], since: i64) -> Result<Staleness> {
        if self.unknown {
            return Ok(Staleness::Unknown);
        }

        let mut pending: Vec<String> = Vec::new();
        for table in tables {
            if !self.resolved.contains_key(table) && !pending.contains(table) {
                pending.push(table.clone());
            }
        }
        if !pending.is_empty() {
            match self.detector.change_times(&pending)? {
                Some(times) => {
                    for table in pending {
                        // 引擎漏报的表按当前时间计
                        let time = times
                            .get(&table)
                            .copied()
                            .unwrap_or_else(|| self.detector.clock.now());
                        self.resolved.insert(table, time);
                    }
                }
                None => {
                    self.unknown = true;
                    return Ok(Staleness::Unknown);
                }
            }
        }

        let changed: Vec<String> = tables
            .iter()
            .filter(|t| self.resolved.get(*t).is_some_and(|&time| time > since))
            .cloned()
            .collect();
        if changed.is_empty() {
            Ok(Staleness::Unchanged)
        } else {
            Ok(Staleness::Changed(changed))
        }
    }

    /// 本次检测中已解析的表数
    pub fn resolved_len(&self) -> usize {
        self.resolved.len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixtureConnector;
    use super::*;
    use crate::data::lock::LocalLockProvider;
    use crate::utils::ManualClock;
    use tempfile::TempDir;

    fn live(pairs: &[(&str, i64)]) -> ChangeTimes {
        ChangeTimes::Live(pairs.iter().map(|(t, v)| (t.to_string(), *v)).collect())
    }

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn detector(
        dir: &TempDir,
        connector: Arc<FixtureConnector>,
        clock: Arc<ManualClock>,
    ) -> ChangeDetector {
        let table_times =
            TableTimestampCache::new(dir.path(), "main", Arc::new(LocalLockProvider::new()));
        ChangeDetector::new(connector, clock, table_times)
    }

    #[test]
    fn test_clock_offset_applied_to_change_times() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(FixtureConnector::new(990, live(&[("orders", 500)])));
        let clock = Arc::new(ManualClock::new(1000));
        let detector = detector(&dir, connector, clock);

        assert_eq!(detector.clock_offset().unwrap(), 10);
        let times = detector.change_times(&tables(&["orders"])).unwrap().unwrap();
        assert_eq!(times["orders"], 510);
    }

    #[test]
    fn test_clock_offset_measured_once() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(FixtureConnector::new(990, live(&[])));
        let clock = Arc::new(ManualClock::new(1000));
        let detector = detector(&dir, connector.clone(), clock);

        assert_eq!(detector.clock_offset().unwrap(), 10);
        *connector.db_now.lock().unwrap() = 500;
        assert_eq!(detector.clock_offset().unwrap(), 10);
    }

    #[test]
    fn test_live_strictly_greater_is_changed() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(FixtureConnector::new(
            1000,
            live(&[("orders", 500), ("customers", 400)]),
        ));
        let detector = detector(&dir, connector, Arc::new(ManualClock::new(1000)));

        let both = tables(&["orders", "customers"]);
        assert_eq!(
            detector.changed_since(&both, 450).unwrap(),
            Staleness::Changed(vec!["orders".to_string()])
        );
        assert_eq!(detector.changed_since(&both, 500).unwrap(), Staleness::Unchanged);
        assert_eq!(
            detector.changed_since(&both, 399).unwrap(),
            Staleness::Changed(both.clone())
        );
    }

    #[test]
    fn test_unknown_strategy_forces_refresh() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(FixtureConnector::new(1000, ChangeTimes::Unknown));
        let detector = detector(&dir, connector, Arc::new(ManualClock::new(1000)));
        let result = detector.changed_since(&tables(&["orders"]), i64::MAX).unwrap();
        assert_eq!(result, Staleness::Unknown);
        assert!(!result.is_fresh());
    }

    #[test]
    fn test_volatile_falls_back_to_persisted_value() {
        let dir = TempDir::new().unwrap();
        let mut last_updates = HashMap::new();
        last_updates.insert("orders".to_string(), Some(900));
        last_updates.insert("customers".to_string(), None);
        let connector = Arc::new(FixtureConnector::new(
            1000,
            ChangeTimes::Volatile {
                server_start: 800,
                last_updates,
            },
        ));
        let clock = Arc::new(ManualClock::new(1000));
        let detector = detector(&dir, connector.clone(), clock.clone());

        // 首次：customers 没有任何记录，按当前时间计并持久化
        let times = detector
            .change_times(&tables(&["orders", "customers"]))
            .unwrap()
            .unwrap();
        assert_eq!(times["orders"], 900);
        assert_eq!(times["customers"], 1000);
        let persisted = detector.table_times().load().unwrap();
        assert_eq!(persisted["orders"], 900);
        assert_eq!(persisted["customers"], 1000);

        // 之后：回退到持久化值，而不是 "从未变更"
        clock.set(2000);
        assert_eq!(
            detector.changed_since(&tables(&["customers"]), 1500).unwrap(),
            Staleness::Unchanged
        );
        assert_eq!(
            detector.changed_since(&tables(&["customers"]), 999).unwrap(),
            Staleness::Changed(tables(&["customers"]))
        );
    }

    #[test]
    fn test_volatile_persisted_value_before_restart() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(5000));
        let mut last_updates = HashMap::new();
        last_updates.insert("orders".to_string(), None);
        let connector = Arc::new(FixtureConnector::new(
            5000,
            ChangeTimes::Volatile {
                server_start: 3000,
                last_updates,
            },
        ));
        let detector = detector(&dir, connector, clock);
        let mut seeded = BTreeMap::new();
        seeded.insert("orders".to_string(), 1000);
        detector.table_times().merge(&seeded).unwrap();

        // 重启前的窗口无法观测，按启动时间计
        let times = detector.change_times(&tables(&["orders"])).unwrap().unwrap();
        assert_eq!(times["orders"], 3000);
        assert_eq!(detector.table_times().load().unwrap()["orders"], 3000);
    }

    #[test]
    fn test_volatile_native_value_rewrites_cache() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(5000));
        let mut last_updates = HashMap::new();
        last_updates.insert("orders".to_string(), Some(4500));
        let connector = Arc::new(FixtureConnector::new(
            4990,
            ChangeTimes::Volatile {
                server_start: 3000,
                last_updates,
            },
        ));
        let detector = detector(&dir, connector, clock);
        let times = detector.change_times(&tables(&["orders"])).unwrap().unwrap();
        // 偏差 10
        assert_eq!(times["orders"], 4510);
        assert_eq!(detector.table_times().load().unwrap()["orders"], 4510);
    }

    #[test]
    fn test_pass_memoizes_resolved_tables() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(FixtureConnector::new(
            1000,
            live(&[("a", 10), ("b", 20), ("c", 30)]),
        ));
        let detector = detector(&dir, connector.clone(), Arc::new(ManualClock::new(1000)));

        let mut pass = detector.pass();
        pass.changed_since(&tables(&["a", "b"]), 15).unwrap();
        pass.changed_since(&tables(&["b", "a"]), 25).unwrap();
        assert_eq!(connector.lookups(), 1);
        assert_eq!(
            pass.changed_since(&tables(&["b", "c"]), 25).unwrap(),
            Staleness::Changed(tables(&["c"]))
        );
        assert_eq!(connector.lookups(), 2);
        assert_eq!(pass.resolved_len(), 3);
    }
}
