//! 缓存注册表
//!
//! 按连接标识管理每个目标连接的 `QueryCache`，共享锁服务、时钟与统计：
//! - 按标识复用实例（读锁快速路径 + 写锁双重检查）
//! - 每个连接独立的命名空间（元数据表、文件前缀、表时间戳缓存）
//! - 线程安全设计
//!
//! # 使用示例
//!
//! ```rust
//! use std::sync::Arc;
//! use crate::services::CacheRegistry;
//! use crate::connectors::SqliteConnector;
//!
//! let registry = CacheRegistry::new(settings)?;
//! let cache = registry.register("main", Arc::new(SqliteConnector::open(path)?))?;
//! let response = cache.query(&QueryRequest::new(sql))?;
//! ```

use crate::connectors::DbConnector;
use crate::data::lock::{FileLockProvider, LocalLockProvider, LockProvider};
use crate::data::store::CacheStore;
use crate::data::{CacheError, Result};
use crate::models::{CacheSettings, LockMode};
use crate::services::detector::ChangeDetector;
use crate::services::query_cache::QueryCache;
use crate::services::stats::StatsManager;
use crate::services::table_times::TableTimestampCache;
use crate::utils::{sanitize_identifier, Clock, SystemClock};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub struct CacheRegistry {
    settings: CacheSettings,
    locks: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
    stats: Arc<StatsManager>,
    caches: RwLock<BTreeMap<String, Arc<QueryCache>>>,
}

impl CacheRegistry {
    /// 按配置创建（系统时钟）
    pub fn new(settings: CacheSettings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// 指定时钟创建
    pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        settings.validate()?;
        std::fs::create_dir_all(&settings.cache_dir)
            .map_err(|e| CacheError::io(&settings.cache_dir, e))?;

        let locks: Arc<dyn LockProvider> = match settings.lock_mode {
            LockMode::File => Arc::new(FileLockProvider::new(settings.lock_dir())?),
            LockMode::Local => Arc::new(LocalLockProvider::new()),
        };
        let stats = Arc::new(StatsManager::new(&settings, locks.clone(), clock.clone()));

        Ok(Self {
            settings,
            locks,
            clock,
            stats,
            caches: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn locks(&self) -> &Arc<dyn LockProvider> {
        &self.locks
    }

    pub fn stats(&self) -> &Arc<StatsManager> {
        &self.stats
    }

    /// 注册目标连接（已注册时返回已有实例）
    pub fn register(&self, id: &str, connector: Arc<dyn DbConnector>) -> Result<Arc<QueryCache>> {
        let namespace = sanitize_identifier(id);

        // 读锁检查是否已存在
        {
            let caches = self
                .caches
                .read()
                .map_err(|e| CacheError::lock("registry", e.to_string()))?;
            if let Some(cache) = caches.get(&namespace) {
                return Ok(Arc::clone(cache));
            }
        }

        // 写锁创建
        let mut caches = self
            .caches
            .write()
            .map_err(|e| CacheError::lock("registry", e.to_string()))?;

        // 双重检查（避免并发创建）
        if let Some(cache) = caches.get(&namespace) {
            return Ok(Arc::clone(cache));
        }

        let store = CacheStore::new(connector.clone(), self.locks.clone(), &self.settings, &namespace)?;
        store.ensure_schema()?;
        let detector = ChangeDetector::new(
            connector.clone(),
            self.clock.clone(),
            TableTimestampCache::new(&self.settings.cache_dir, &namespace, self.locks.clone()),
        );
        let cache = Arc::new(QueryCache::new(
            connector.clone(),
            store,
            detector,
            self.stats.clone(),
            self.clock.clone(),
            &self.settings,
        ));

        tracing::info!(id = %id, namespace = %namespace, engine = %connector.engine(), "已注册缓存连接");
        caches.insert(namespace, Arc::clone(&cache));
        Ok(cache)
    }

    /// 获取已注册的连接
    pub fn get(&self, id: &str) -> Option<Arc<QueryCache>> {
        self.caches
            .read()
            .ok()
            .and_then(|caches| caches.get(&sanitize_identifier(id)).cloned())
    }

    /// 注销连接（不删除已缓存的数据）
    pub fn unregister(&self, id: &str) -> Result<bool> {
        let mut caches = self
            .caches
            .write()
            .map_err(|e| CacheError::lock("registry", e.to_string()))?;
        Ok(caches.remove(&sanitize_identifier(id)).is_some())
    }

    /// 已注册的命名空间
    pub fn namespaces(&self) -> Vec<String> {
        self.caches
            .read()
            .map(|caches| caches.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// 全部已注册实例
    pub fn caches(&self) -> Vec<Arc<QueryCache>> {
        self.caches
            .read()
            .map(|caches| caches.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::SqliteConnector;
    use crate::models::Value;
    use crate::services::query_cache::QueryRequest;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> CacheRegistry {
        CacheRegistry::new(CacheSettings {
            cache_dir: dir.path().join("cache"),
            ..CacheSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_register_reuses_instance() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let connector = Arc::new(SqliteConnector::open_in_memory().unwrap());

        let first = registry.register("prod-db", connector.clone()).unwrap();
        let second = registry.register("prod-db", connector).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let namespaces = registry.namespaces();
        assert_eq!(namespaces.len(), 1);
        assert!(namespaces[0].starts_with("prod_db_"));
        assert_eq!(first.store().table_name(), format!("qc_cache_{}", namespaces[0]));
        assert!(registry.get("prod-db").is_some());
    }

    #[test]
    fn test_similar_ids_get_separate_caches() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let sql = "SELECT p.name FROM people p JOIN teams t ON p.team = t.id";

        let mut caches = Vec::new();
        for (id, name) in [("主库", "alice"), ("从库", "bob"), ("db-1", "carol"), ("db_1", "dave")] {
            let connector = Arc::new(SqliteConnector::open_in_memory().unwrap());
            connector.execute_write("CREATE TABLE people (name TEXT, team INTEGER)").unwrap();
            connector.execute_write("CREATE TABLE teams (id INTEGER)").unwrap();
            connector
                .execute_write(&format!("INSERT INTO people VALUES ('{name}', 1)"))
                .unwrap();
            connector.execute_write("INSERT INTO teams VALUES (1)").unwrap();
            caches.push((registry.register(id, connector).unwrap(), name));
        }
        assert_eq!(registry.namespaces().len(), 4);

        for (cache, name) in &caches {
            let served = cache.query(&QueryRequest::new(sql)).unwrap().served().unwrap();
            assert_eq!(served.result.rows, vec![vec![Value::Text(name.to_string())]]);
        }
        assert!(!Arc::ptr_eq(&caches[0].0, &caches[1].0));
        assert!(!Arc::ptr_eq(&caches[2].0, &caches[3].0));
    }

    #[test]
    fn test_register_creates_schema() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let connector = Arc::new(SqliteConnector::open_in_memory().unwrap());
        registry.register("main", connector.clone()).unwrap();
        assert!(connector.table_exists("qc_cache_main").unwrap());
        assert!(dir.path().join("cache").join("locks").exists());
    }

    #[test]
    fn test_unregister() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry
            .register("a", Arc::new(SqliteConnector::open_in_memory().unwrap()))
            .unwrap();
        assert!(registry.unregister("a").unwrap());
        assert!(!registry.unregister("a").unwrap());
        assert!(registry.get("a").is_none());
        assert!(registry.caches().is_empty());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = TempDir::new().unwrap();
        let result = CacheRegistry::new(CacheSettings {
            cache_dir: dir.path().to_path_buf(),
            max_entries: 0,
            ..CacheSettings::default()
        });
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
