//! 持久化的表时间戳缓存
//!
//! 仅供变更统计会随服务重启清零的引擎使用。记录每张表最后一次已知的变更时间
//! （已校正为本地时钟），以 JSON 文件保存在缓存目录下，读-改-写在
//! `table-times:{ns}` 锁内完成。

use crate::data::lock::LockProvider;
use crate::data::{CacheError, Result};
use crate::utils::atomic_write;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct TableTimestampCache {
    path: PathBuf,
    resource: String,
    locks: Arc<dyn LockProvider>,
}

impl TableTimestampCache {
    pub fn new(cache_dir: &Path, namespace: &str, locks: Arc<dyn LockProvider>) -> Self {
        Self {
            path: cache_dir.join(format!("table_times_{namespace}.json")),
            resource: format!("table-times:{namespace}"),
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部记录（文件不存在时为空）
    pub fn load(&self) -> Result<BTreeMap<String, i64>> {
        let _guard = self.locks.acquire(&self.resource)?;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<BTreeMap<String, i64>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(CacheError::io(&self.path, e)),
        };
        match serde_json::from_str(&content) {
            Ok(times) => Ok(times),
            Err(e) => {
                tracing::warn!(path = ?self.path, error = ?e, "表时间戳缓存损坏，重新开始记录");
                Ok(BTreeMap::new())
            }
        }
    }

    /// 合并观测到的时间戳，只有与已存值不同时才重写文件
    ///
    /// 返回是否发生了写入。
    pub fn merge(&self, observed: &BTreeMap<String, i64>) -> Result<bool> {
        if observed.is_empty() {
            return Ok(false);
        }
        let _guard = self.locks.acquire(&self.resource)?;
        let mut times = self.read_unlocked()?;

        let mut changed = false;
        for (table, &time) in observed {
            if times.get(table) != Some(&time) {
                times.insert(table.clone(), time);
                changed = true;
            }
        }
        if changed {
            let content = serde_json::to_vec_pretty(&times)?;
            atomic_write(&self.path, &content)?;
            tracing::debug!(path = ?self.path, tables = observed.len(), "已更新表时间戳缓存");
        }
        Ok(changed)
    }

    /// 删除缓存文件
    pub fn clear(&self) -> Result<()> {
        let _guard = self.locks.acquire(&self.resource)?;
        crate::utils::remove_if_exists(&self.path)?;
        Ok(())
    }
}
