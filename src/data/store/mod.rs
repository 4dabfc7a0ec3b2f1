//! 双后端存储
//!
//! 每个目标连接拥有独立的命名空间（元数据表 `qc_cache_{ns}`、文件前缀 `{ns}_`）。
//!
//! 混合模式下元数据始终存于关系表，负载按编码后大小路由：
//! 不超过阈值时与元数据同行存放，否则写入独立文件。同一键跨越阈值时负载会被
//! 迁移而不是复制：
//!
//! - 行 → 文件：先原子写入文件，再在同一条 UPDATE 中切换 `location` 并清空行内负载
//! - 文件 → 行：先提交行内负载，再删除旧文件
//!
//! 所有读-改-写都在条目锁 `entry:{ns}:{key}` 内完成，`fetch` 也持有同一把锁，
//! 因此不会观察到两份负载或零份负载。
//!
//! 文件模式下每个条目一个文件，包含元数据与负载。

mod file;
mod row;

use crate::connectors::DbConnector;
use crate::data::lock::LockProvider;
use crate::data::Result;
use crate::models::{CacheEntryMeta, CacheSettings, PayloadLocation, StoreMode};
use crate::utils::sanitize_identifier;
use file::{EntryFile, FileBackend};
use row::RowBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 读出的缓存条目
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub meta: CacheEntryMeta,
    pub location: PayloadLocation,
    /// 编码后的负载（见 `codec::encode_result_set`）
    pub payload: String,
}

pub struct CacheStore {
    locks: Arc<dyn LockProvider>,
    mode: StoreMode,
    namespace: String,
    threshold: usize,
    rows: RowBackend,
    files: FileBackend,
}

impl CacheStore {
    /// 为一个目标连接创建存储
    ///
    /// `namespace` 通常是连接标识，会被规整为只含字母数字和下划线。
    pub fn new(
        connector: Arc<dyn DbConnector>,
        locks: Arc<dyn LockProvider>,
        settings: &CacheSettings,
        namespace: &str,
    ) -> Result<Self> {
        let namespace = sanitize_identifier(namespace);
        let files = FileBackend::new(settings.cache_dir.join("entries"), namespace.clone())?;
        let rows = RowBackend::new(connector, format!("qc_cache_{namespace}"));
        Ok(Self {
            locks,
            mode: settings.store_mode,
            namespace,
            threshold: settings.row_payload_threshold,
            rows,
            files,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// 元数据表名（仅混合模式使用）
    pub fn table_name(&self) -> &str {
        self.rows.table()
    }

    /// 负载/条目文件所在目录
    pub fn file_dir(&self) -> &Path {
        self.files.dir()
    }

    pub fn payload_path(&self, key: &str) -> PathBuf {
        self.files.payload_path(key)
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.files.entry_path(key)
    }

    /// 条目锁名
    pub fn entry_lock(&self, key: &str) -> String {
        format!("entry:{}:{key}", self.namespace)
    }

    /// 按编码后大小选择后端
    pub fn route(&self, payload_len: usize) -> PayloadLocation {
        match self.mode {
            StoreMode::File => PayloadLocation::File,
            StoreMode::Hybrid if payload_len <= self.threshold => PayloadLocation::Row,
            StoreMode::Hybrid => PayloadLocation::File,
        }
    }

    fn schema_lock(&self) -> String {
        format!("schema:{}", self.namespace)
    }

    /// 创建缓存结构（幂等，多个进程同时调用时串行）
    pub fn ensure_schema(&self) -> Result<()> {
        if self.mode == StoreMode::Hybrid {
            let _guard = self.locks.acquire(&self.schema_lock())?;
            self.rows.ensure_schema()?;
        }
        Ok(())
    }

    /// 删除缓存结构及本命名空间的全部文件
    pub fn drop_schema(&self) -> Result<()> {
        let _guard = self.locks.acquire(&self.schema_lock())?;
        if self.mode == StoreMode::Hybrid {
            self.rows.drop_schema()?;
        }
        let removed = self.files.clear()?;
        tracing::info!(namespace = %self.namespace, removed_files = removed, "已删除缓存结构");
        Ok(())
    }

    /// 读取条目（元数据 + 负载）
    pub fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        let _guard = self.locks.acquire(&self.entry_lock(key))?;
        self.fetch_locked(key)
    }

    fn fetch_locked(&self, key: &str) -> Result<Option<StoredEntry>> {
        match self.mode {
            StoreMode::File => Ok(self.files.read_entry(key)?.map(|entry| StoredEntry {
                meta: entry.meta,
                location: PayloadLocation::File,
                payload: entry.payload,
            })),
            StoreMode::Hybrid => {
                let Some(row) = self.rows.select(key, true)? else {
                    return Ok(None);
                };
                let payload = match row.location {
                    PayloadLocation::Row => row.payload,
                    PayloadLocation::File => self.files.read_payload(key)?,
                };
                match payload {
                    Some(payload) => Ok(Some(StoredEntry {
                        meta: row.meta,
                        location: row.location,
                        payload,
                    })),
                    None => {
                        tracing::warn!(
                            namespace = %self.namespace,
                            key = %key,
                            location = %row.location,
                            "条目负载缺失，按未缓存处理"
                        );
                        Ok(None)
                    }
                }
            }
        }
    }

    /// 读取元数据（不读负载）
    fn meta_locked(&self, key: &str) -> Result<Option<(CacheEntryMeta, PayloadLocation)>> {
        match self.mode {
            StoreMode::File => Ok(self
                .files
                .read_entry(key)?
                .map(|entry| (entry.meta, PayloadLocation::File))),
            StoreMode::Hybrid => Ok(self
                .rows
                .select(key, false)?
                .map(|row| (row.meta, row.location))),
        }
    }

    /// 写入条目（覆盖已有内容），返回负载所在后端
    pub fn store(&self, meta: &CacheEntryMeta, payload: &str) -> Result<PayloadLocation> {
        let _guard = self.locks.acquire(&self.entry_lock(&meta.key))?;
        let previous = self.meta_locked(&meta.key)?.map(|(_, location)| location);
        self.write_locked(meta, payload, previous)
    }

    /// 在条目锁内基于旧元数据构造新元数据并写入负载
    ///
    /// 并发的 "未命中 → 写入" 在锁内串行，最后一个写入者生效。
    pub fn upsert<F>(&self, key: &str, payload: &str, build: F) -> Result<(CacheEntryMeta, PayloadLocation)>
    where
        F: FnOnce(Option<CacheEntryMeta>) -> CacheEntryMeta,
    {
        let _guard = self.locks.acquire(&self.entry_lock(key))?;
        let (previous_meta, previous_location) = match self.meta_locked(key)? {
            Some((meta, location)) => (Some(meta), Some(location)),
            None => (None, None),
        };
        let mut meta = build(previous_meta);
        meta.key = key.to_string();
        let location = self.write_locked(&meta, payload, previous_location)?;
        Ok((meta, location))
    }

    /// 在条目锁内修改元数据（负载不变）
    ///
    /// 条目不存在时返回 `None`。
    pub fn update_meta<F>(&self, key: &str, update: F) -> Result<Option<CacheEntryMeta>>
    where
        F: FnOnce(&mut CacheEntryMeta),
    {
        let _guard = self.locks.acquire(&self.entry_lock(key))?;
        match self.mode {
            StoreMode::File => {
                let Some(mut entry) = self.files.read_entry(key)? else {
                    return Ok(None);
                };
                update(&mut entry.meta);
                self.files.write_entry(&entry)?;
                Ok(Some(entry.meta))
            }
            StoreMode::Hybrid => {
                let Some(row) = self.rows.select(key, false)? else {
                    return Ok(None);
                };
                let mut meta = row.meta;
                update(&mut meta);
                self.rows.update_stats(&meta)?;
                Ok(Some(meta))
            }
        }
    }

    fn write_locked(
        &self,
        meta: &CacheEntryMeta,
        payload: &str,
        previous: Option<PayloadLocation>,
    ) -> Result<PayloadLocation> {
        let key = meta.key.as_str();
        let target = self.route(payload.len());

        if self.mode == StoreMode::File {
            self.files.write_entry(&EntryFile {
                meta: meta.clone(),
                payload: payload.to_string(),
            })?;
            return Ok(PayloadLocation::File);
        }

        let exists = previous.is_some();
        match target {
            PayloadLocation::Row => {
                self.rows.write(meta, PayloadLocation::Row, Some(payload), exists)?;
                if self.files.remove_payload(key)? {
                    tracing::debug!(namespace = %self.namespace, key = %key, "负载已从文件迁移到行");
                }
            }
            PayloadLocation::File => {
                self.files.write_payload(key, payload)?;
                if let Err(e) = self.rows.write(meta, PayloadLocation::File, None, exists) {
                    // 行未切换时新文件不可见，清理掉避免孤儿
                    if previous != Some(PayloadLocation::File) {
                        let _ = self.files.remove_payload(key);
                    }
                    return Err(e);
                }
                if previous == Some(PayloadLocation::Row) {
                    tracing::debug!(namespace = %self.namespace, key = %key, "负载已从行迁移到文件");
                }
            }
        }
        Ok(target)
    }

    /// 删除条目（元数据与负载）
    pub fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.locks.acquire(&self.entry_lock(key))?;
        match self.mode {
            StoreMode::File => self.files.remove_entry(key),
            StoreMode::Hybrid => {
                let deleted = self.rows.delete(key)?;
                let removed_file = self.files.remove_payload(key)?;
                Ok(deleted || removed_file)
            }
        }
    }

    /// 全部条目元数据
    pub fn list(&self) -> Result<Vec<CacheEntryMeta>> {
        match self.mode {
            StoreMode::File => self.files.list_entries(),
            StoreMode::Hybrid => self.rows.list(),
        }
    }

    /// 条目数
    pub fn count(&self) -> Result<usize> {
        match self.mode {
            StoreMode::File => Ok(self.files.keys(file::ENTRY_EXT)?.len()),
            StoreMode::Hybrid => self.rows.count(),
        }
    }

    /// 清空本命名空间，返回删除的条目数
    pub fn clear(&self) -> Result<usize> {
        let removed = match self.mode {
            StoreMode::File => self.files.clear()?,
            StoreMode::Hybrid => {
                let rows = self.rows.clear()?;
                self.files.clear()?;
                rows
            }
        };
        tracing::info!(namespace = %self.namespace, removed = removed, "已清空缓存");
        Ok(removed)
    }
}
