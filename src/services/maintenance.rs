//! 维护入口
//!
//! 比较缓存目录下 `maintenance.json` 中记录的配置签名与源签名：
//! 不一致（或文件不存在）时删除并重建所有已注册连接的缓存结构，
//! 随后对每个连接执行一次淘汰。重复执行是幂等的。

use crate::connectors::METADATA_COLUMNS;
use crate::data::codec::FORMAT_VERSION;
use crate::data::lock::with_lock;
use crate::data::{CacheError, Result};
use crate::services::registry::CacheRegistry;
use crate::services::stats::EvictionReport;
use crate::utils::{atomic_write, sha256_hex};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const SIGNATURE_FILE: &str = "maintenance.json";

/// 签名比对与重建的锁名（与各命名空间的淘汰锁 `evict:{ns}` 不同前缀）
const SIGNATURE_LOCK: &str = "maintenance-signature";

/// 已记录的签名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSignature {
    pub config_signature: String,
    pub source_signature: String,
}

/// 维护结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    /// 是否因签名不一致重建了缓存结构
    pub rebuilt: bool,
    /// 每个命名空间的淘汰结果
    pub evictions: Vec<(String, EvictionReport)>,
}

/// 源签名：缓存结构与负载格式的版本
pub fn source_signature() -> String {
    let source = format!(
        "{}|{}|{}",
        env!("CARGO_PKG_VERSION"),
        FORMAT_VERSION,
        METADATA_COLUMNS.join(",")
    );
    sha256_hex(source.as_bytes())
}

fn signature_path(registry: &CacheRegistry) -> PathBuf {
    registry.settings().cache_dir.join(SIGNATURE_FILE)
}

/// 读取已记录的签名（不存在或损坏时为 None）
pub fn stored_signature(registry: &CacheRegistry) -> Result<Option<MaintenanceSignature>> {
    let path = signature_path(registry);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io(path, e)),
    };
    Ok(serde_json::from_str(&content).ok())
}

/// 执行维护
pub fn run(registry: &CacheRegistry) -> Result<MaintenanceReport> {
    with_lock(registry.locks().as_ref(), SIGNATURE_LOCK, || {
        let current = MaintenanceSignature {
            config_signature: registry.settings().signature(),
            source_signature: source_signature(),
        };
        let stored = stored_signature(registry)?;
        let rebuilt = stored.as_ref() != Some(&current);

        for cache in registry.caches() {
            let store = cache.store();
            if rebuilt {
                store.drop_schema()?;
                cache.detector().table_times().clear()?;
            }
            store.ensure_schema()?;
        }

        if rebuilt {
            let path = signature_path(registry);
            atomic_write(&path, &serde_json::to_vec_pretty(&current)?)?;
            tracing::info!(
                namespaces = ?registry.namespaces(),
                previous = ?stored,
                "签名不一致，已重建缓存结构"
            );
        }

        let mut evictions = Vec::new();
        for cache in registry.caches() {
            let report = cache.maintain()?;
            evictions.push((cache.store().namespace().to_string(), report));
        }

        Ok(MaintenanceReport { rebuilt, evictions })
    })
}
