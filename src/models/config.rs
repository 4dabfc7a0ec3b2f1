// 缓存引擎配置结构，放在 models 以便在库和二进制之间共享
use crate::data::{CacheError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 日志输出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// 日志目录（文件输出时使用，缺省为缓存目录下的 logs）
    pub file_path: Option<String>,
}

/// 元数据存储模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// 元数据存关系表，负载按大小在行与文件之间路由
    #[default]
    Hybrid,
    /// 每个条目一个文件（元数据 + 负载）
    File,
}

/// 跨进程锁实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// 基于锁文件（fs2），跨进程互斥
    #[default]
    File,
    /// 进程内命名锁
    Local,
}

/// 缓存引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// 缓存文件根目录（负载文件、锁文件、统计文件）
    pub cache_dir: PathBuf,
    pub store_mode: StoreMode,
    pub lock_mode: LockMode,
    /// 编码后负载不超过该字节数时存入关系表行，否则落盘
    pub row_payload_threshold: usize,
    /// 高水位：条目总数上限
    pub max_entries: usize,
    /// 低水位 = 高水位 × 该比例
    pub low_water_ratio: f64,
    /// 每次请求触发维护的概率
    pub maintenance_probability: f64,
    /// 事务日志最大记录数
    pub max_log_records: usize,
    /// "是否可缓存" 判定的记忆容量
    pub memo_capacity: usize,
    /// 缓存键是否混入调用点与描述
    pub key_includes_call_site: bool,
    pub log: LogConfig,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            store_mode: StoreMode::Hybrid,
            lock_mode: LockMode::File,
            row_payload_threshold: 32 * 1024,
            max_entries: 2000,
            low_water_ratio: 0.75,
            maintenance_probability: 0.01,
            max_log_records: 5000,
            memo_capacity: 1024,
            key_includes_call_site: false,
            log: LogConfig::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sql-result-cache")
}

/// 参与签名的字段：变更后已有缓存结构不再可用
#[derive(Serialize)]
struct SignatureFields<'a> {
    cache_dir: &'a Path,
    store_mode: StoreMode,
    key_includes_call_site: bool,
}

impl CacheSettings {
    /// 从 TOML 文件加载配置（缺失字段使用默认值）
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
        let settings: CacheSettings = toml::from_str(&content)
            .map_err(|e| CacheError::Config(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Config("max_entries 必须大于 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.low_water_ratio) {
            return Err(CacheError::Config(format!(
                "low_water_ratio 必须在 [0, 1] 内: {}",
                self.low_water_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.maintenance_probability) {
            return Err(CacheError::Config(format!(
                "maintenance_probability 必须在 [0, 1] 内: {}",
                self.maintenance_probability
            )));
        }
        if self.max_log_records == 0 {
            return Err(CacheError::Config("max_log_records 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 低水位条目数
    pub fn low_water_mark(&self) -> usize {
        (self.max_entries as f64 * self.low_water_ratio).floor() as usize
    }

    /// 配置签名（SHA-256），用于维护入口判断是否需要重建
    pub fn signature(&self) -> String {
        let fields = SignatureFields {
            cache_dir: &self.cache_dir,
            store_mode: self.store_mode,
            key_includes_call_site: self.key_includes_call_site,
        };
        let canonical = serde_json::to_string(&fields).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// 锁文件目录
    pub fn lock_dir(&self) -> PathBuf {
        self.cache_dir.join("locks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert_eq!(settings.store_mode, StoreMode::Hybrid);
        assert_eq!(settings.max_entries, 2000);
        assert_eq!(settings.low_water_mark(), 1500);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(
            &path,
            r#"
cache_dir = "/tmp/qc"
store_mode = "file"
max_entries = 10

[log]
level = "debug"
output = "both"
"#,
        )
        .unwrap();

        let settings = CacheSettings::load(&path).unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/qc"));
        assert_eq!(settings.store_mode, StoreMode::File);
        assert_eq!(settings.max_entries, 10);
        assert_eq!(settings.low_water_mark(), 7);
        assert_eq!(settings.log.level, LogLevel::Debug);
        assert_eq!(settings.log.output, LogOutput::Both);
        assert_eq!(settings.row_payload_threshold, 32 * 1024);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(&path, "low_water_ratio = 1.5\n").unwrap();
        assert!(matches!(
            CacheSettings::load(&path),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_signature_tracks_structural_fields_only() {
        let base = CacheSettings::default();

        let mut tuned = base.clone();
        tuned.max_entries = 5;
        tuned.maintenance_probability = 0.5;
        assert_eq!(base.signature(), tuned.signature());

        let mut restructured = base.clone();
        restructured.store_mode = StoreMode::File;
        assert_ne!(base.signature(), restructured.signature());
        assert_eq!(base.signature().len(), 64);
    }
}
