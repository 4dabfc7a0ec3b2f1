//! 文件后端
//!
//! - `{ns}_{key}.qcp`: 混合模式下溢出的负载（编码后的文本）
//! - `{ns}_{key}.qce`: 文件模式下的完整条目（元数据 + 负载，经 `codec::pack`）

use crate::data::codec;
use crate::data::{CacheError, Result};
use crate::models::CacheEntryMeta;
use crate::utils::{atomic_write, remove_if_exists};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub(super) const PAYLOAD_EXT: &str = "qcp";
pub(super) const ENTRY_EXT: &str = "qce";

/// 文件模式下的条目内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct EntryFile {
    pub meta: CacheEntryMeta,
    pub payload: String,
}

pub(super) struct FileBackend {
    dir: PathBuf,
    namespace: String,
}

impl FileBackend {
    pub fn new(dir: PathBuf, namespace: String) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(Self { dir, namespace })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}_{key}.{ext}", self.namespace))
    }

    pub fn payload_path(&self, key: &str) -> PathBuf {
        self.path_for(key, PAYLOAD_EXT)
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.path_for(key, ENTRY_EXT)
    }

    // ==================== 负载文件 ====================

    pub fn read_payload(&self, key: &str) -> Result<Option<String>> {
        let path = self.payload_path(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    pub fn write_payload(&self, key: &str, payload: &str) -> Result<()> {
        atomic_write(&self.payload_path(key), payload.as_bytes())
    }

    pub fn remove_payload(&self, key: &str) -> Result<bool> {
        remove_if_exists(&self.payload_path(key))
    }

    // ==================== 条目文件 ====================

    /// 读取条目文件；内容损坏时记录警告并视为不存在
    pub fn read_entry(&self, key: &str) -> Result<Option<EntryFile>> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        match codec::unpack::<EntryFile>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!(path = ?path, error = ?e, "条目文件损坏，按不存在处理");
                Ok(None)
            }
        }
    }

    pub fn write_entry(&self, entry: &EntryFile) -> Result<()> {
        let bytes = codec::pack(entry)?;
        atomic_write(&self.entry_path(&entry.meta.key), &bytes)
    }

    pub fn remove_entry(&self, key: &str) -> Result<bool> {
        remove_if_exists(&self.entry_path(key))
    }

    /// 本命名空间下指定扩展名的所有键
    pub fn keys(&self, ext: &str) -> Result<Vec<String>> {
        let read_dir = fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        let mut keys = Vec::new();
        for entry in read_dir.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(ext).and_then(|s| s.strip_suffix('.')) else {
                continue;
            };
            // 键是十六进制摘要，不含下划线；命名空间可以含下划线
            if let Some((ns, key)) = stem.rsplit_once('_') {
                if ns == self.namespace && !key.is_empty() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// 文件模式下的全部条目元数据
    pub fn list_entries(&self) -> Result<Vec<CacheEntryMeta>> {
        let mut metas = Vec::new();
        for key in self.keys(ENTRY_EXT)? {
            if let Some(entry) = self.read_entry(&key)? {
                metas.push(entry.meta);
            }
        }
        Ok(metas)
    }

    /// 删除本命名空间下的全部文件
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for ext in [PAYLOAD_EXT, ENTRY_EXT] {
            for key in self.keys(ext)? {
                if remove_if_exists(&self.path_for(&key, ext))? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keys_are_scoped_by_namespace() {
        let dir = TempDir::new().unwrap();
        let main = FileBackend::new(dir.path().to_path_buf(), "main".into()).unwrap();
        let main_v2 = FileBackend::new(dir.path().to_path_buf(), "main_v2".into()).unwrap();

        main.write_payload("aaa", "x").unwrap();
        main_v2.write_payload("bbb", "y").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"z").unwrap();

        assert_eq!(main.keys(PAYLOAD_EXT).unwrap(), vec!["aaa"]);
        assert_eq!(main_v2.keys(PAYLOAD_EXT).unwrap(), vec!["bbb"]);

        assert_eq!(main.clear().unwrap(), 1);
        assert_eq!(main_v2.read_payload("bbb").unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn test_corrupt_entry_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf(), "ns".into()).unwrap();
        fs::write(backend.entry_path("deadbeef"), b"not gzip").unwrap();
        assert!(backend.read_entry("deadbeef").unwrap().is_none());
        assert!(backend.list_entries().unwrap().is_empty());
    }
}
