//! 文件操作辅助函数
//!
//! 提供摘要计算、原子写入和文件名安全化等工具函数。

use crate::data::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 计算字节内容的 SHA256 哈希值（十六进制）
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// 原子写入文件
///
/// 先写入同目录下的临时文件并 `fsync`，再 `rename` 覆盖目标，
/// 读方只会看到旧内容或完整的新内容。
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let write_tmp = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()
    };
    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp_path);
        return Err(CacheError::io(&tmp_path, e));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        CacheError::io(path, e)
    })
}

/// 删除文件，文件不存在视为成功
///
/// 返回是否真的删除了文件。
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// 把任意标识转换为可用作文件名/表名后缀的形式（仅保留小写字母数字和下划线）
///
/// 已经合规的标识原样返回；否则在规整结果后追加原始标识的摘要，
/// 不同的原始标识（如 `db-1` 与 `db_1`、`主库` 与 `从库`）不会映射到同一结果。
/// 结果本身合规，重复调用不会再变化。
pub fn sanitize_identifier(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if !cleaned.is_empty() && cleaned == raw {
        return cleaned;
    }
    let base = if cleaned.is_empty() { "default" } else { cleaned.as_str() };
    format!("{base}_{}", &sha256_hex(raw.as_bytes())[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_hex() {
        let digest = sha256_hex(b"test content");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, sha256_hex(b"test content"));
        assert_ne!(digest, sha256_hex(b"other content"));
    }

    #[test]
    fn test_atomic_write_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data.bin");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // 不残留临时文件
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.txt");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("reports_v2"), "reports_v2");
        assert_eq!(sanitize_identifier("main"), "main");

        let prefixed = sanitize_identifier("prod-db:5432/main");
        assert!(prefixed.starts_with("prod_db_5432_main_"));
        assert!(sanitize_identifier("").starts_with("default_"));
        assert!(sanitize_identifier("Main").starts_with("main_"));
    }

    #[test]
    fn test_sanitize_identifier_keeps_ids_distinct() {
        let pairs = [("db-1", "db_1"), ("主库", "从库"), ("Main", "main"), ("", "default")];
        for (a, b) in pairs {
            assert_ne!(sanitize_identifier(a), sanitize_identifier(b), "{a} / {b}");
        }
    }

    #[test]
    fn test_sanitize_identifier_is_stable() {
        for raw in ["db-1", "主库", "Main", "", "plain"] {
            let once = sanitize_identifier(raw);
            assert!(once
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            assert_eq!(sanitize_identifier(&once), once);
        }
    }
}
