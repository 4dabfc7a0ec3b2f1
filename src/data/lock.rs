//! 命名锁服务
//!
//! 共享可变状态（条目元数据、表时间戳缓存、事务日志/汇总文件）的读-改-写
//! 都必须在以资源标识命名的锁内完成。锁获取会阻塞直到资源可用，
//! `LockGuard` 在 drop 时无条件释放（包括错误路径）。
//!
//! 提供两种实现：
//! - `FileLockProvider`: 基于锁文件（fs2 排他锁），跨进程互斥
//! - `LocalLockProvider`: 进程内命名锁（Mutex + Condvar）

use crate::data::{CacheError, Result};
use crate::utils::sha256_hex;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

/// 锁服务抽象
pub trait LockProvider: Send + Sync {
    /// 获取以 `resource` 命名的排他锁（阻塞）
    fn acquire(&self, resource: &str) -> Result<LockGuard>;
}

/// 持有期间保持互斥，drop 时释放
pub struct LockGuard {
    resource: String,
    _handle: Box<dyn Send>,
}

impl LockGuard {
    pub fn new(resource: impl Into<String>, handle: impl Send + 'static) -> Self {
        Self {
            resource: resource.into(),
            _handle: Box::new(handle),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .finish()
    }
}

/// 在锁内执行闭包，无论成功与否都会释放锁
pub fn with_lock<T, F>(locks: &dyn LockProvider, resource: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _guard = locks.acquire(resource)?;
    f()
}

// ==================== 文件锁 ====================

/// 基于锁文件的跨进程锁
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    lock_dir: PathBuf,
}

struct FileLockHandle {
    file: File,
}

impl Drop for FileLockHandle {
    fn drop(&mut self) {
        // 关闭文件也会释放锁，这里显式解锁以尽早放行等待者
        let _ = self.file.unlock();
    }
}

impl FileLockProvider {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self> {
        let lock_dir = lock_dir.into();
        std::fs::create_dir_all(&lock_dir).map_err(|e| CacheError::io(&lock_dir, e))?;
        Ok(Self { lock_dir })
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// 资源名映射为定长锁文件名
    fn lock_path(&self, resource: &str) -> PathBuf {
        let digest = sha256_hex(resource.as_bytes());
        self.lock_dir.join(format!("{}.lock", &digest[..32]))
    }
}

impl LockProvider for FileLockProvider {
    fn acquire(&self, resource: &str) -> Result<LockGuard> {
        let lock_path = self.lock_path(resource);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CacheError::lock(resource, format!("创建锁文件失败: {e}")))?;

        // 获取排他锁（阻塞等待其他持有者释放）
        file.lock_exclusive()
            .map_err(|e| CacheError::lock(resource, format!("获取文件锁失败: {e}")))?;

        tracing::trace!(resource = %resource, path = ?lock_path, "已获取文件锁");
        Ok(LockGuard::new(resource, FileLockHandle { file }))
    }
}

// ==================== 进程内锁 ====================

type LockTable = (Mutex<HashSet<String>>, Condvar);

/// 进程内命名锁
#[derive(Debug, Clone, Default)]
pub struct LocalLockProvider {
    table: Arc<LockTable>,
}

struct LocalLockHandle {
    table: Arc<LockTable>,
    resource: String,
}

impl Drop for LocalLockHandle {
    fn drop(&mut self) {
        let (held, released) = &*self.table;
        match held.lock() {
            Ok(mut held) => {
                held.remove(&self.resource);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.resource);
            }
        }
        released.notify_all();
    }
}

impl LocalLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockProvider for LocalLockProvider {
    fn acquire(&self, resource: &str) -> Result<LockGuard> {
        let (held, released) = &*self.table;
        let mut guard = held
            .lock()
            .map_err(|e| CacheError::lock(resource, e.to_string()))?;
        while guard.contains(resource) {
            guard = released
                .wait(guard)
                .map_err(|e| CacheError::lock(resource, e.to_string()))?;
        }
        guard.insert(resource.to_string());
        drop(guard);

        Ok(LockGuard::new(
            resource,
            LocalLockHandle {
                table: Arc::clone(&self.table),
                resource: resource.to_string(),
            },
        ))
    }
}
