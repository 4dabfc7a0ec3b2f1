//! 有界 LRU 记忆表
//!
//! 用于缓存纯函数的计算结果（例如 "语句是否可缓存"），超过容量时淘汰最久未使用的项。
//! 记忆表归属于持有它的组件，生命周期与组件一致，不使用进程级全局状态。

use linked_hash_map::LinkedHashMap;
use std::hash::Hash;

/// LRU 缓存实现
///
/// 使用 `LinkedHashMap` 保证访问顺序，实现 LRU 淘汰策略。
#[derive(Debug)]
pub struct LruCache<K: Eq + Hash, V> {
    cache: LinkedHashMap<K, V>,
    capacity: usize,
}

impl<K: Eq + Hash, V> LruCache<K, V> {
    /// 创建新的 LRU 缓存（容量至少为 1）
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LinkedHashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// 获取缓存值，命中时刷新其 LRU 位置
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.cache.get_refresh(key).map(|v| &*v)
    }

    /// 插入缓存值，超过容量时淘汰最久未使用的项
    pub fn insert(&mut self, key: K, value: V) {
        if self.cache.contains_key(&key) {
            self.cache.remove(&key);
        }
        while self.cache.len() >= self.capacity {
            self.cache.pop_front();
        }
        self.cache.insert(key, value);
    }

    /// 命中直接返回，未命中时计算并记忆
    pub fn get_or_insert_with<F>(&mut self, key: K, compute: F) -> &V
    where
        K: Clone,
        F: FnOnce() -> V,
    {
        if !self.cache.contains_key(&key) {
            let value = compute();
            self.insert(key.clone(), value);
        }
        // 刚插入或已存在，必定命中
        self.cache
            .get_refresh(&key)
            .map(|v| &*v)
            .unwrap_or_else(|| unreachable!("entry inserted above"))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.cache.remove(key)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_capacity_limit() {
        let mut cache = LruCache::new(3);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        cache.insert("d", 4);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"d"), Some(&4));
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = LruCache::new(3);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        // 访问 "a"，使其成为最近使用
        cache.get(&"a");

        // 插入 "d"，应该淘汰 "b"
        cache.insert("d", 4);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_get_or_insert_with_computes_once() {
        let mut cache = LruCache::new(4);
        let calls = Cell::new(0);

        for _ in 0..3 {
            let v = *cache.get_or_insert_with("stmt", || {
                calls.set(calls.get() + 1);
                true
            });
            assert!(v);
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = LruCache::new(0);
        cache.insert("a", 1);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.get(&"a"), Some(&1));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = LruCache::new(10);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        cache.clear();
        assert!(cache.is_empty());
    }
}
