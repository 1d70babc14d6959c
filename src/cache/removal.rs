//! 置換ポリシー
//!
//! メモリティアのエビクション順序を決定します。

use lru::LruCache;
use std::sync::{Mutex, PoisonError};

use super::key::CacheKey;

/// 置換ポリシー
pub trait RemovalPolicy: Send + Sync {
    /// オブジェクトが追加・参照された
    fn referenced(&self, key: &CacheKey);

    /// オブジェクトの参照が終わった
    fn dereferenced(&self, key: &CacheKey);

    /// オブジェクトが削除された
    fn remove(&self, key: &CacheKey);

    /// 削除候補を優先度順に最大 `n` 件返す
    ///
    /// 返したキーはポリシーから取り除かれません。
    fn select_victims(&self, n: usize) -> Vec<CacheKey>;

    /// 追跡中のオブジェクト数
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// LRUポリシー
pub struct LruPolicy {
    order: Mutex<LruCache<CacheKey, ()>>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(LruCache::unbounded()),
        }
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RemovalPolicy for LruPolicy {
    fn referenced(&self, key: &CacheKey) {
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        // 既存なら最新に移動
        order.put(*key, ());
    }

    fn dereferenced(&self, key: &CacheKey) {
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.promote(key);
    }

    fn remove(&self, key: &CacheKey) {
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.pop(key);
    }

    fn select_victims(&self, n: usize) -> Vec<CacheKey> {
        let order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        // iter() は新しい順
        order.iter().rev().take(n).map(|(k, _)| *k).collect()
    }

    fn len(&self) -> usize {
        self.order.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
