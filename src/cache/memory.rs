//! メモリティア
//!
//! 確定済みオブジェクトを全ワーカーで共有するインメモリストレージ。
//! 容量はページ単位で管理し、エビクション順序は置換ポリシーに委譲します。

use dashmap::DashMap;
use ftlog::debug;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::config::StoreConfig;
use super::entry::{StoredObject, Timestamps};
use super::error::{Result, StoreError};
use super::key::CacheKey;
use super::removal::RemovalPolicy;
use super::reply::HttpReply;

/// メモリティア
pub struct MemoryTier {
    /// オブジェクト（キー → 確定済みオブジェクト）
    objects: DashMap<CacheKey, Arc<StoredObject>>,
    /// 置換ポリシー
    policy: Box<dyn RemovalPolicy>,
    /// ページサイズ
    page_size: usize,
    /// 最大ページ数
    max_pages: usize,
    /// 最大オブジェクトサイズ
    max_object_size: usize,
    /// 使用中ページ数
    used_pages: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    /// 作成時刻
    created_at: Instant,
}

impl MemoryTier {
    /// 新しいメモリティアを作成
    pub fn new(config: &StoreConfig, policy: Box<dyn RemovalPolicy>) -> Self {
        Self {
            objects: DashMap::new(),
            policy,
            page_size: config.memory_page_size.max(1),
            max_pages: config.memory_pages_max(),
            max_object_size: config.max_in_memory_object_size,
            used_pages: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// メモリティアが有効か
    #[inline]
    pub fn enabled(&self) -> bool {
        self.max_pages > 0
    }

    /// `bytes` を格納するのに必要なページ数
    #[inline]
    pub fn pages_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.page_size)
    }

    /// オブジェクトサイズがこのティアの受け入れ条件を満たすか
    pub fn should_cache(&self, bytes: usize) -> bool {
        self.enabled() && bytes <= self.max_object_size && self.pages_for(bytes) <= self.max_pages
    }

    /// `pages` 分の空きがあるか
    #[inline]
    pub fn has_space_for(&self, pages: usize) -> bool {
        self.used_pages() + pages <= self.max_pages
    }

    /// オブジェクトを取得
    pub fn get(&self, key: &CacheKey) -> Option<Arc<StoredObject>> {
        match self.objects.get(key) {
            Some(obj) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.policy.referenced(key);
                Some(Arc::clone(&obj))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 読み出し中のエントリが参照された
    pub fn reference(&self, key: &CacheKey) {
        if self.objects.contains_key(key) {
            self.policy.referenced(key);
        }
    }

    #[inline]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.objects.contains_key(key)
    }

    /// オブジェクトを格納
    ///
    /// 同じキーの既存オブジェクトは置き換えます。空きがなければ `NoSpace`。
    pub fn write(&self, obj: StoredObject) -> Result<()> {
        let bytes = obj.memory_usage();
        if !self.should_cache(bytes) {
            return Err(StoreError::NoSpace {
                required: bytes as u64,
                available: self.max_object_size.min(self.max_pages * self.page_size) as u64,
            });
        }

        let pages = self.pages_for(bytes);
        let key = obj.key;
        let reclaimed = self.objects.get(&key).map(|o| self.pages_for(o.memory_usage())).unwrap_or(0);

        let reserved = self.used_pages.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            let after = used.saturating_sub(reclaimed) + pages;
            (after <= self.max_pages).then_some(after)
        });
        if reserved.is_err() {
            return Err(StoreError::NoSpace {
                required: (pages * self.page_size) as u64,
                available: (self.max_pages.saturating_sub(self.used_pages()) * self.page_size) as u64,
            });
        }

        self.objects.insert(key, Arc::new(obj));
        self.policy.referenced(&key);
        debug!("memory tier stored {} ({} pages)", key, pages);
        Ok(())
    }

    /// ヘッダーだけを更新
    ///
    /// オブジェクトがなければ `Ok(false)`。
    pub fn update_headers(&self, key: &CacheKey, reply: &HttpReply, timestamps: Timestamps) -> Result<bool> {
        let Some(mut slot) = self.objects.get_mut(key) else {
            return Ok(false);
        };
        let old_pages = self.pages_for(slot.memory_usage());
        let updated = slot.with_reply(reply.clone(), timestamps);
        let new_pages = self.pages_for(updated.memory_usage());

        if new_pages > old_pages {
            let extra = new_pages - old_pages;
            let reserved = self.used_pages.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + extra <= self.max_pages).then_some(used + extra)
            });
            if reserved.is_err() {
                return Err(StoreError::NoSpace {
                    required: (extra * self.page_size) as u64,
                    available: (self.max_pages.saturating_sub(self.used_pages()) * self.page_size) as u64,
                });
            }
        } else {
            self.used_pages.fetch_sub(old_pages - new_pages, Ordering::AcqRel);
        }

        *slot = Arc::new(updated);
        Ok(true)
    }

    /// オブジェクトを削除
    pub fn evict(&self, key: &CacheKey) -> bool {
        match self.objects.remove(key) {
            Some((_, obj)) => {
                let pages = self.pages_for(obj.memory_usage());
                self.used_pages.fetch_sub(pages, Ordering::AcqRel);
                self.policy.remove(key);
                debug!("memory tier evicted {}", key);
                true
            }
            None => false,
        }
    }

    /// ローカルエントリの参照が終わった
    pub fn dereference(&self, key: &CacheKey) {
        self.policy.dereferenced(key);
    }

    /// 削除候補を返す
    pub fn select_victims(&self, n: usize) -> Vec<CacheKey> {
        self.policy.select_victims(n)
    }

    #[inline]
    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// 現在のメモリ使用量（バイト、ページ単位）
    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.used_pages() * self.page_size
    }

    /// 最大メモリ使用量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_pages * self.page_size
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// 稼働時間（秒）
    pub fn uptime_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{HttpMethod, KeyScope};
    use crate::cache::removal::LruPolicy;

    fn create_test_key(path: &str) -> CacheKey {
        CacheKey::public(HttpMethod::Get, &format!("http://example.com{}", path), KeyScope::Default)
    }

    fn create_test_object(path: &str, size: usize) -> StoredObject {
        StoredObject {
            key: create_test_key(path),
            store_id: format!("http://example.com{}", path).into(),
            method: HttpMethod::Get,
            reply: HttpReply::new(200, vec![]),
            body: vec![0u8; size].into(),
            timestamps: Timestamps::default(),
            negative: false,
            vary_selector: None,
        }
    }

    fn create_test_tier(memory: usize) -> MemoryTier {
        let config = StoreConfig {
            memory_cache_size: memory,
            memory_page_size: 1024,
            max_in_memory_object_size: memory,
            ..Default::default()
        };
        MemoryTier::new(&config, Box::new(LruPolicy::new()))
    }

    #[test]
    fn test_write_and_get() {
        let tier = create_test_tier(64 * 1024);
        tier.write(create_test_object("/a", 100)).unwrap();

        let obj = tier.get(&create_test_key("/a")).unwrap();
        assert_eq!(obj.body.len(), 100);
        assert_eq!(tier.used_pages(), 1);
        assert_eq!(tier.hits(), 1);
        assert!(tier.get(&create_test_key("/b")).is_none());
        assert_eq!(tier.misses(), 1);
    }

    #[test]
    fn test_page_accounting() {
        let tier = create_test_tier(64 * 1024);
        assert_eq!(tier.pages_for(0), 0);
        assert_eq!(tier.pages_for(1), 1);
        assert_eq!(tier.pages_for(1024), 1);
        assert_eq!(tier.pages_for(1025), 2);
        assert!(tier.has_space_for(64));
        assert!(!tier.has_space_for(65));
    }

    #[test]
    fn test_no_space() {
        let tier = create_test_tier(4 * 1024);
        tier.write(create_test_object("/a", 2000)).unwrap();

        let err = tier.write(create_test_object("/b", 3000)).unwrap_err();
        assert!(matches!(err, StoreError::NoSpace { .. }));
        assert!(!tier.contains(&create_test_key("/b")));

        // 大きすぎるオブジェクト
        assert!(tier.write(create_test_object("/huge", 10_000)).is_err());
    }

    #[test]
    fn test_replace_reclaims_pages() {
        let tier = create_test_tier(4 * 1024);
        tier.write(create_test_object("/a", 3000)).unwrap();
        let before = tier.used_pages();
        tier.write(create_test_object("/a", 3000)).unwrap();
        assert_eq!(tier.used_pages(), before);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_evict() {
        let tier = create_test_tier(64 * 1024);
        tier.write(create_test_object("/a", 100)).unwrap();
        assert!(tier.evict(&create_test_key("/a")));
        assert!(!tier.evict(&create_test_key("/a")));
        assert_eq!(tier.used_pages(), 0);
        assert!(tier.select_victims(1).is_empty());
    }

    #[test]
    fn test_update_headers() {
        let tier = create_test_tier(64 * 1024);
        tier.write(create_test_object("/a", 100)).unwrap();

        let reply = HttpReply::new(200, vec![(b"x-new".to_vec().into(), b"1".to_vec().into())]);
        let ts = Timestamps {
            timestamp: Some(42),
            ..Default::default()
        };
        assert!(tier.update_headers(&create_test_key("/a"), &reply, ts).unwrap());
        let obj = tier.get(&create_test_key("/a")).unwrap();
        assert_eq!(obj.reply.header(b"x-new"), Some(&b"1"[..]));
        assert_eq!(obj.timestamps.timestamp, Some(42));

        assert!(!tier.update_headers(&create_test_key("/missing"), &reply, ts).unwrap());
    }

    #[test]
    fn test_victims_follow_lru() {
        let tier = create_test_tier(64 * 1024);
        tier.write(create_test_object("/a", 10)).unwrap();
        tier.write(create_test_object("/b", 10)).unwrap();
        tier.get(&create_test_key("/a"));

        assert_eq!(tier.select_victims(1), vec![create_test_key("/b")]);
    }
}
