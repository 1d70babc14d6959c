//! 複数ディスクのファサード
//!
//! 書き込み先は、オブジェクトサイズを受け入れるディスクのうち最も負荷の低いものを選びます。
//! 読み込みと削除は全ディスクを対象にします。

use ftlog::warn;
use std::io;

use super::config::DiskConfig;
use super::disk::{FileSwapDir, SwapDir};
use super::entry::{StoredObject, SwapLocation, Timestamps};
use super::error::{Result, StoreError};
use super::key::CacheKey;
use super::reply::HttpReply;

/// ディスクファサード
#[derive(Default)]
pub struct Disks {
    dirs: Vec<Box<dyn SwapDir>>,
}

impl Disks {
    pub fn new(dirs: Vec<Box<dyn SwapDir>>) -> Self {
        Self { dirs }
    }

    /// 設定からファイルベースのディスクを開く
    pub fn open(configs: &[DiskConfig]) -> io::Result<Self> {
        let mut dirs: Vec<Box<dyn SwapDir>> = Vec::with_capacity(configs.len());
        for config in configs {
            dirs.push(Box::new(FileSwapDir::open(config.clone())?));
        }
        Ok(Self { dirs })
    }

    /// ディスクが1台も構成されていないか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn dir(&self, index: usize) -> Option<&dyn SwapDir> {
        self.dirs.get(index).map(|d| d.as_ref())
    }

    /// `size` バイトのオブジェクトの書き込み先を選択
    ///
    /// 同じ負荷なら番号の小さいディスクを選びます。
    pub fn select(&self, size: u64) -> Option<usize> {
        self.dirs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.can_store(size))
            .min_by_key(|(i, d)| (d.load(), *i))
            .map(|(i, _)| i)
    }

    /// いずれかのディスクが受け入れうるサイズか
    pub fn accepts(&self, size: u64) -> bool {
        self.select(size).is_some()
    }

    /// オブジェクトを書き込む
    ///
    /// 選択したディスクが満杯なら、サイズ調整を1度だけ行って再試行します。
    pub fn write(&self, obj: &StoredObject, size_hint: u64) -> Result<SwapLocation> {
        let Some(disk) = self.select(size_hint) else {
            return Err(StoreError::NoSpace {
                required: size_hint,
                available: 0,
            });
        };
        let dir = &self.dirs[disk];

        let (filen, size) = match dir.write(obj) {
            Err(StoreError::NoSpace { .. }) => {
                dir.maintain()?;
                dir.write(obj)?
            }
            other => other?,
        };
        Ok(SwapLocation { disk, filen, size })
    }

    /// キーで全ディスクを検索
    ///
    /// 破損したコピーは警告して次のディスクを探します。
    pub fn get(&self, key: &CacheKey) -> Option<(StoredObject, SwapLocation)> {
        for (disk, dir) in self.dirs.iter().enumerate() {
            if !dir.contains(key) {
                continue;
            }
            match dir.read(key) {
                Ok(Some(obj)) => {
                    let size = obj.body.len() as u64;
                    return Some((
                        obj,
                        SwapLocation {
                            disk,
                            filen: key.hash_value(),
                            size,
                        },
                    ));
                }
                Ok(None) => {}
                Err(e) => warn!("disk {} read of {} failed: {}", disk, key, e),
            }
        }
        None
    }

    /// 指定位置から読み込む
    pub fn read_at(&self, location: &SwapLocation, key: &CacheKey) -> Result<Option<StoredObject>> {
        match self.dirs.get(location.disk) {
            Some(dir) => dir.read(key),
            None => Ok(None),
        }
    }

    /// いずれかのディスクにあるか
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.dirs.iter().any(|d| d.contains(key))
    }

    /// ヘッダーを更新
    pub fn update_headers(
        &self,
        location: &SwapLocation,
        key: &CacheKey,
        reply: &HttpReply,
        timestamps: Timestamps,
    ) -> Result<bool> {
        match self.dirs.get(location.disk) {
            Some(dir) => dir.update_headers(key, reply, timestamps),
            None => Ok(false),
        }
    }

    /// 全ディスクから削除
    pub fn evict(&self, key: &CacheKey) -> bool {
        let mut found = false;
        for (disk, dir) in self.dirs.iter().enumerate() {
            match dir.evict(key) {
                Ok(removed) => found |= removed,
                Err(e) => warn!("disk {} evict of {} failed: {}", disk, key, e),
            }
        }
        found
    }

    /// 全ディスクのサイズ調整
    pub fn maintain(&self) -> usize {
        let mut evicted = 0;
        for (disk, dir) in self.dirs.iter().enumerate() {
            match dir.maintain() {
                Ok(n) => evicted += n,
                Err(e) => warn!("disk {} maintenance failed: {}", disk, e),
            }
        }
        evicted
    }

    pub fn current_size(&self) -> u64 {
        self.dirs.iter().map(|d| d.current_size()).sum()
    }

    pub fn max_size(&self) -> u64 {
        self.dirs.iter().map(|d| d.max_size()).sum()
    }

    /// 格納済みオブジェクト数
    pub fn objects(&self) -> usize {
        self.dirs.iter().map(|d| d.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{HttpMethod, KeyScope};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn create_test_object(path: &str, size: usize) -> StoredObject {
        let store_id = format!("http://example.com{}", path);
        StoredObject {
            key: CacheKey::public(HttpMethod::Get, &store_id, KeyScope::Default),
            store_id: store_id.into(),
            method: HttpMethod::Get,
            reply: HttpReply::new(200, vec![]),
            body: Arc::from(vec![0u8; size]),
            timestamps: Timestamps::default(),
            negative: false,
            vary_selector: None,
        }
    }

    #[test]
    fn test_select_by_size_range() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let mut small = DiskConfig::new(a.path());
        small.max_object_size = 1000;
        let mut large = DiskConfig::new(b.path());
        large.min_object_size = 1001;

        let disks = Disks::open(&[small, large]).unwrap();
        assert_eq!(disks.select(10), Some(0));
        assert_eq!(disks.select(5000), Some(1));
    }

    #[test]
    fn test_select_least_loaded() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let disks = Disks::open(&[DiskConfig::new(a.path()), DiskConfig::new(b.path())]).unwrap();

        let loc = disks.write(&create_test_object("/a", 10_000_000), 10_000_000).unwrap();
        assert_eq!(loc.disk, 0);
        // ディスク0の負荷が上がったので次はディスク1
        assert_eq!(disks.select(100), Some(1));
    }

    #[test]
    fn test_get_across_disks() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let disks = Disks::open(&[DiskConfig::new(a.path()), DiskConfig::new(b.path())]).unwrap();
        let obj = create_test_object("/x", 10);
        let loc = disks.write(&obj, 10).unwrap();

        let (found, at) = disks.get(&obj.key).unwrap();
        assert_eq!(at.disk, loc.disk);
        assert_eq!(found.body.len(), 10);

        assert!(disks.evict(&obj.key));
        assert!(!disks.evict(&obj.key));
        assert!(disks.get(&obj.key).is_none());
    }

    #[test]
    fn test_no_disks() {
        let disks = Disks::default();
        assert!(disks.is_empty());
        assert!(!disks.accepts(1));
        assert!(disks.write(&create_test_object("/a", 1), 1).is_err());
        assert_eq!(disks.max_size(), 0);
    }
}
