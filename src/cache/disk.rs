//! ディスクティア
//!
//! 確定済みオブジェクトをプロセス終了後も保持するファイルシステムベースのストレージ。
//! キーから2階層のハッシュディレクトリを導出し、1オブジェクト1ファイルで格納します。

use dashmap::DashMap;
use ftlog::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use super::config::DiskConfig;
use super::entry::{StoredObject, Timestamps};
use super::error::{Result, StoreError};
use super::key::CacheKey;
use super::reply::HttpReply;
use super::swap_meta;

/// この使用率（%）を超えたら削除を始める
const HIGH_WATER_PERCENT: u64 = 95;
/// 削除後の目標使用率（%）
const LOW_WATER_PERCENT: u64 = 90;

/// ディスク1台分のストレージ
pub trait SwapDir: Send + Sync {
    /// ベースディレクトリ
    fn path(&self) -> &Path;

    /// `size` バイトのオブジェクトを受け入れられるか
    fn can_store(&self, size: u64) -> bool;

    /// 相対負荷（0〜1000）
    fn load(&self) -> u32;

    /// オブジェクトを書き込み、ファイル番号と永続化サイズを返す
    fn write(&self, obj: &StoredObject) -> Result<(u64, u64)>;

    /// オブジェクトを読み込む
    ///
    /// 存在しなければ `Ok(None)`。破損していればファイルを削除してエラーを返します。
    fn read(&self, key: &CacheKey) -> Result<Option<StoredObject>>;

    fn contains(&self, key: &CacheKey) -> bool;

    /// ボディを保持したままヘッダーだけを書き換える
    fn update_headers(&self, key: &CacheKey, reply: &HttpReply, timestamps: Timestamps) -> Result<bool>;

    /// オブジェクトを削除
    fn evict(&self, key: &CacheKey) -> Result<bool>;

    /// 使用量が高水位を超えていれば古いオブジェクトを低水位まで削除
    fn maintain(&self) -> Result<usize>;

    fn current_size(&self) -> u64;

    fn max_size(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// ファイルベースのディスクティア
pub struct FileSwapDir {
    /// 設定
    config: DiskConfig,
    /// 格納済みオブジェクト（キー → ファイルサイズ）
    index: DashMap<CacheKey, u64>,
    /// 現在のディスク使用量
    current_size: AtomicU64,
    /// 書き込み回数
    writes: AtomicU64,
    /// 読み込み回数
    reads: AtomicU64,
    /// 作成時刻
    created_at: Instant,
}

impl FileSwapDir {
    /// ディスクティアを開く
    ///
    /// 既存のスワップファイルを走査してインデックスを再構築します。
    pub fn open(config: DiskConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let dir = Self {
            config,
            index: DashMap::new(),
            current_size: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            created_at: Instant::now(),
        };
        let restored = dir.rebuild_index()?;
        if restored > 0 {
            info!("disk tier {} restored {} objects", dir.config.path.display(), restored);
        }
        Ok(dir)
    }

    /// キャッシュキーからファイルパスを生成
    pub fn key_to_path(&self, key: &CacheKey) -> PathBuf {
        let (dir1, dir2, filename) = key.to_path_components();
        self.config.path.join(dir1).join(dir2).join(filename)
    }

    fn path_to_key(path: &Path) -> Option<CacheKey> {
        let stem = path.file_name()?.to_str()?.strip_suffix(".swap")?;
        u128::from_str_radix(stem, 16).ok().map(CacheKey::from_digest)
    }

    /// スワップファイルを列挙（パス、サイズ、更新時刻）
    fn collect_files(&self) -> io::Result<Vec<(PathBuf, u64, SystemTime)>> {
        fn visit(path: &Path, files: &mut Vec<(PathBuf, u64, SystemTime)>) -> io::Result<()> {
            if path.is_dir() {
                for entry in std::fs::read_dir(path)? {
                    let entry = entry?;
                    let path = entry.path();

                    if path.is_dir() {
                        visit(&path, files)?;
                    } else if path.extension().is_some_and(|e| e == "swap") {
                        let metadata = entry.metadata()?;
                        files.push((path, metadata.len(), metadata.modified()?));
                    }
                }
            }
            Ok(())
        }

        let mut files = Vec::new();
        visit(&self.config.path, &mut files)?;
        Ok(files)
    }

    /// ディレクトリを走査してインデックスとサイズを再計算
    pub fn rebuild_index(&self) -> io::Result<usize> {
        self.index.clear();
        let mut total = 0u64;
        for (path, size, _) in self.collect_files()? {
            if let Some(key) = Self::path_to_key(&path) {
                self.index.insert(key, size);
                total += size;
            }
        }
        self.current_size.store(total, Ordering::Relaxed);
        Ok(self.index.len())
    }

    fn write_file(&self, key: &CacheKey, data: &[u8]) -> io::Result<()> {
        let path = self.key_to_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // 読み手に書きかけのファイルを見せない
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)
    }

    fn forget(&self, key: &CacheKey) -> bool {
        match self.index.remove(key) {
            Some((_, size)) => {
                self.current_size.fetch_sub(size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn record(&self, key: CacheKey, size: u64) {
        if let Some(old) = self.index.insert(key, size) {
            self.current_size.fetch_sub(old, Ordering::Relaxed);
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);
    }

    /// 古いファイルから削除して使用量を `target_size` 以下にする
    pub fn evict_to_size(&self, target_size: u64) -> io::Result<usize> {
        if self.current_size() <= target_size {
            return Ok(0);
        }

        let mut files = self.collect_files()?;
        files.sort_by_key(|(_, _, mtime)| *mtime);

        let mut evicted = 0;
        for (path, _, _) in files {
            if self.current_size() <= target_size {
                break;
            }
            let Some(key) = Self::path_to_key(&path) else {
                continue;
            };
            if std::fs::remove_file(&path).is_ok() && self.forget(&key) {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// 稼働時間（秒）
    pub fn uptime_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

impl SwapDir for FileSwapDir {
    fn path(&self) -> &Path {
        &self.config.path
    }

    fn can_store(&self, size: u64) -> bool {
        size >= self.config.min_object_size && size <= self.config.max_object_size && size <= self.config.max_size
    }

    fn load(&self) -> u32 {
        if self.config.max_size == 0 {
            return 1000;
        }
        (self.current_size().saturating_mul(1000) / self.config.max_size).min(1000) as u32
    }

    fn write(&self, obj: &StoredObject) -> Result<(u64, u64)> {
        let data = swap_meta::encode(obj);
        let size = data.len() as u64;
        let reclaimed = self.index.get(&obj.key).map(|s| *s).unwrap_or(0);
        let max_size = self.config.max_size;

        // 書き込み前に容量を予約する。置き換え分は記録時に差し引く
        let reserved = self.current_size.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            (used.saturating_sub(reclaimed) + size <= max_size).then_some(used + size)
        });
        if let Err(used) = reserved {
            return Err(StoreError::NoSpace {
                required: size,
                available: max_size.saturating_sub(used),
            });
        }

        if let Err(e) = self.write_file(&obj.key, &data) {
            self.current_size.fetch_sub(size, Ordering::AcqRel);
            return Err(e.into());
        }
        if let Some(old) = self.index.insert(obj.key, size) {
            self.current_size.fetch_sub(old, Ordering::AcqRel);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("disk tier {} stored {} ({} bytes)", self.config.path.display(), obj.key, size);
        Ok((obj.key.hash_value(), size))
    }

    fn read(&self, key: &CacheKey) -> Result<Option<StoredObject>> {
        if !self.index.contains_key(key) {
            return Ok(None);
        }
        let path = self.key_to_path(key);
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.forget(key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match swap_meta::decode(&data, Some(key)) {
            Ok(obj) => Ok(Some(obj)),
            Err(e) => {
                warn!("disk tier {} dropping damaged {}: {}", self.config.path.display(), key, e);
                let _ = std::fs::remove_file(&path);
                self.forget(key);
                Err(e)
            }
        }
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    fn update_headers(&self, key: &CacheKey, reply: &HttpReply, timestamps: Timestamps) -> Result<bool> {
        let Some(obj) = self.read(key)? else {
            return Ok(false);
        };
        let updated = obj.with_reply(reply.clone(), timestamps);
        let data = swap_meta::encode(&updated);
        self.write_file(key, &data)?;
        self.record(*key, data.len() as u64);
        Ok(true)
    }

    fn evict(&self, key: &CacheKey) -> Result<bool> {
        if !self.forget(key) {
            return Ok(false);
        }
        match std::fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn maintain(&self) -> Result<usize> {
        let high = self.config.max_size / 100 * HIGH_WATER_PERCENT;
        if self.current_size() <= high {
            return Ok(0);
        }
        let target = self.config.max_size / 100 * LOW_WATER_PERCENT;
        let evicted = self.evict_to_size(target)?;
        if evicted > 0 {
            info!("disk tier {} evicted {} objects", self.config.path.display(), evicted);
        }
        Ok(evicted)
    }

    fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn max_size(&self) -> u64 {
        self.config.max_size
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{HttpMethod, KeyScope};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn create_test_key(path: &str) -> CacheKey {
        CacheKey::public(HttpMethod::Get, &format!("http://example.com{}", path), KeyScope::Default)
    }

    fn create_test_object(path: &str, size: usize) -> StoredObject {
        StoredObject {
            key: create_test_key(path),
            store_id: format!("http://example.com{}", path).into(),
            method: HttpMethod::Get,
            reply: HttpReply::new(200, vec![]),
            body: Arc::from(vec![b'x'; size]),
            timestamps: Timestamps::default(),
            negative: false,
            vary_selector: None,
        }
    }

    fn create_test_dir(path: &Path, max_size: u64) -> FileSwapDir {
        let mut config = DiskConfig::new(path);
        config.max_size = max_size;
        FileSwapDir::open(config).unwrap()
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let swap = create_test_dir(dir.path(), 1024 * 1024);

        let (filen, size) = swap.write(&create_test_object("/a", 100)).unwrap();
        assert_eq!(filen, create_test_key("/a").hash_value());
        assert!(size > 100);
        assert_eq!(swap.current_size(), size);
        assert!(swap.key_to_path(&create_test_key("/a")).exists());

        let obj = swap.read(&create_test_key("/a")).unwrap().unwrap();
        assert_eq!(obj.body.len(), 100);
        assert_eq!(swap.reads(), 1);
        assert!(swap.read(&create_test_key("/missing")).unwrap().is_none());
    }

    #[test]
    fn test_reopen_restores_index() {
        let dir = tempdir().unwrap();
        {
            let swap = create_test_dir(dir.path(), 1024 * 1024);
            swap.write(&create_test_object("/a", 10)).unwrap();
            swap.write(&create_test_object("/b", 10)).unwrap();
        }
        let swap = create_test_dir(dir.path(), 1024 * 1024);
        assert_eq!(swap.len(), 2);
        assert!(swap.contains(&create_test_key("/b")));
        assert!(swap.read(&create_test_key("/a")).unwrap().is_some());
    }

    #[test]
    fn test_truncated_file_is_dropped() {
        let dir = tempdir().unwrap();
        let swap = create_test_dir(dir.path(), 1024 * 1024);
        swap.write(&create_test_object("/a", 100)).unwrap();

        let path = swap.key_to_path(&create_test_key("/a"));
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 10]).unwrap();

        assert!(swap.read(&create_test_key("/a")).is_err());
        assert!(!swap.contains(&create_test_key("/a")));
        assert!(!path.exists());
        assert!(swap.read(&create_test_key("/a")).unwrap().is_none());
    }

    #[test]
    fn test_evict_idempotent() {
        let dir = tempdir().unwrap();
        let swap = create_test_dir(dir.path(), 1024 * 1024);
        swap.write(&create_test_object("/a", 10)).unwrap();

        assert!(swap.evict(&create_test_key("/a")).unwrap());
        assert!(!swap.evict(&create_test_key("/a")).unwrap());
        assert_eq!(swap.current_size(), 0);
    }

    #[test]
    fn test_no_space() {
        let dir = tempdir().unwrap();
        let swap = create_test_dir(dir.path(), 500);
        swap.write(&create_test_object("/a", 200)).unwrap();

        let err = swap.write(&create_test_object("/b", 300)).unwrap_err();
        assert!(matches!(err, StoreError::NoSpace { .. }));
    }

    #[test]
    fn test_concurrent_writes_respect_max_size() {
        let dir = tempdir().unwrap();
        let object_size = crate::cache::swap_meta::encode(&create_test_object("/c0", 1000)).len() as u64;
        let swap = Arc::new(create_test_dir(dir.path(), object_size * 3));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let swap = Arc::clone(&swap);
                std::thread::spawn(move || swap.write(&create_test_object(&format!("/c{}", i), 1000)).is_ok())
            })
            .collect();
        let stored = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        assert_eq!(stored, 3);
        assert_eq!(swap.len(), 3);
        assert_eq!(swap.current_size(), object_size * 3);
    }

    #[test]
    fn test_can_store_range() {
        let dir = tempdir().unwrap();
        let mut config = DiskConfig::new(dir.path());
        config.min_object_size = 100;
        config.max_object_size = 1000;
        let swap = FileSwapDir::open(config).unwrap();

        assert!(!swap.can_store(99));
        assert!(swap.can_store(100));
        assert!(swap.can_store(1000));
        assert!(!swap.can_store(1001));
    }

    #[test]
    fn test_update_headers_keeps_body() {
        let dir = tempdir().unwrap();
        let swap = create_test_dir(dir.path(), 1024 * 1024);
        swap.write(&create_test_object("/a", 50)).unwrap();

        let reply = HttpReply::new(200, vec![(b"X-Rev".to_vec().into(), b"2".to_vec().into())]);
        let ts = Timestamps {
            timestamp: Some(7),
            ..Default::default()
        };
        assert!(swap.update_headers(&create_test_key("/a"), &reply, ts).unwrap());

        let obj = swap.read(&create_test_key("/a")).unwrap().unwrap();
        assert_eq!(obj.reply.header(b"x-rev"), Some(&b"2"[..]));
        assert_eq!(obj.timestamps.timestamp, Some(7));
        assert_eq!(obj.body.len(), 50);
    }

    #[test]
    fn test_maintain_to_low_water() {
        let dir = tempdir().unwrap();
        let swap = create_test_dir(dir.path(), 10_000);
        for i in 0..8 {
            swap.write(&create_test_object(&format!("/m{}", i), 1100)).unwrap();
        }
        assert!(swap.current_size() > 9_500);
        assert!(swap.maintain().unwrap() > 0);
        assert!(swap.current_size() <= 9_000);

        // 低水位以下なら何もしない
        assert_eq!(swap.maintain().unwrap(), 0);
    }

    #[test]
    fn test_evict_to_size() {
        let dir = tempdir().unwrap();
        let swap = create_test_dir(dir.path(), 1024 * 1024);
        for i in 0..5 {
            swap.write(&create_test_object(&format!("/f{}", i), 1000)).unwrap();
        }
        let evicted = swap.evict_to_size(2500).unwrap();
        assert!(evicted >= 3);
        assert!(swap.current_size() <= 2500);
        assert_eq!(swap.len(), 5 - evicted);
    }
}
