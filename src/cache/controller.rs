//! ストアコントローラ
//!
//! 外部から呼ばれる唯一の窓口です。ワーカーごとに1つ作成し、
//! 全ワーカーで共有する状態（メモリティア、ディスク、Transients、Varyインデックス）は
//! `SharedStore` として注入します。
//!
//! ## ロック
//!
//! ローカルインデックスのロックを保持したまま `EntryHandle` を破棄したり、
//! エントリ・共有テーブルを呼び出したりしてはいけません。

use ftlog::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::config::StoreConfig;
use super::disks::Disks;
use super::entry::{flags, EntryHandle, MemStatus, StoreEntry, StoreStatus, Timestamps};
use super::error::{Result, StoreError};
use super::key::{CacheKey, HttpMethod, KeyScope};
use super::memory::MemoryTier;
use super::policy::{CachePolicy, FreshnessPolicy};
use super::removal::{LruPolicy, RemovalPolicy};
use super::reply::{now_secs, HttpReply};
use super::request::{RequestFlags, RequestInfo};
use super::transients::{EntryStatus, IoMode, Transients};
use super::vary::VaryIndex;

/// メモリ確保のための走査は1秒に1回まで
const MEMORY_WALK_INTERVAL: Duration = Duration::from_secs(1);
/// 容量超過の警告間隔
const LIMIT_WARNING_INTERVAL: Duration = Duration::from_secs(10);
/// 一度も実行していないことを示す時刻
const NEVER: u64 = u64::MAX;

/// 全ワーカーで共有するストア状態
pub struct SharedStore {
    config: StoreConfig,
    transients: Transients,
    memory: MemoryTier,
    disks: Disks,
    vary: VaryIndex,
    freshness: Box<dyn FreshnessPolicy>,
    hits: AtomicU64,
    misses: AtomicU64,
    collapsed: AtomicU64,
    /// 最後にメモリティアを走査した時刻（`created_at` からのミリ秒）
    last_memory_walk: AtomicU64,
    last_limit_warning: AtomicU64,
    created_at: Instant,
}

impl SharedStore {
    /// 設定から共有ストアを作成
    ///
    /// ディスクを開けなければエラーを返します。
    pub fn new(config: StoreConfig) -> io::Result<Self> {
        let disks = Disks::open(&config.disks)?;
        let freshness = Box::new(config.refresh_policy());
        Ok(Self::with_parts(config, Box::new(LruPolicy::new()), disks, freshness))
    }

    /// 構成要素を指定して作成
    pub fn with_parts(
        config: StoreConfig,
        removal: Box<dyn RemovalPolicy>,
        disks: Disks,
        freshness: Box<dyn FreshnessPolicy>,
    ) -> Self {
        let memory = MemoryTier::new(&config, removal);
        info!(
            "store ready: memory {} pages x {} bytes, {} disk(s), collapsed forwarding {}",
            memory.max_pages(),
            memory.page_size(),
            disks.len(),
            if config.collapsed_forwarding { "on" } else { "off" }
        );
        Self {
            transients: Transients::new(config.writer_lease_secs),
            memory,
            disks,
            vary: VaryIndex::new(),
            freshness,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
            last_memory_walk: AtomicU64::new(NEVER),
            last_limit_warning: AtomicU64::new(NEVER),
            created_at: Instant::now(),
        }
    }

    /// 全ワーカーを通じて `interval` に1回だけ `true` を返す
    fn take_turn(&self, last: &AtomicU64, interval: Duration) -> bool {
        let now = self.created_at.elapsed().as_millis() as u64;
        let prev = last.load(Ordering::Acquire);
        if prev != NEVER && now.saturating_sub(prev) < interval.as_millis() as u64 {
            return false;
        }
        last.compare_exchange(prev, now, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[inline]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[inline]
    pub fn transients(&self) -> &Transients {
        &self.transients
    }

    #[inline]
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    #[inline]
    pub fn disks(&self) -> &Disks {
        &self.disks
    }

    #[inline]
    pub fn vary(&self) -> &VaryIndex {
        &self.vary
    }

    #[inline]
    pub fn freshness(&self) -> &dyn FreshnessPolicy {
        self.freshness.as_ref()
    }
}

/// `create_or_reuse` が返す役割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// オリジンから取得して書き込む
    Writer,
    /// 他のリクエストの取得完了を待つ
    CollapsedReader,
}

/// PURGEの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged,
    NotFound,
}

/// キャッシュ統計情報
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// このワーカーのローカルエントリ数
    pub entries: usize,
    /// メモリティアのオブジェクト数
    pub memory_objects: usize,
    /// メモリ使用量
    pub memory_usage: usize,
    /// メモリ容量
    pub memory_capacity: usize,
    /// ディスク上のオブジェクト数
    pub disk_objects: usize,
    /// ディスク使用量
    pub disk_usage: u64,
    /// ディスク容量
    pub disk_capacity: u64,
    /// Transientsスロット数
    pub transients: usize,
    /// ヒット数
    pub hits: u64,
    /// ミス数
    pub misses: u64,
    /// 他リクエストの取得に合流した数
    pub collapsed: u64,
    /// ヒット率
    pub hit_rate: f64,
    /// 稼働時間（秒）
    pub uptime_secs: u64,
}

/// ストアコントローラ（ワーカーごと）
pub struct Controller {
    worker: u32,
    shared: Arc<SharedStore>,
    /// 公開キー → ローカルエントリ
    index: Mutex<HashMap<CacheKey, Arc<StoreEntry>>>,
    next_private: AtomicU64,
}

impl Controller {
    pub fn new(worker: u32, shared: Arc<SharedStore>) -> Arc<Self> {
        Arc::new(Self {
            worker,
            shared,
            index: Mutex::new(HashMap::new()),
            next_private: AtomicU64::new(1),
        })
    }

    #[inline]
    pub fn worker(&self) -> u32 {
        self.worker
    }

    #[inline]
    pub fn shared(&self) -> &Arc<SharedStore> {
        &self.shared
    }

    #[inline]
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    fn index(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<StoreEntry>>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local(&self, key: &CacheKey) -> Option<Arc<StoreEntry>> {
        self.index().get(key).cloned()
    }

    fn private_key(&self) -> CacheKey {
        CacheKey::private(self.worker, self.next_private.fetch_add(1, Ordering::Relaxed))
    }

    // 検索

    /// 読み手登録なしの軽量な検索
    ///
    /// 短時間の確認用です。長時間の読み出しには `find` を使います。
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<StoreEntry>> {
        self.peek_candidate(key).map(|(entry, _)| entry)
    }

    /// 候補エントリとローカルインデックスに登録済みかどうか
    fn peek_candidate(&self, key: &CacheKey) -> Option<(Arc<StoreEntry>, bool)> {
        if self.marked_for_deletion(key) {
            debug!("ignoring marked in-transit {}", key);
            return None;
        }

        if let Some(entry) = self.local(key) {
            debug!("got local in-transit entry {}", key);
            return Some((entry, true));
        }

        // キャッシュより先に Transients を見る（同期が必要なため）
        if let Some(info) = self.shared.transients.lookup(self.worker, key) {
            debug!("got shared in-transit entry {}", key);
            let entry = StoreEntry::new_collapsed(*key, &info.store_id, info.method);
            return Some((Arc::new(entry), false));
        }

        if let Some(obj) = self.shared.memory.get(key) {
            debug!("got mem-cached entry {}", key);
            let entry = StoreEntry::from_stored(&obj, MemStatus::InMemory, None);
            return Some((Arc::new(entry), false));
        }

        if let Some((obj, location)) = self.shared.disks.get(key) {
            debug!("got disk-cached entry {}", key);
            let entry = StoreEntry::from_stored(&obj, MemStatus::NotInMemory, Some(location));
            return Some((Arc::new(entry), false));
        }

        None
    }

    /// 読み手として登録してエントリを検索
    ///
    /// 不整合を検出した場合は候補を解放して `None` を返します。
    pub fn find(self: &Arc<Self>, key: &CacheKey) -> Option<EntryHandle> {
        let Some((entry, indexed)) = self.peek_candidate(key) else {
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let handle = EntryHandle::new(Arc::clone(&entry), self, "Controller::find");
        let checked = if indexed {
            self.check_found_candidate(&entry)
        } else {
            self.allow_sharing(&entry, key)
                .and_then(|_| self.check_found_candidate(&entry))
        };

        match checked {
            Ok(()) => {
                entry.touch(now_secs());
                self.reference_busy(&entry);
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(handle)
            }
            Err(e) => {
                warn!("lookup of {} failed: {}", key, e);
                self.release(&entry, true);
                drop(handle);
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Varyを考慮した検索
    ///
    /// リクエストに一致するバリアントがあればそれを、なければ基本キーを検索します。
    pub fn find_variant(self: &Arc<Self>, request: &RequestInfo) -> Option<EntryHandle> {
        let base = request.public_key();
        if let Some(variant) = self.shared.vary.find(&base, request.headers()) {
            debug!("vary variant {} selected for {}", variant, request.store_id());
            if let Some(handle) = self.find(&variant) {
                return Some(handle);
            }
        }
        self.find(&base)
    }

    /// 新しく発見したエントリを共有可能にする
    fn allow_sharing(&self, entry: &Arc<StoreEntry>, key: &CacheKey) -> Result<()> {
        self.add_reading(entry, key)?;

        if let Some(index) = entry.transients_index() {
            let status = self.shared.transients.status(index);
            let found = self.anchor_to_cache(entry, key, status)?;
            if !found && !entry.hitting_requires_collapsing() {
                return Err(StoreError::LookupInconsistency(
                    "unattached transients entry does not require collapsing".into(),
                ));
            }
        }
        Ok(())
    }

    fn add_reading(&self, entry: &Arc<StoreEntry>, key: &CacheKey) -> Result<()> {
        self.shared.transients.monitor_io(self.worker, entry, *key, IoMode::Read)?;
        entry.set_public_key(*key);
        self.index().insert(*key, Arc::clone(entry));
        Ok(())
    }

    fn check_found_candidate(&self, entry: &StoreEntry) -> Result<()> {
        debug_assert!(entry.is_special() || entry.has_transients());
        if entry.hitting_requires_collapsing() && !entry.has_transients() && !(entry.locked() && entry.is_accepting())
        {
            return Err(StoreError::LookupInconsistency("collapsed entry has no local writer".into()));
        }
        Ok(())
    }

    fn reference_busy(&self, entry: &StoreEntry) {
        if entry.mem_status() == MemStatus::InMemory {
            self.shared.memory.reference(&entry.key());
        }
    }

    /// Transients経由のエントリを確定済みティアのオブジェクトに結び付ける
    ///
    /// 結び付けられた場合は `true`、ライターの完了を待つ場合は `false`。
    fn anchor_to_cache(&self, entry: &StoreEntry, key: &CacheKey, status: Option<EntryStatus>) -> Result<bool> {
        if entry.store_status() == StoreStatus::Committed
            && (entry.mem_status() == MemStatus::InMemory || entry.has_disk())
        {
            return Ok(true);
        }

        if let Some(obj) = self.shared.memory.get(key) {
            entry.anchor(&obj, MemStatus::InMemory, None);
            entry.set_collapsing_requirement(false);
            return Ok(true);
        }

        if let Some((obj, location)) = self.shared.disks.get(key) {
            entry.anchor(&obj, MemStatus::NotInMemory, Some(location));
            entry.set_collapsing_requirement(false);
            return Ok(true);
        }

        match status {
            Some(s) if s.waiting_to_be_freed => Err(StoreError::MarkedForDeletion(*key)),
            // Varyバリアントのキーで確定した
            Some(s) if s.complete => Err(StoreError::LookupInconsistency(format!(
                "{} was committed under another key",
                key
            ))),
            Some(s) if !s.has_writer => Err(StoreError::AbandonedWriter(*key)),
            Some(_) => {
                entry.set_collapsing_requirement(true);
                Ok(false)
            }
            None => Err(StoreError::LookupInconsistency(format!("{} lost its transients slot", key))),
        }
    }

    // 書き込み

    /// リクエストに対するエントリを作成、または取得中のエントリに合流
    pub fn create_or_reuse(self: &Arc<Self>, request: &RequestInfo) -> (EntryHandle, Role) {
        let collapsing = self.shared.config.collapsed_forwarding && request.flags().cachable;

        if collapsing {
            if let Some(handle) = self.find(&request.public_key()) {
                if handle.hitting_requires_collapsing() && handle.is_pending() && !handle.is_aborted() {
                    debug!("collapsing {} on an in-flight entry", request.store_id());
                    self.shared.collapsed.fetch_add(1, Ordering::Relaxed);
                    return (handle, Role::CollapsedReader);
                }
            }
        }

        let entry = Arc::new(StoreEntry::new_private(self.private_key(), request));
        let handle = EntryHandle::new(entry, self, "Controller::create_or_reuse");
        if collapsing {
            self.allow_collapsing(&handle, request.flags());
        }
        (handle, Role::Writer)
    }

    /// エントリを公開して他のリクエストが合流できるようにする
    ///
    /// 公開できなければ `false`。
    pub fn allow_collapsing(&self, handle: &EntryHandle, flags: &RequestFlags) -> bool {
        if !flags.cachable {
            return false;
        }
        let entry = handle.entry();
        entry.set_collapsing_requirement(true);
        match self.make_public(entry, entry.scope()) {
            Ok(()) => {
                debug!("allow collapsing {} ({:?})", entry.store_id(), entry.scope());
                true
            }
            Err(e) => {
                debug!("cannot collapse on {}: {}", entry.store_id(), e);
                entry.set_collapsing_requirement(false);
                false
            }
        }
    }

    /// ライターとして公開キーに登録
    ///
    /// 別のスコープで公開済みなら、そのキーから外して登録し直します。
    fn make_public(&self, entry: &Arc<StoreEntry>, scope: KeyScope) -> Result<()> {
        let key = CacheKey::public(entry.method(), entry.store_id(), scope);
        if !entry.is_private() {
            if entry.key() == key {
                return Ok(());
            }
            self.unpublish(entry);
        }

        if let Some(old) = self.local(&key) {
            if !Arc::ptr_eq(&old, entry) {
                self.release(&old, false);
            }
        }

        self.shared.transients.monitor_io(self.worker, entry, key, IoMode::Write)?;
        entry.set_public_key(key);
        self.index().insert(key, Arc::clone(entry));
        Ok(())
    }

    /// 公開キーを外し、Transientsからも切り離す
    fn unpublish(&self, entry: &StoreEntry) {
        if !entry.is_private() {
            let key = entry.key();
            let removed = {
                let mut index = self.index();
                if index.get(&key).is_some_and(|e| ptr::eq(Arc::as_ptr(e), entry)) {
                    index.remove(&key)
                } else {
                    None
                }
            };
            drop(removed);
            entry.set_private_key(self.private_key());
        }
        self.shared.transients.disconnect(self.worker, entry);
    }

    /// レスポンスヘッダーを設定
    ///
    /// 保存できないレスポンスは非公開にし、合流中の他ワーカーの読み手を解放させます。
    pub fn set_reply(&self, handle: &EntryHandle, reply: HttpReply) -> Result<()> {
        let entry = handle.entry();
        let config = &self.shared.config;
        let now = now_secs();
        let status = reply.status();
        let storable = CachePolicy::is_storable(&reply, &config.cacheable_statuses, config.negative_ttl_secs);

        entry.set_reply(reply, now)?;

        if CachePolicy::is_negative(status) && config.negative_ttl_secs > 0 {
            entry.set_flag(flags::NEGATIVE);
            let mut ts = entry.timestamps();
            ts.expires = Some(now + config.negative_ttl_secs as i64);
            entry.set_timestamps(ts);
        }

        if !storable {
            debug!("reply {} for {} is not storable", status, entry.store_id());
            self.unpublish(entry);
        } else if entry.request_cachable() {
            // 再検証で得た新しいレスポンスは通常スコープのキーに置く
            if let Err(e) = self.make_public(entry, KeyScope::Default) {
                debug!("keeping {} private: {}", entry.store_id(), e);
            }
        }

        self.renew(entry);
        entry.invoke_handlers();
        Ok(())
    }

    /// ボディデータを追加
    pub fn append(&self, handle: &EntryHandle, data: &[u8]) -> Result<()> {
        let entry = handle.entry();
        entry.append(data)?;
        self.renew(entry);
        entry.invoke_handlers();
        Ok(())
    }

    fn renew(&self, entry: &StoreEntry) {
        if let Some(index) = entry.transients_index() {
            self.shared.transients.renew(self.worker, index);
        }
    }

    /// 書き込み完了
    ///
    /// 公開エントリはメモリティアとディスクに書き出し、合流中の読み手に通知します。
    pub fn complete(&self, handle: &EntryHandle) -> Result<()> {
        let entry = handle.entry();
        if let Err(e) = entry.complete() {
            warn!("completing {} failed: {}", entry.store_id(), e);
            self.abort(handle);
            return Err(e);
        }

        if !entry.is_private() && !entry.is_release_requested() {
            self.store_committed(entry);
        }

        if let Some(index) = entry.transients_index() {
            self.shared.transients.complete_writing(self.worker, index);
        }
        entry.set_collapsing_requirement(false);
        entry.invoke_handlers();
        Ok(())
    }

    fn store_committed(&self, entry: &Arc<StoreEntry>) {
        let Some(mut obj) = entry.to_stored() else {
            return;
        };

        if let Some(selector) = obj.vary_selector.clone() {
            let base = entry.key();
            let variant = CacheKey::with_vary(entry.method(), entry.store_id(), selector.as_str(), entry.scope());
            let headers = obj.reply.vary().headers().cloned().unwrap_or_default();
            self.shared.vary.register(base, headers, selector, variant);
            obj.key = variant;

            let replaced = {
                let mut index = self.index();
                let base_entry = match index.get(&base) {
                    Some(e) if Arc::ptr_eq(e, entry) => index.remove(&base),
                    _ => None,
                };
                entry.set_public_key(variant);
                (base_entry, index.insert(variant, Arc::clone(entry)))
            };
            drop(replaced);
        }

        let key = obj.key;
        let size = obj.memory_usage();
        let memory = &self.shared.memory;
        if memory.should_cache(size) {
            let pages = memory.pages_for(size);
            if !self.memory_cache_has_space_for(pages) {
                self.free_memory_space(pages * memory.page_size());
            }
            match memory.write(obj.clone()) {
                Ok(()) => entry.set_mem_status(MemStatus::InMemory),
                Err(e) => debug!("memory tier refused {}: {}", key, e),
            }
        }

        let disk_size = obj.body.len() as u64;
        if self.shared.disks.accepts(disk_size) {
            match self.shared.disks.write(&obj, disk_size) {
                Ok(location) => entry.set_swap_location(Some(location)),
                Err(e) => warn!("swap out of {} failed: {}", key, e),
            }
        }
    }

    /// 書き込み中断
    pub fn abort(&self, handle: &EntryHandle) {
        let entry = handle.entry();
        debug!("aborting {}", entry.store_id());
        entry.abort();
        if let Some(index) = entry.transients_index() {
            self.shared.transients.abandon_writing(self.worker, index);
        }
        self.unpublish(entry);
        entry.invoke_handlers();
    }

    // 削除

    /// エントリを全ティアから削除
    ///
    /// `force` の場合、他ワーカーで読み出し中のコピーも解放させます。
    pub fn release(&self, entry: &StoreEntry, force: bool) {
        debug!("releasing {} (force: {})", entry.store_id(), force);
        entry.request_release();

        let was_public = !entry.is_private();
        let key = entry.key();
        if force {
            if let Some(index) = entry.transients_index() {
                self.shared.transients.evict_slot(index);
            }
        }
        self.unpublish(entry);

        if was_public {
            self.shared.memory.evict(&key);
            self.shared.disks.evict(&key);
            self.shared.vary.remove_variant(&key);
        }

        if !entry.locked() {
            self.destroy(entry);
        }
    }

    /// ローカルのエントリだけを非公開にする（ティアは既に削除済み）
    fn forget(&self, entry: &StoreEntry) {
        entry.request_release();
        self.unpublish(entry);
    }

    /// キーのオブジェクトを全ティアから削除
    ///
    /// 何か見つかった場合は `true`。存在しなくてもエラーにはなりません。
    pub fn evict_if_found(&self, key: &CacheKey) -> bool {
        if let Some(entry) = self.local(key) {
            self.release(&entry, true);
            self.shared.transients.evict(key);
            return true;
        }

        let in_memory = self.shared.memory.evict(key);
        let on_disk = self.shared.disks.evict(key);
        let in_transit = self.shared.transients.evict(key);
        self.shared.vary.remove_variant(key);
        in_memory || on_disk || in_transit
    }

    /// `store_id` の全キャッシュ可能メソッドのキーとVaryバリアントを削除
    fn evict_all_methods(&self, store_id: &str) -> bool {
        let mut found = false;
        for method in HttpMethod::CACHEABLE {
            let base = CacheKey::public(method, store_id, KeyScope::Default);
            found |= self.evict_if_found(&base);
            for variant in self.shared.vary.remove_base(&base) {
                found |= self.evict_if_found(&variant);
            }
        }
        found
    }

    /// PURGE: GET と HEAD のキー、および全バリアントを削除
    pub fn purge(&self, store_id: &str) -> PurgeOutcome {
        if self.evict_all_methods(store_id) {
            info!("purged {}", store_id);
            PurgeOutcome::Purged
        } else {
            debug!("nothing to purge for {}", store_id);
            PurgeOutcome::NotFound
        }
    }

    /// 安全でないメソッドによる無効化
    pub fn purge_all_cached(&self, store_id: &str) {
        if self.evict_all_methods(store_id) {
            debug!("invalidated cached copies of {}", store_id);
        }
    }

    // アイドル処理

    /// 参照カウントが 0 になったエントリを処理
    ///
    /// 確定済みのデータは共有ティアに残っているため、特殊エントリ以外の
    /// ローカルエントリは破棄します。
    pub fn handle_idle_entry(&self, entry: &StoreEntry) {
        if entry.is_special() {
            entry.set_mem_status(MemStatus::InMemory);
            return;
        }

        if !entry.is_private() && entry.mem_status() == MemStatus::InMemory {
            self.shared.memory.dereference(&entry.key());
        }
        debug!("destroying unlocked entry {}", entry.store_id());
        self.destroy(entry);
    }

    fn destroy(&self, entry: &StoreEntry) {
        let key = entry.key();
        let removed = {
            let mut index = self.index();
            if index.get(&key).is_some_and(|e| ptr::eq(Arc::as_ptr(e), entry)) {
                index.remove(&key)
            } else {
                None
            }
        };
        drop(removed);
        self.shared.transients.disconnect(self.worker, entry);
        entry.destroy_mem_object();
    }

    // 合流の同期

    /// 他ワーカーからの更新通知を処理
    pub fn sync(&self) -> usize {
        let pending = self.shared.transients.drain(self.worker);
        let count = pending.len();
        for index in pending {
            self.sync_collapsed(index);
        }
        count
    }

    /// Transientsスロットの更新をローカルエントリに反映
    pub fn sync_collapsed(&self, index: usize) {
        let Some(collapsed) = self.shared.transients.find_collapsed(self.worker, index) else {
            debug!("no local entry for transients slot {}", index);
            return;
        };

        if !collapsed.locked() {
            self.handle_idle_entry(&collapsed);
            return;
        }

        if collapsed.is_aborted() {
            debug!("skipping already aborted {}", collapsed.store_id());
            return;
        }

        let key = collapsed.key();
        let Some(status) = self.shared.transients.status(index) else {
            self.abort_collapsed(&collapsed, "lost transients slot");
            return;
        };

        if self.shared.transients.is_writer(self.worker, index) {
            // 読み手が変えられるのは削除予定フラグだけ
            if status.waiting_to_be_freed {
                self.forget(&collapsed);
            }
            return;
        }

        let (found, in_sync) = if collapsed.store_status() == StoreStatus::Committed
            && (collapsed.mem_status() == MemStatus::InMemory || collapsed.has_disk())
        {
            if let Some(obj) = self.shared.memory.get(&key) {
                collapsed.refresh_headers(&obj);
            }
            (true, true)
        } else {
            match self.anchor_to_cache(&collapsed, &key, Some(status)) {
                Ok(found) => (found, found),
                Err(e) => {
                    debug!("cannot anchor {}: {}", collapsed.store_id(), e);
                    self.abort_collapsed(&collapsed, "anchoring failed");
                    return;
                }
            }
        };

        if status.waiting_to_be_freed {
            debug!("releasing {} due to waitingToBeFreed", collapsed.store_id());
            self.forget(&collapsed);
            if !found {
                self.abort_collapsed(&collapsed, "waiting to be freed");
                return;
            }
        }

        if in_sync {
            debug!("synced {}", collapsed.store_id());
            collapsed.set_collapsing_requirement(false);
            collapsed.invoke_handlers();
            return;
        }

        if found {
            self.abort_collapsed(&collapsed, "unsyncable");
            return;
        }

        if !status.has_writer {
            self.abort_collapsed(&collapsed, "abandoned-by-writer");
            return;
        }

        debug!("waiting for {}", collapsed.store_id());
        collapsed.set_collapsing_requirement(true);
    }

    fn abort_collapsed(&self, entry: &StoreEntry, reason: &str) {
        debug!("aborting collapsed {}: {}", entry.store_id(), reason);
        entry.abort();
        entry.request_release();
        self.unpublish(entry);
        entry.invoke_handlers();
    }

    // 再検証

    /// 304レスポンスのヘッダーを既存エントリにマージ
    ///
    /// マージできない場合は `false`（呼び出し側はミスとして処理します）。
    pub fn update_on_not_modified(&self, old: &EntryHandle, e304: &EntryHandle) -> bool {
        // 同じ304を同じ古いエントリに何度も適用しない
        if e304.mark_applied_updates() {
            debug!("ignoring repeated update of {}", old.store_id());
            return true;
        }

        let Some(r304) = e304.freshest_reply() else {
            error!("304 entry for {} has no reply", old.store_id());
            return false;
        };

        match old.update_on_not_modified(&r304, now_secs()) {
            Ok(true) => {}
            Ok(false) => {
                debug!("304 for {} is older than the cached copy", old.store_id());
                return true;
            }
            Err(e) => {
                error!("cannot update {} on 304: {}", old.store_id(), e);
                return false;
            }
        }

        let Some(reply) = old.freshest_reply() else {
            return false;
        };
        let key = old.key();
        let timestamps: Timestamps = old.timestamps();

        if old.mem_status() == MemStatus::InMemory && !old.is_special() {
            if let Err(e) = self.shared.memory.update_headers(&key, &reply, timestamps) {
                warn!("memory tier header update of {} failed: {}", key, e);
            }
        }
        if let Some(location) = old.swap_location() {
            if let Err(e) = self.shared.disks.update_headers(&location, &key, &reply, timestamps) {
                warn!("disk header update of {} failed: {}", key, e);
            }
        }
        true
    }

    // 容量

    /// `pages` 分をメモリティアに格納できるか
    pub fn memory_cache_has_space_for(&self, pages: usize) -> bool {
        self.shared.memory.has_space_for(pages)
    }

    /// 置換ポリシーの順にメモリティアから削除して空きを作る
    ///
    /// 走査は全ワーカー合わせて1秒に1回までに制限されます。削除した数を返します。
    pub fn free_memory_space(&self, bytes: usize) -> usize {
        let memory = &self.shared.memory;
        let pages = memory.pages_for(bytes);
        if self.memory_cache_has_space_for(pages) {
            return 0;
        }

        if !self.shared.take_turn(&self.shared.last_memory_walk, MEMORY_WALK_INTERVAL) {
            debug!("memory walk rate-limited, {} pages requested", pages);
            return 0;
        }

        let mut removed = 0;
        for key in memory.select_victims(memory.len()) {
            if memory.evict(&key) {
                removed += 1;
            }
            if self.memory_cache_has_space_for(pages) {
                break;
            }
        }
        debug!("removed {} memory-cached objects for {} pages", removed, pages);
        removed
    }

    // 定期処理

    /// 期限切れリースの回収とディスクのサイズ調整
    pub fn maintain(&self) -> usize {
        let reaped = self.shared.transients.reap_expired_leases();
        let evicted = self.shared.disks.maintain();

        let disks = &self.shared.disks;
        let memory = &self.shared.memory;
        let over_disk = disks.max_size() > 0 && disks.current_size() > disks.max_size();
        let memory_full = memory.enabled() && !memory.has_space_for(1);
        if over_disk || memory_full {
            if self.shared.take_turn(&self.shared.last_limit_warning, LIMIT_WARNING_INTERVAL) {
                warn!(
                    "store at capacity: memory {}/{} bytes, disk {}/{} bytes",
                    memory.memory_usage(),
                    memory.capacity(),
                    disks.current_size(),
                    disks.max_size()
                );
            }
        }

        if !reaped.is_empty() || evicted > 0 {
            debug!("maintenance reaped {} leases, evicted {} disk objects", reaped.len(), evicted);
        }
        reaped.len() + evicted
    }

    // 問い合わせ

    /// キーが削除予定か
    pub fn marked_for_deletion(&self, key: &CacheKey) -> bool {
        self.shared.transients.marked_for_deletion(key)
    }

    /// 削除予定で、かつ読み手もライターもいないか
    pub fn marked_for_deletion_and_abandoned(&self, entry: &StoreEntry) -> bool {
        entry
            .transients_index()
            .and_then(|i| self.shared.transients.status(i))
            .is_some_and(|s| s.waiting_to_be_freed && s.reader_count == 0 && !s.has_writer)
    }

    /// 全ワーカーの読み手数
    pub fn transient_readers(&self, entry: &StoreEntry) -> usize {
        entry
            .transients_index()
            .map(|i| self.shared.transients.readers(i))
            .unwrap_or(0)
    }

    /// ディスクに読み出し可能なコピーがあるか
    pub fn has_readable_disk_entry(&self, entry: &StoreEntry) -> bool {
        entry.has_disk() || self.shared.disks.contains(&entry.key())
    }

    /// 統計情報を取得
    pub fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        let hits = shared.hits.load(Ordering::Relaxed);
        let misses = shared.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.index().len(),
            memory_objects: shared.memory.len(),
            memory_usage: shared.memory.memory_usage(),
            memory_capacity: shared.memory.capacity(),
            disk_objects: shared.disks.objects(),
            disk_usage: shared.disks.current_size(),
            disk_capacity: shared.disks.max_size(),
            transients: shared.transients.len(),
            hits,
            misses,
            collapsed: shared.collapsed.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            uptime_secs: shared.created_at.elapsed().as_secs(),
        }
    }
}
