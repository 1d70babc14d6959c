//! Transientsレジストリ
//!
//! 取得中のエントリを全ワーカーで共有し、同一キーへの同時リクエストを
//! 1回のオリジン取得に集約（Collapsed Forwarding）します。
//!
//! ## ロック順序
//!
//! `by_key` → `slots` の順に取得します。逆順で保持してはいけません。
//!
//! ## ライターリース
//!
//! ライター登録は書き込みの進行で更新されるリースです。
//! `writer_lease_secs` 更新されなかったライターは存在しないものとして扱います。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ftlog::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::entry::StoreEntry;
use super::error::{Result, StoreError};
use super::key::{CacheKey, HttpMethod};

/// I/O方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

/// スロット状態のスナップショット
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStatus {
    /// 有効なリースを持つライターがいる
    pub has_writer: bool,
    /// 読み手の数（全ワーカー合計）
    pub reader_count: usize,
    /// 削除予定
    pub waiting_to_be_freed: bool,
    /// ライターが完了せずに去った
    pub aborted_by_writer: bool,
    /// ライターが書き込みを完了した
    pub complete: bool,
}

/// 他ワーカーのエントリを発見するための情報
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub index: usize,
    pub store_id: Box<str>,
    pub method: HttpMethod,
}

struct WriterLease {
    worker: u32,
    renewed: Instant,
}

struct TransientSlot {
    key: CacheKey,
    store_id: Box<str>,
    method: HttpMethod,
    writer: Option<WriterLease>,
    /// ワーカー → 読み手数
    readers: HashMap<u32, usize>,
    waiting_to_be_freed: bool,
    complete: bool,
    aborted_by_writer: bool,
}

impl TransientSlot {
    fn new(key: CacheKey, store_id: &str, method: HttpMethod) -> Self {
        Self {
            key,
            store_id: store_id.into(),
            method,
            writer: None,
            readers: HashMap::new(),
            waiting_to_be_freed: false,
            complete: false,
            aborted_by_writer: false,
        }
    }

    fn unused(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    fn reader_count(&self) -> usize {
        self.readers.values().sum()
    }

    fn reader_workers(&self) -> Vec<u32> {
        self.readers.keys().copied().collect()
    }

    /// 読み手ワーカーに、失効したライターのワーカーを加える
    ///
    /// 同じワーカー上でライターのエントリに合流している読み手は
    /// 読み手として登録されないため、ライターのワーカーにも通知が必要です。
    fn workers_with(&self, lapsed: Option<u32>) -> Vec<u32> {
        let mut workers = self.reader_workers();
        if let Some(worker) = lapsed {
            if !workers.contains(&worker) {
                workers.push(worker);
            }
        }
        workers
    }

    fn live_writer(&self, lease: Duration) -> Option<u32> {
        self.writer
            .as_ref()
            .filter(|w| w.renewed.elapsed() < lease)
            .map(|w| w.worker)
    }
}

/// Transientsレジストリ
pub struct Transients {
    /// キー → 現在のスロット
    by_key: DashMap<CacheKey, usize>,
    /// スロット
    slots: DashMap<usize, TransientSlot>,
    next_index: AtomicUsize,
    /// (ワーカー, スロット) → ローカルエントリ
    locals: DashMap<(u32, usize), Weak<StoreEntry>>,
    /// ワーカーごとの更新通知キュー
    notify: DashMap<u32, VecDeque<usize>>,
    /// ライターリース期間
    lease: Duration,
}

impl Transients {
    pub fn new(writer_lease_secs: u64) -> Self {
        Self {
            by_key: DashMap::new(),
            slots: DashMap::new(),
            next_index: AtomicUsize::new(0),
            locals: DashMap::new(),
            notify: DashMap::new(),
            lease: Duration::from_secs(writer_lease_secs),
        }
    }

    fn allocate(&self, key: CacheKey, entry: &StoreEntry, worker: u32, mode: IoMode) -> usize {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let mut slot = TransientSlot::new(key, entry.store_id(), entry.method());
        match mode {
            IoMode::Write => {
                slot.writer = Some(WriterLease {
                    worker,
                    renewed: Instant::now(),
                })
            }
            IoMode::Read => {
                slot.readers.insert(worker, 1);
            }
        }
        self.slots.insert(index, slot);
        index
    }

    /// エントリを `key` の読み手またはライターとして登録
    ///
    /// ライター登録は、有効なライターが既にいれば `OwnershipConflict` で失敗します。
    /// 削除予定のスロットへの読み手登録は `MarkedForDeletion` で失敗します。
    pub fn monitor_io(&self, worker: u32, entry: &Arc<StoreEntry>, key: CacheKey, mode: IoMode) -> Result<usize> {
        if let Some(index) = entry.transients_index() {
            // 既にこのキーのスロットに接続済み
            return Ok(index);
        }

        let mut superseded = None;
        let index = match self.by_key.entry(key) {
            Entry::Vacant(v) => {
                // キャッシュ済みオブジェクトの読み手も削除通知を受け取るためにスロットを持つ
                let index = self.allocate(key, entry, worker, mode);
                v.insert(index);
                index
            }
            Entry::Occupied(mut o) => {
                let current = *o.get();
                let slot = self.slots.get_mut(&current);
                match (mode, slot) {
                    (IoMode::Read, Some(mut slot)) => {
                        if slot.waiting_to_be_freed {
                            return Err(StoreError::MarkedForDeletion(key));
                        }
                        *slot.readers.entry(worker).or_insert(0) += 1;
                        current
                    }
                    (IoMode::Read, None) | (IoMode::Write, None) => {
                        let index = self.allocate(key, entry, worker, mode);
                        o.insert(index);
                        index
                    }
                    (IoMode::Write, Some(mut slot)) => {
                        if let Some(owner) = slot.live_writer(self.lease) {
                            debug!("transients writer collision on {} (held by worker {})", key, owner);
                            return Err(StoreError::OwnershipConflict(key));
                        }
                        let lapsed = slot.writer.take().map(|w| w.worker).filter(|_| !slot.complete);
                        if lapsed.is_some() {
                            warn!("taking over {} from an expired writer", key);
                            slot.aborted_by_writer = true;
                        }

                        // 既存スロットは使用者がいなくなるまで残す
                        if slot.unused() && lapsed.is_none() {
                            drop(slot);
                            self.slots.remove(&current);
                        } else {
                            if !slot.complete {
                                slot.waiting_to_be_freed = true;
                            }
                            superseded = Some((current, slot.workers_with(lapsed)));
                            drop(slot);
                        }
                        let index = self.allocate(key, entry, worker, IoMode::Write);
                        o.insert(index);
                        index
                    }
                }
            }
        };

        if let Some((old, workers)) = superseded {
            self.broadcast_to(old, &workers);
        }

        entry.set_transients_index(Some(index));
        self.locals.insert((worker, index), Arc::downgrade(entry));
        Ok(index)
    }

    /// 他ワーカーが書き込み中・読み込み中のスロットを探す
    ///
    /// 削除予定のスロットと、このワーカーが既にローカルエントリを持つスロットは返しません。
    pub fn lookup(&self, worker: u32, key: &CacheKey) -> Option<SlotInfo> {
        let index = *self.by_key.get(key)?;
        if self.find_collapsed(worker, index).is_some() {
            debug!("not joining private transients entry {}", key);
            return None;
        }
        let slot = self.slots.get(&index)?;
        if slot.waiting_to_be_freed {
            return None;
        }
        Some(SlotInfo {
            index,
            store_id: slot.store_id.clone(),
            method: slot.method,
        })
    }

    /// スロット状態のスナップショット
    pub fn status(&self, index: usize) -> Option<EntryStatus> {
        let slot = self.slots.get(&index)?;
        Some(EntryStatus {
            has_writer: slot.live_writer(self.lease).is_some(),
            reader_count: slot.reader_count(),
            waiting_to_be_freed: slot.waiting_to_be_freed,
            aborted_by_writer: slot.aborted_by_writer,
            complete: slot.complete,
        })
    }

    /// スロット番号からローカルエントリを引く
    pub fn find_collapsed(&self, worker: u32, index: usize) -> Option<Arc<StoreEntry>> {
        self.locals.get(&(worker, index)).and_then(|w| w.upgrade())
    }

    /// このワーカーがスロットのライターか
    pub fn is_writer(&self, worker: u32, index: usize) -> bool {
        self.slots
            .get(&index)
            .is_some_and(|s| s.writer.as_ref().is_some_and(|w| w.worker == worker))
    }

    /// このワーカーがスロットの読み手か
    pub fn is_reader(&self, worker: u32, index: usize) -> bool {
        self.slots.get(&index).is_some_and(|s| s.readers.contains_key(&worker))
    }

    /// 読み手の数
    pub fn readers(&self, index: usize) -> usize {
        self.slots.get(&index).map(|s| s.reader_count()).unwrap_or(0)
    }

    /// 削除予定かどうか
    pub fn marked_for_deletion(&self, key: &CacheKey) -> bool {
        let Some(index) = self.by_key.get(key).map(|i| *i) else {
            return false;
        };
        self.slots.get(&index).is_some_and(|s| s.waiting_to_be_freed)
    }

    /// 書き込みの進行でリースを更新
    pub fn renew(&self, worker: u32, index: usize) {
        if let Some(mut slot) = self.slots.get_mut(&index) {
            if let Some(writer) = slot.writer.as_mut().filter(|w| w.worker == worker) {
                writer.renewed = Instant::now();
            }
        }
    }

    /// 書き込み完了
    ///
    /// ライターは以後そのスロットの読み手として残り、削除通知を受け取ります。
    pub fn complete_writing(&self, worker: u32, index: usize) {
        let workers = match self.slots.get_mut(&index) {
            Some(mut slot) => {
                if !slot.writer.as_ref().is_some_and(|w| w.worker == worker) {
                    return;
                }
                slot.writer = None;
                slot.complete = true;
                let workers = slot.reader_workers();
                *slot.readers.entry(worker).or_insert(0) += 1;
                workers
            }
            None => return,
        };
        self.broadcast_to(index, &workers);
    }

    /// ライターが完了せずに書き込みを止めた
    pub fn abandon_writing(&self, worker: u32, index: usize) {
        let workers = match self.slots.get_mut(&index) {
            Some(mut slot) => {
                if !slot.writer.as_ref().is_some_and(|w| w.worker == worker) {
                    return;
                }
                slot.writer = None;
                slot.aborted_by_writer = true;
                slot.waiting_to_be_freed = true;
                slot.reader_workers()
            }
            None => return,
        };
        debug!("transients slot {} abandoned by worker {}", index, worker);
        self.broadcast_to(index, &workers);
    }

    /// ワーカーのローカルエントリを切り離す
    ///
    /// 未完了のライターが切り離された場合は放棄として扱います。
    /// 使用者がいなくなったスロットは削除されます。
    pub fn disconnect(&self, worker: u32, entry: &StoreEntry) {
        let Some(index) = entry.transients_index() else {
            return;
        };
        entry.set_transients_index(None);
        self.locals.remove(&(worker, index));

        let Some(key) = self.slots.get(&index).map(|s| s.key) else {
            return;
        };

        let mut abandoned = None;
        match self.by_key.entry(key) {
            Entry::Occupied(o) => {
                let mapped = *o.get() == index;
                let unused = self.release_slot_user(worker, index, &mut abandoned);
                if unused {
                    self.slots.remove(&index);
                    if mapped {
                        o.remove();
                    }
                }
            }
            Entry::Vacant(_) => {
                if self.release_slot_user(worker, index, &mut abandoned) {
                    self.slots.remove(&index);
                }
            }
        }

        if let Some(workers) = abandoned {
            warn!("writer of {} disconnected before completing", key);
            self.broadcast_to(index, &workers);
        }
    }

    /// スロットからワーカーの登録を外し、スロットが未使用になったかを返す
    fn release_slot_user(&self, worker: u32, index: usize, abandoned: &mut Option<Vec<u32>>) -> bool {
        let Some(mut slot) = self.slots.get_mut(&index) else {
            return false;
        };
        if slot.writer.as_ref().is_some_and(|w| w.worker == worker) {
            slot.writer = None;
            if !slot.complete {
                slot.aborted_by_writer = true;
                slot.waiting_to_be_freed = true;
                *abandoned = Some(slot.reader_workers());
            }
        } else if let Some(count) = slot.readers.get_mut(&worker) {
            *count -= 1;
            if *count == 0 {
                slot.readers.remove(&worker);
            }
        }
        slot.unused()
    }

    /// キーのスロットを削除予定にする
    ///
    /// 読み手がいなければ即座に削除します。スロットがあれば `true`。
    pub fn evict(&self, key: &CacheKey) -> bool {
        let (index, workers) = match self.by_key.entry(*key) {
            Entry::Occupied(o) => {
                let index = *o.get();
                let Some(mut slot) = self.slots.get_mut(&index) else {
                    o.remove();
                    return false;
                };
                if slot.unused() {
                    drop(slot);
                    self.slots.remove(&index);
                    o.remove();
                    return true;
                }
                slot.waiting_to_be_freed = true;
                (index, slot.reader_workers())
            }
            Entry::Vacant(_) => return false,
        };
        debug!("transients slot {} for {} marked for deletion", index, key);
        self.broadcast_to(index, &workers);
        true
    }

    /// スロット番号で削除予定にする
    pub fn evict_slot(&self, index: usize) {
        let Some(key) = self.slots.get(&index).map(|s| s.key) else {
            return;
        };
        let workers = match self.slots.get_mut(&index) {
            Some(mut slot) => {
                slot.waiting_to_be_freed = true;
                slot.reader_workers()
            }
            None => return,
        };
        debug!("transients slot {} for {} marked for deletion", index, key);
        self.broadcast_to(index, &workers);
    }

    /// 期限切れのライターリースを回収
    ///
    /// 回収したスロットの読み手と、失効したライターのワーカーに通知が送られます。
    pub fn reap_expired_leases(&self) -> Vec<usize> {
        let mut reaped = Vec::new();
        for mut slot in self.slots.iter_mut() {
            let expired = slot
                .writer
                .as_ref()
                .is_some_and(|w| w.renewed.elapsed() >= self.lease);
            if expired && !slot.complete {
                let lapsed = slot.writer.take().map(|w| w.worker);
                slot.aborted_by_writer = true;
                slot.waiting_to_be_freed = true;
                reaped.push((*slot.key(), slot.workers_with(lapsed)));
            }
        }

        let mut indexes = Vec::with_capacity(reaped.len());
        for (index, workers) in reaped {
            warn!("reaped expired writer lease on transients slot {}", index);
            self.broadcast_to(index, &workers);
            indexes.push(index);
        }
        indexes
    }

    /// スロットの読み手ワーカーに更新を通知
    fn broadcast_to(&self, index: usize, workers: &[u32]) {
        for &worker in workers {
            self.notify.entry(worker).or_default().push_back(index);
        }
    }

    /// ワーカーに届いた通知を取り出す
    pub fn drain(&self, worker: u32) -> Vec<usize> {
        match self.notify.get_mut(&worker) {
            Some(mut queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// スロット数
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 有効なライター数
    pub fn writers(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.live_writer(self.lease).is_some())
            .count()
    }
}
