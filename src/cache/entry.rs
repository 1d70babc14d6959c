//! ストアエントリ
//!
//! キャッシュ済み、または取得中のレスポンス1件を表します。
//! エントリ自体はワーカーローカルで、共有ティアには確定済みの
//! `StoredObject` だけが置かれます。

use std::fmt;
use std::ops::{Deref, Range};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ftlog::debug;

use super::controller::Controller;
use super::error::{Result, StoreError};
use super::key::{CacheKey, HttpMethod, KeyScope};
use super::reply::{Header, HttpReply};
use super::request::RequestInfo;
use super::vary::VarySelector;

/// エントリフラグ
pub mod flags {
    /// 公開キーを持たない（キーで発見できない）
    pub const PRIVATE: u32 = 1 << 0;
    /// 特殊エントリ（削除・PURGE不可）
    pub const SPECIAL: u32 = 1 << 1;
    /// 書き込み途中で中断された
    pub const ABORTED: u32 = 1 << 2;
    /// 長さ不一致
    pub const BAD_LENGTH: u32 = 1 << 3;
    /// 他のリクエストはこのエントリの完了を待つ必要がある
    pub const REQUIRES_COLLAPSING: u32 = 1 << 4;
    /// 全ティアからの削除が要求された
    pub const RELEASE_REQUESTED: u32 = 1 << 5;
    /// ネガティブキャッシュ
    pub const NEGATIVE: u32 = 1 << 6;
}

/// ストア状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// 取得中（ボディ長は未確定）
    Pending,
    /// 確定済み
    Committed,
}

/// メモリ状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemStatus {
    NotInMemory,
    InMemory,
}

/// タイムスタンプ（UNIX秒）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamps {
    /// レスポンスが生成された時刻（Date、Age補正済み）
    pub timestamp: Option<i64>,
    /// 最終参照時刻
    pub lastref: Option<i64>,
    /// Last-Modified
    pub lastmod: Option<i64>,
    /// Expires
    pub expires: Option<i64>,
}

impl Timestamps {
    /// レスポンスからタイムスタンプを設定
    pub fn from_reply(reply: &HttpReply, now: i64) -> Self {
        let mut served = match reply.date() {
            Some(date) if date <= now => date,
            _ => now,
        };

        let age = reply
            .header(b"age")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if age > now - served && now > age {
            served = now - age;
        }

        Self {
            timestamp: Some(served),
            lastref: Some(now),
            lastmod: reply.last_modified(),
            expires: reply.expires(),
        }
    }

    /// 更新判定に使う最終更新時刻
    ///
    /// Last-Modified がなければレスポンス時刻を使います。
    #[inline]
    pub fn last_modified(&self) -> Option<i64> {
        self.lastmod.or(self.timestamp)
    }
}

/// ディスク上の位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapLocation {
    /// ディスク番号
    pub disk: usize,
    /// ファイル番号
    pub filen: u64,
    /// 永続化サイズ（メタデータ込み）
    pub size: u64,
}

/// ボディバッファ
enum BodyBuffer {
    /// 書き込み中
    Growing(Vec<u8>),
    /// 確定済み（共有ティアと共有）
    Frozen(Arc<[u8]>),
}

impl BodyBuffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            BodyBuffer::Growing(v) => v,
            BodyBuffer::Frozen(a) => a,
        }
    }

    fn freeze(&mut self) -> Arc<[u8]> {
        if let BodyBuffer::Growing(v) = self {
            let frozen: Arc<[u8]> = std::mem::take(v).into();
            *self = BodyBuffer::Frozen(frozen);
        }
        match self {
            BodyBuffer::Frozen(a) => Arc::clone(a),
            BodyBuffer::Growing(_) => Arc::from(Vec::new()),
        }
    }
}

/// 更新通知ハンドラ
pub type Handler = Box<dyn FnOnce() + Send>;

/// 構築中／読み出し中のレスポンス
pub struct MemObject {
    reply: Option<HttpReply>,
    body: BodyBuffer,
    applied_updates: bool,
    handlers: Vec<Handler>,
    request_headers: Vec<Header>,
    vary_selector: Option<VarySelector>,
    /// 書き込みリクエストのキースコープ
    scope: KeyScope,
    /// 書き込みリクエストがキャッシュ可能か
    cachable: bool,
}

impl MemObject {
    fn new(request_headers: Vec<Header>) -> Self {
        Self {
            reply: None,
            body: BodyBuffer::Growing(Vec::new()),
            applied_updates: false,
            handlers: Vec::new(),
            request_headers,
            vary_selector: None,
            scope: KeyScope::Default,
            cachable: false,
        }
    }

    #[inline]
    pub fn reply(&self) -> Option<&HttpReply> {
        self.reply.as_ref()
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }

    #[inline]
    pub fn request_headers(&self) -> &[Header] {
        &self.request_headers
    }

    #[inline]
    pub fn vary_selector(&self) -> Option<&VarySelector> {
        self.vary_selector.as_ref()
    }
}

/// 共有ティアが保持する確定済みオブジェクト
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: CacheKey,
    pub store_id: Box<str>,
    pub method: HttpMethod,
    pub reply: HttpReply,
    pub body: Arc<[u8]>,
    pub timestamps: Timestamps,
    pub negative: bool,
    pub vary_selector: Option<VarySelector>,
}

impl StoredObject {
    /// 概算メモリ使用量
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.store_id.len() + self.reply.memory_usage() + self.body.len()
    }

    /// ヘッダーだけを差し替えたコピーを作成
    pub fn with_reply(&self, reply: HttpReply, timestamps: Timestamps) -> Self {
        Self {
            reply,
            timestamps,
            ..self.clone()
        }
    }
}

struct EntryState {
    key: CacheKey,
    store_status: StoreStatus,
    mem_status: MemStatus,
    timestamps: Timestamps,
    swap: Option<SwapLocation>,
    transients_index: Option<usize>,
    mem: Option<MemObject>,
}

/// ストアエントリ
pub struct StoreEntry {
    store_id: Box<str>,
    method: HttpMethod,
    flags: AtomicU32,
    lock_count: AtomicU32,
    state: Mutex<EntryState>,
}

impl StoreEntry {
    /// リクエストに対する新しい Pending エントリをプライベートキーで作成
    pub fn new_private(key: CacheKey, request: &RequestInfo) -> Self {
        let mut mem = MemObject::new(request.headers().to_vec());
        mem.scope = request.key_scope();
        mem.cachable = request.flags().cachable;

        Self {
            store_id: request.store_id().into(),
            method: request.method(),
            flags: AtomicU32::new(flags::PRIVATE),
            lock_count: AtomicU32::new(0),
            state: Mutex::new(EntryState {
                key,
                store_status: StoreStatus::Pending,
                mem_status: MemStatus::NotInMemory,
                timestamps: Timestamps::default(),
                swap: None,
                transients_index: None,
                mem: Some(mem),
            }),
        }
    }

    /// 他ワーカーが書き込み中のエントリのローカル代理を作成
    ///
    /// Transientsへの読み手登録は呼び出し側が行います。
    pub fn new_collapsed(key: CacheKey, store_id: &str, method: HttpMethod) -> Self {
        Self {
            store_id: store_id.into(),
            method,
            flags: AtomicU32::new(flags::REQUIRES_COLLAPSING),
            lock_count: AtomicU32::new(0),
            state: Mutex::new(EntryState {
                key,
                store_status: StoreStatus::Pending,
                mem_status: MemStatus::NotInMemory,
                timestamps: Timestamps::default(),
                swap: None,
                transients_index: None,
                mem: Some(MemObject::new(Vec::new())),
            }),
        }
    }

    /// 共有ティアのオブジェクトから確定済みエントリを作成
    pub fn from_stored(obj: &StoredObject, mem_status: MemStatus, swap: Option<SwapLocation>) -> Self {
        let mut mem = MemObject::new(Vec::new());
        mem.reply = Some(obj.reply.clone());
        mem.body = BodyBuffer::Frozen(Arc::clone(&obj.body));
        mem.vary_selector = obj.vary_selector.clone();

        let mut bits = 0;
        if obj.negative {
            bits |= flags::NEGATIVE;
        }

        Self {
            store_id: obj.store_id.clone(),
            method: obj.method,
            flags: AtomicU32::new(bits),
            lock_count: AtomicU32::new(0),
            state: Mutex::new(EntryState {
                key: obj.key,
                store_status: StoreStatus::Committed,
                mem_status,
                timestamps: obj.timestamps,
                swap,
                transients_index: None,
                mem: Some(mem),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn key(&self) -> CacheKey {
        self.state().key
    }

    #[inline]
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    #[inline]
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    // フラグ

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    pub(crate) fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.has_flag(flags::PRIVATE)
    }

    #[inline]
    pub fn is_special(&self) -> bool {
        self.has_flag(flags::SPECIAL)
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.has_flag(flags::ABORTED)
    }

    #[inline]
    pub fn has_bad_length(&self) -> bool {
        self.has_flag(flags::BAD_LENGTH)
    }

    #[inline]
    pub fn is_release_requested(&self) -> bool {
        self.has_flag(flags::RELEASE_REQUESTED)
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        self.has_flag(flags::NEGATIVE)
    }

    /// ヒットさせるには書き込み完了を待つ必要があるか
    #[inline]
    pub fn hitting_requires_collapsing(&self) -> bool {
        self.has_flag(flags::REQUIRES_COLLAPSING)
    }

    pub fn set_collapsing_requirement(&self, required: bool) {
        if required {
            self.set_flag(flags::REQUIRES_COLLAPSING);
        } else {
            self.clear_flag(flags::REQUIRES_COLLAPSING);
        }
    }

    /// 特殊エントリとしてマーク
    pub fn mark_special(&self) {
        self.set_flag(flags::SPECIAL);
    }

    /// 新しい読み手にヒットを返してよいか
    #[inline]
    pub fn may_start_hitting(&self) -> bool {
        !self.is_private() && !self.is_release_requested() && !self.is_aborted()
    }

    // 状態

    #[inline]
    pub fn store_status(&self) -> StoreStatus {
        self.state().store_status
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.store_status() == StoreStatus::Pending
    }

    /// 書き込みを受け付けているか
    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.is_pending() && !self.is_aborted()
    }

    #[inline]
    pub fn mem_status(&self) -> MemStatus {
        self.state().mem_status
    }

    pub(crate) fn set_mem_status(&self, status: MemStatus) {
        self.state().mem_status = status;
    }

    #[inline]
    pub fn timestamps(&self) -> Timestamps {
        self.state().timestamps
    }

    pub(crate) fn set_timestamps(&self, timestamps: Timestamps) {
        self.state().timestamps = timestamps;
    }

    /// 最終参照時刻を更新
    pub fn touch(&self, now: i64) {
        self.state().timestamps.lastref = Some(now);
    }

    #[inline]
    pub fn swap_location(&self) -> Option<SwapLocation> {
        self.state().swap
    }

    pub(crate) fn set_swap_location(&self, swap: Option<SwapLocation>) {
        self.state().swap = swap;
    }

    #[inline]
    pub fn has_disk(&self) -> bool {
        self.swap_location().is_some()
    }

    #[inline]
    pub fn transients_index(&self) -> Option<usize> {
        self.state().transients_index
    }

    pub(crate) fn set_transients_index(&self, index: Option<usize>) {
        self.state().transients_index = index;
    }

    #[inline]
    pub fn has_transients(&self) -> bool {
        self.transients_index().is_some()
    }

    /// 公開キーに切り替え
    pub(crate) fn set_public_key(&self, key: CacheKey) {
        self.state().key = key;
        self.clear_flag(flags::PRIVATE);
    }

    /// プライベートキーに切り替え
    pub(crate) fn set_private_key(&self, key: CacheKey) {
        self.set_flag(flags::PRIVATE);
        self.state().key = key;
    }

    // 参照カウント

    pub(crate) fn lock(&self, reason: &'static str) -> u32 {
        let count = self.lock_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("{} locked by {} ({})", self.store_id, reason, count);
        count
    }

    pub(crate) fn unlock(&self, reason: &'static str) -> u32 {
        let prev = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unlock without lock");
        debug!("{} unlocked by {} ({})", self.store_id, reason, prev - 1);
        prev - 1
    }

    #[inline]
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn locked(&self) -> bool {
        self.lock_count() > 0
    }

    // レスポンス

    /// MemObject を参照
    pub fn with_mem<R>(&self, f: impl FnOnce(&MemObject) -> R) -> Option<R> {
        self.state().mem.as_ref().map(f)
    }

    #[inline]
    pub fn has_mem_object(&self) -> bool {
        self.state().mem.is_some()
    }

    /// 最新のレスポンスヘッダー
    pub fn freshest_reply(&self) -> Option<HttpReply> {
        self.state().mem.as_ref().and_then(|m| m.reply.clone())
    }

    /// ステータスコード
    pub fn status(&self) -> Option<u16> {
        self.state().mem.as_ref().and_then(|m| m.reply.as_ref().map(|r| r.status()))
    }

    /// 現在受信済みのボディ長
    pub fn body_len(&self) -> u64 {
        self.state().mem.as_ref().map(|m| m.body().len() as u64).unwrap_or(0)
    }

    /// ボディの指定範囲を参照
    pub fn with_body<R>(&self, range: Range<u64>, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let state = self.state();
        let body = state.mem.as_ref()?.body();
        let end = (range.end as usize).min(body.len());
        let start = (range.start as usize).min(end);
        Some(f(&body[start..end]))
    }

    /// ボディ全体のコピー
    pub fn body(&self) -> Vec<u8> {
        self.state().mem.as_ref().map(|m| m.body().to_vec()).unwrap_or_default()
    }

    /// Varyセレクタ（書き込みリクエストから計算）
    pub fn vary_selector(&self) -> Option<VarySelector> {
        self.state().mem.as_ref().and_then(|m| m.vary_selector.clone())
    }

    /// 書き込みリクエストのキースコープ
    pub fn scope(&self) -> KeyScope {
        self.state().mem.as_ref().map(|m| m.scope).unwrap_or_default()
    }

    /// 書き込みリクエストがキャッシュ可能か
    pub fn request_cachable(&self) -> bool {
        self.state().mem.as_ref().is_some_and(|m| m.cachable)
    }

    /// ティアのオブジェクトをこのエントリに結び付ける
    ///
    /// 他ワーカーが書き込んだ内容を読み手エントリに取り込みます。
    pub(crate) fn anchor(&self, obj: &StoredObject, mem_status: MemStatus, swap: Option<SwapLocation>) {
        let mut state = self.state();
        let mem = state.mem.get_or_insert_with(|| MemObject::new(Vec::new()));
        mem.reply = Some(obj.reply.clone());
        mem.body = BodyBuffer::Frozen(Arc::clone(&obj.body));
        mem.vary_selector = obj.vary_selector.clone();
        state.store_status = StoreStatus::Committed;
        state.mem_status = mem_status;
        state.timestamps = obj.timestamps;
        if swap.is_some() {
            state.swap = swap;
        }
        if obj.negative {
            self.set_flag(flags::NEGATIVE);
        }
    }

    /// 結び付け済みのオブジェクトからヘッダーを取り込む
    pub(crate) fn refresh_headers(&self, obj: &StoredObject) {
        let mut state = self.state();
        state.timestamps = obj.timestamps;
        if let Some(mem) = state.mem.as_mut() {
            mem.reply = Some(obj.reply.clone());
        }
    }

    /// レスポンスヘッダーを設定
    pub(crate) fn set_reply(&self, reply: HttpReply, now: i64) -> Result<()> {
        let mut state = self.state();
        if state.store_status != StoreStatus::Pending || self.is_aborted() {
            return Err(StoreError::InvalidState("reply set on a non-accepting entry"));
        }
        let mem = state.mem.as_mut().ok_or(StoreError::InvalidState("entry has no memory object"))?;
        if let Some(names) = reply.vary().headers() {
            mem.vary_selector = Some(VarySelector::compute(names, &mem.request_headers));
        }
        mem.reply = Some(reply);
        let timestamps = Timestamps::from_reply(mem.reply.as_ref().ok_or(StoreError::InvalidState("reply missing"))?, now);
        state.timestamps = timestamps;
        Ok(())
    }

    /// ボディデータを追加
    pub(crate) fn append(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.store_status != StoreStatus::Pending || self.is_aborted() {
            return Err(StoreError::InvalidState("append to a non-accepting entry"));
        }
        let mem = state.mem.as_mut().ok_or(StoreError::InvalidState("entry has no memory object"))?;
        match &mut mem.body {
            BodyBuffer::Growing(v) => {
                v.extend_from_slice(data);
                Ok(())
            }
            BodyBuffer::Frozen(_) => Err(StoreError::InvalidState("append to a frozen body")),
        }
    }

    /// 書き込み完了: Pending → Committed
    ///
    /// Content-Length と受信長が一致しない場合は `BadLength` になります（304 と HEAD は除く）。
    pub(crate) fn complete(&self) -> Result<()> {
        let mut state = self.state();
        if state.store_status != StoreStatus::Pending || self.is_aborted() {
            return Err(StoreError::InvalidState("complete on a non-accepting entry"));
        }
        let mem = state.mem.as_mut().ok_or(StoreError::InvalidState("entry has no memory object"))?;
        let reply = mem.reply.as_ref().ok_or(StoreError::InvalidState("complete without reply"))?;
        let actual = mem.body().len() as u64;
        if let Some(expected) = reply.content_length() {
            if expected != actual && reply.status() != 304 && self.method != HttpMethod::Head {
                self.set_flag(flags::BAD_LENGTH);
                return Err(StoreError::BadLength { expected, actual });
            }
        }
        mem.body.freeze();
        state.store_status = StoreStatus::Committed;
        Ok(())
    }

    /// 中断: Pending → Aborted（終端）
    pub(crate) fn abort(&self) {
        self.set_flag(flags::ABORTED);
        self.set_collapsing_requirement(false);
        self.state().mem_status = MemStatus::NotInMemory;
    }

    /// 全ティアからの削除を要求
    pub(crate) fn request_release(&self) {
        self.set_flag(flags::RELEASE_REQUESTED);
    }

    /// 更新通知ハンドラを登録
    pub fn on_update(&self, handler: Handler) {
        if let Some(mem) = self.state().mem.as_mut() {
            mem.handlers.push(handler);
        }
    }

    /// 登録済みハンドラを呼び出す
    pub fn invoke_handlers(&self) {
        let handlers = match self.state().mem.as_mut() {
            Some(mem) => std::mem::take(&mut mem.handlers),
            None => return,
        };
        for handler in handlers {
            handler();
        }
    }

    /// 304マージ済みフラグを立てる
    ///
    /// 既に立っていた場合は `true` を返します。
    pub(crate) fn mark_applied_updates(&self) -> bool {
        match self.state().mem.as_mut() {
            Some(mem) => std::mem::replace(&mut mem.applied_updates, true),
            None => false,
        }
    }

    /// 304レスポンスのヘッダーをマージ
    ///
    /// 何も更新しなかった場合は `Ok(false)` を返します。
    pub(crate) fn update_on_not_modified(&self, r304: &HttpReply, now: i64) -> Result<bool> {
        let mut state = self.state();
        let mem = state.mem.as_mut().ok_or(StoreError::InvalidState("entry has no memory object"))?;
        let reply = mem
            .reply
            .as_mut()
            .ok_or_else(|| StoreError::UpdateConflict("cached entry has no reply".into()))?;

        // 古い304で新しいヘッダーを上書きしない
        if r304.older_than(reply) {
            return Ok(false);
        }

        reply.update_on_not_modified(r304);
        let timestamps = Timestamps::from_reply(reply, now);
        state.timestamps = timestamps;
        Ok(true)
    }

    /// 確定済みオブジェクトを作成
    pub fn to_stored(&self) -> Option<StoredObject> {
        let mut state = self.state();
        if state.store_status != StoreStatus::Committed {
            return None;
        }
        let key = state.key;
        let timestamps = state.timestamps;
        let mem = state.mem.as_mut()?;
        Some(StoredObject {
            key,
            store_id: self.store_id.clone(),
            method: self.method,
            reply: mem.reply.clone()?,
            body: mem.body.freeze(),
            timestamps,
            negative: self.is_negative(),
            vary_selector: mem.vary_selector.clone(),
        })
    }

    /// MemObject を破棄
    pub(crate) fn destroy_mem_object(&self) {
        let mut state = self.state();
        state.mem = None;
        state.mem_status = MemStatus::NotInMemory;
    }

    /// `ims` 以降に更新されているか
    pub fn modified_since(&self, ims: i64) -> bool {
        match self.timestamps().last_modified() {
            Some(modified) => modified > ims,
            None => true,
        }
    }

    /// 有効なネガティブヒットかどうか
    pub fn check_negative_hit(&self, now: i64) -> bool {
        if !self.is_negative() || self.store_status() != StoreStatus::Committed {
            return false;
        }
        matches!(self.timestamps().expires, Some(expires) if expires > now)
    }

    /// 概算メモリ使用量
    pub fn memory_usage(&self) -> usize {
        let state = self.state();
        let mut size = std::mem::size_of::<Self>() + self.store_id.len();
        if let Some(mem) = &state.mem {
            size += mem.body().len();
            if let Some(reply) = &mem.reply {
                size += reply.memory_usage();
            }
        }
        size
    }
}

impl fmt::Debug for StoreEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("StoreEntry")
            .field("key", &state.key)
            .field("store_id", &self.store_id)
            .field("flags", &format_args!("{:#x}", self.flags.load(Ordering::Relaxed)))
            .field("store_status", &state.store_status)
            .field("mem_status", &state.mem_status)
            .field("locks", &self.lock_count())
            .field("swap", &state.swap)
            .field("transients", &state.transients_index)
            .finish()
    }
}

/// エントリのロック
///
/// 生成時に参照カウントを増やし、破棄時に減らします。
/// カウントが 0 になると `Controller::handle_idle_entry` が呼ばれます。
pub struct EntryHandle {
    entry: Arc<StoreEntry>,
    controller: Arc<Controller>,
    reason: &'static str,
}

impl EntryHandle {
    pub(crate) fn new(entry: Arc<StoreEntry>, controller: &Arc<Controller>, reason: &'static str) -> Self {
        entry.lock(reason);
        Self {
            entry,
            controller: Arc::clone(controller),
            reason,
        }
    }

    /// 同じエントリへの追加のロックを取得
    pub fn lock(&self, reason: &'static str) -> EntryHandle {
        EntryHandle::new(Arc::clone(&self.entry), &self.controller, reason)
    }

    #[inline]
    pub fn entry(&self) -> &Arc<StoreEntry> {
        &self.entry
    }

    #[inline]
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// 同一エントリを指しているか
    #[inline]
    pub fn same_entry(&self, other: &EntryHandle) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Deref for EntryHandle {
    type Target = StoreEntry;

    fn deref(&self) -> &StoreEntry {
        &self.entry
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("entry", &self.entry)
            .field("reason", &self.reason)
            .finish()
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if self.entry.unlock(self.reason) == 0 {
            self.controller.handle_idle_entry(&self.entry);
        }
    }
}
