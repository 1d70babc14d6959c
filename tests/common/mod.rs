//! テスト用共通ヘルパーモジュール
//!
//! 統合テストで使用するオリジン・クライアントのモックとストアの組み立てを提供します。

#![allow(dead_code)]

use std::cell::RefCell;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use veil_store::cache::{
    format_http_date, now_secs, AccessCheck, AclContext, AclDecision, AclPolicy, ClientWriter, Controller, DiskConfig,
    Disks, EntryHandle, FreshnessPolicy, Header, HttpReply, LruPolicy, Origin, RequestInfo, SharedStore, StoreConfig,
    StoreEntry, Validators,
};

pub fn h(name: &str, value: &str) -> Header {
    (name.as_bytes().into(), value.as_bytes().into())
}

/// 現在から `offset` 秒ずらしたHTTP日付
pub fn http_date(offset: i64) -> String {
    format_http_date(now_secs() + offset)
}

// ====================
// ストアの組み立て
// ====================

/// メモリティアだけのストア設定
pub fn create_test_config() -> StoreConfig {
    StoreConfig {
        enable_purge: true,
        ..StoreConfig::default()
    }
}

/// ディスクティアだけのストア設定
pub fn create_test_disk_config(dir: &Path) -> StoreConfig {
    StoreConfig {
        memory_cache_size: 0,
        disks: vec![DiskConfig::new(dir)],
        ..create_test_config()
    }
}

pub fn create_test_store(config: StoreConfig) -> Arc<SharedStore> {
    Arc::new(SharedStore::new(config).unwrap())
}

/// 鮮度判定を固定したストア（ディスクなし）
pub fn create_test_store_with_freshness(config: StoreConfig, stale: bool) -> Arc<SharedStore> {
    Arc::new(SharedStore::with_parts(
        config,
        Box::new(LruPolicy::new()),
        Disks::new(Vec::new()),
        Box::new(FixedFreshness { stale }),
    ))
}

/// 同じ共有ストアを使うワーカーを `n` 個作成
pub fn create_test_workers(shared: &Arc<SharedStore>, n: u32) -> Vec<Arc<Controller>> {
    (0..n).map(|worker| Controller::new(worker, Arc::clone(shared))).collect()
}

/// 常に同じ結果を返す鮮度判定
pub struct FixedFreshness {
    pub stale: bool,
}

impl FreshnessPolicy for FixedFreshness {
    fn is_stale(&self, _entry: &StoreEntry, _request: &RequestInfo, _now: i64) -> bool {
        self.stale
    }
}

/// キャッシュ可能な200レスポンス
pub fn create_test_reply(body_len: usize, extra: &[(&str, &str)]) -> HttpReply {
    let mut headers = vec![
        h("Date", &http_date(0)),
        h("Content-Length", &body_len.to_string()),
        h("Cache-Control", "max-age=60"),
    ];
    headers.extend(extra.iter().map(|(n, v)| h(n, v)));
    HttpReply::new(200, headers)
}

/// コントローラを直接使ってオブジェクトを書き込む
pub fn store_object(controller: &Arc<Controller>, request: &RequestInfo, reply: HttpReply, body: &[u8]) {
    let (handle, _) = controller.create_or_reuse(request);
    controller.set_reply(&handle, reply).unwrap();
    controller.append(&handle, body).unwrap();
    controller.complete(&handle).unwrap();
}

// ====================
// オリジンのモック
// ====================

/// 開始された取得
pub struct Fetch {
    pub handle: EntryHandle,
    pub request: RequestInfo,
    pub validators: Option<Validators>,
}

/// 取得要求を記録し、テストから応答を書き込むオリジン
#[derive(Default)]
pub struct MockOrigin {
    fetches: RefCell<Vec<Option<Fetch>>>,
}

impl Origin for MockOrigin {
    fn start_fetch(&self, handle: &EntryHandle, request: &RequestInfo, validators: Option<&Validators>) {
        self.fetches.borrow_mut().push(Some(Fetch {
            handle: handle.lock("mock origin"),
            request: request.clone(),
            validators: validators.cloned(),
        }));
    }
}

impl MockOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// 開始された取得の数
    pub fn count(&self) -> usize {
        self.fetches.borrow().len()
    }

    pub fn validators(&self, n: usize) -> Option<Validators> {
        self.fetches.borrow()[n].as_ref().and_then(|f| f.validators.clone())
    }

    pub fn request(&self, n: usize) -> RequestInfo {
        self.fetches.borrow()[n].as_ref().map(|f| f.request.clone()).unwrap()
    }

    /// ヘッダーとボディを書き込んで完了させる
    pub fn respond(&self, n: usize, reply: HttpReply, body: &[u8]) {
        let fetches = self.fetches.borrow();
        let fetch = fetches[n].as_ref().unwrap();
        let controller = fetch.handle.controller();
        controller.set_reply(&fetch.handle, reply).unwrap();
        if !body.is_empty() {
            controller.append(&fetch.handle, body).unwrap();
        }
        controller.complete(&fetch.handle).unwrap();
    }

    /// ヘッダーだけ書き込む
    pub fn respond_headers(&self, n: usize, reply: HttpReply) {
        let fetches = self.fetches.borrow();
        let fetch = fetches[n].as_ref().unwrap();
        fetch.handle.controller().set_reply(&fetch.handle, reply).unwrap();
    }

    /// `respond_headers` の後にボディを書き込んで完了させる
    pub fn finish(&self, n: usize, body: &[u8]) {
        let fetches = self.fetches.borrow();
        let fetch = fetches[n].as_ref().unwrap();
        let controller = fetch.handle.controller();
        controller.append(&fetch.handle, body).unwrap();
        controller.complete(&fetch.handle).unwrap();
    }

    /// 200 (max-age=60) で応答
    pub fn respond_ok(&self, n: usize, body: &[u8]) {
        self.respond(n, create_test_reply(body.len(), &[]), body);
    }

    /// 書き込みを中断
    pub fn abort(&self, n: usize) {
        let fetches = self.fetches.borrow();
        let fetch = fetches[n].as_ref().unwrap();
        fetch.handle.controller().abort(&fetch.handle);
    }

    /// 応答せずにロックを手放す
    pub fn abandon(&self, n: usize) {
        let fetch = self.fetches.borrow_mut()[n].take();
        drop(fetch);
    }
}

// ====================
// クライアントのモック
// ====================

/// 送信内容を記録するクライアント
#[derive(Default)]
pub struct MockClient {
    pub reply: Option<HttpReply>,
    pub body: Vec<u8>,
    pub ranges: Vec<Range<u64>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<u16> {
        self.reply.as_ref().map(|r| r.status())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.reply
            .as_ref()
            .and_then(|r| r.header(name.as_bytes()))
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

impl ClientWriter for MockClient {
    fn start_reply(&mut self, reply: &HttpReply) {
        self.reply = Some(reply.clone());
    }

    fn deliver(&mut self, _handle: &EntryHandle, range: Range<u64>, data: &[u8]) {
        self.ranges.push(range);
        self.body.extend_from_slice(data);
    }
}

// ====================
// アクセス制御のモック
// ====================

/// ポリシーごとに固定の判定を返すACL
pub struct ScriptedAcl {
    pub send_hit: AclDecision,
    pub purge: AclDecision,
    pub calls: RefCell<Vec<AclPolicy>>,
}

impl ScriptedAcl {
    pub fn new(send_hit: AclDecision, purge: AclDecision) -> Self {
        Self {
            send_hit,
            purge,
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl AccessCheck for ScriptedAcl {
    fn evaluate(&self, policy: AclPolicy, _ctx: &AclContext<'_>) -> AclDecision {
        self.calls.borrow_mut().push(policy);
        match policy {
            AclPolicy::SendHit => self.send_hit,
            AclPolicy::Purge => self.purge,
        }
    }
}
