//! クライアント応答コンテキスト
//!
//! 1つのクライアントリクエストを、ルックアップ、ヒット判定、ミス時のオリジン取得、
//! 合流待ち、リバリデーション、ボディの受け渡しまで進めます。
//!
//! ソケットI/Oは持ちません。オリジンとクライアントは `Origin` と `ClientWriter` として
//! 外から渡され、呼び出し側はエントリの更新通知や `Controller::sync` のたびに
//! `ReplyContext::poll` を呼び直します。

use ftlog::{debug, info, warn};
use std::ops::Range;
use std::sync::Arc;

use super::controller::{Controller, PurgeOutcome, Role};
use super::decision::{
    classify, vary_matches, AccessCheck, AclContext, AclDecision, AclPolicy, HitContext, HitDecision, LogTag,
};
use super::entry::{EntryHandle, StoreStatus};
use super::key::HttpMethod;
use super::reply::{now_secs, Header, HttpReply};
use super::request::RequestInfo;
use super::revalidation::{Revalidation, Serve, Validators};

/// 合流先が中断された場合にやり直す回数
const MAX_COLLAPSED_RETRIES: u32 = 3;

/// オリジンへの転送
pub trait Origin {
    /// `handle` に応答を書き込む取得を開始
    ///
    /// 取得側は書き込みが終わるまで `handle.lock()` でロックを保持し、
    /// `Controller::{set_reply, append, complete, abort}` で書き込みます。
    fn start_fetch(&self, handle: &EntryHandle, request: &RequestInfo, validators: Option<&Validators>);
}

/// クライアントへの送信
pub trait ClientWriter {
    /// レスポンスヘッダーを送信
    fn start_reply(&mut self, reply: &HttpReply);
    /// ボディの `range` 部分を送信
    fn deliver(&mut self, handle: &EntryHandle, range: Range<u64>, data: &[u8]);
}

/// コンテキストの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Start,
    /// 他のリクエストの取得完了を待っている
    WaitingForCollapsed,
    Revalidating,
    /// エントリの内容をクライアントに送っている
    Sending,
    Done,
}

/// 応答の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyOutcome {
    pub status: u16,
    pub log: LogTag,
}

/// `poll` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// エントリの更新を待っている
    Waiting,
    Done(ReplyOutcome),
}

enum Step {
    Continue,
    Wait,
}

/// 1リクエスト分の応答処理
pub struct ReplyContext {
    controller: Arc<Controller>,
    request: RequestInfo,
    state: ContextState,
    entry: Option<EntryHandle>,
    revalidation: Option<Revalidation>,
    log: LogTag,
    status: u16,
    headers_sent: bool,
    delivered: u64,
    retries: u32,
    outcome: Option<ReplyOutcome>,
}

impl ReplyContext {
    pub fn new(controller: Arc<Controller>, request: RequestInfo) -> Self {
        Self {
            controller,
            request,
            state: ContextState::Start,
            entry: None,
            revalidation: None,
            log: LogTag::Miss,
            status: 0,
            headers_sent: false,
            delivered: 0,
            retries: 0,
            outcome: None,
        }
    }

    #[inline]
    pub fn state(&self) -> ContextState {
        self.state
    }

    #[inline]
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// 送信済みボディのバイト数
    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    #[inline]
    pub fn outcome(&self) -> Option<ReplyOutcome> {
        self.outcome
    }

    /// 進められるところまで処理を進める
    pub fn poll(&mut self, origin: &dyn Origin, acl: &dyn AccessCheck, client: &mut dyn ClientWriter) -> Progress {
        loop {
            let step = match self.state {
                ContextState::Start => self.start(origin, acl, client),
                ContextState::WaitingForCollapsed => self.wait_collapsed(origin, client),
                ContextState::Revalidating => self.revalidate(origin),
                ContextState::Sending => self.send(client),
                ContextState::Done => {
                    return match self.outcome {
                        Some(outcome) => Progress::Done(outcome),
                        None => Progress::Waiting,
                    };
                }
            };
            if let Step::Wait = step {
                return Progress::Waiting;
            }
        }
    }

    fn start(&mut self, origin: &dyn Origin, acl: &dyn AccessCheck, client: &mut dyn ClientWriter) -> Step {
        let method = self.request.method();
        if method == HttpMethod::Purge {
            return self.purge(acl, client);
        }

        if method.invalidates_cache() {
            self.controller.purge_all_cached(self.request.store_id());
            return self.forward(origin);
        }

        if !self.request.flags().cachable || self.controller.config().should_bypass(self.request.path()) {
            return self.forward(origin);
        }

        match self.controller.find_variant(&self.request) {
            Some(handle) if handle.is_pending() => {
                debug!("{} is in flight, waiting", self.request.store_id());
                self.entry = Some(handle);
                self.state = ContextState::WaitingForCollapsed;
                Step::Continue
            }
            found => self.dispatch(found, origin, acl, client),
        }
    }

    /// ヒット判定の結果に従って処理を分岐
    fn dispatch(
        &mut self,
        found: Option<EntryHandle>,
        origin: &dyn Origin,
        acl: &dyn AccessCheck,
        client: &mut dyn ClientWriter,
    ) -> Step {
        let decision = {
            let ctx = HitContext {
                acl,
                freshness: self.controller.shared().freshness(),
                now: now_secs(),
            };
            classify(found.as_deref(), &self.request, &ctx)
        };
        let log = LogTag::for_decision(decision, found.as_deref());
        debug!("{} {}: {:?}", self.request.method().as_str(), self.request.store_id(), decision);

        match decision {
            HitDecision::Miss(_) => {
                drop(found);
                self.process_miss(origin, log)
            }
            HitDecision::GatewayTimeout => {
                drop(found);
                self.reply_status(client, 504, log)
            }
            HitDecision::Validate => match found {
                Some(old) => self.process_expired(old, origin),
                None => self.process_miss(origin, LogTag::Miss),
            },
            HitDecision::ConditionalResponse { status } => {
                let reply = match (status, found.as_ref().and_then(|e| e.freshest_reply())) {
                    (304, Some(cached)) => not_modified_reply(&cached),
                    _ => HttpReply::new(status, vec![content_length_zero()]),
                };
                drop(found);
                client.start_reply(&reply);
                self.headers_sent = true;
                self.finish(status, log)
            }
            HitDecision::NegativeHit | HitDecision::PlainHit => {
                self.entry = found;
                self.log = log;
                self.state = ContextState::Sending;
                Step::Continue
            }
        }
    }

    /// キャッシュを使わずに転送
    fn forward(&mut self, origin: &dyn Origin) -> Step {
        self.request.flags_mut().cachable = false;
        self.process_miss(origin, LogTag::Miss)
    }

    fn process_miss(&mut self, origin: &dyn Origin, log: LogTag) -> Step {
        let (handle, role) = self.controller.create_or_reuse(&self.request);
        self.log = log;
        match role {
            Role::Writer => {
                origin.start_fetch(&handle, &self.request, None);
                self.entry = Some(handle);
                self.state = ContextState::Sending;
            }
            Role::CollapsedReader => {
                self.entry = Some(handle);
                self.state = ContextState::WaitingForCollapsed;
            }
        }
        Step::Continue
    }

    /// 古いコピーを再検証
    ///
    /// 同じURLの再検証が進行中ならそれに合流します。
    fn process_expired(&mut self, old: EntryHandle, origin: &dyn Origin) -> Step {
        let mut refresh = self.request.clone();
        refresh.flags_mut().refresh = true;

        let (fresh, role) = self.controller.create_or_reuse(&refresh);
        let revalidation = Revalidation::new(old, fresh);
        if role == Role::Writer {
            origin.start_fetch(revalidation.fresh(), &refresh, Some(revalidation.validators()));
        } else {
            debug!("joining revalidation of {}", self.request.store_id());
        }
        self.revalidation = Some(revalidation);
        self.state = ContextState::Revalidating;
        Step::Continue
    }

    fn revalidate(&mut self, origin: &dyn Origin) -> Step {
        let Some(revalidation) = self.revalidation.as_mut() else {
            warn!("revalidation state lost for {}", self.request.store_id());
            return self.process_miss(origin, LogTag::Miss);
        };
        let Some(outcome) = revalidation.resolve(&self.request) else {
            return Step::Wait;
        };
        let Some(revalidation) = self.revalidation.take() else {
            return Step::Wait;
        };
        let (old, fresh) = revalidation.into_parts();

        self.log = outcome.log;
        match outcome.serve {
            Serve::OldEntry => {
                drop(fresh);
                self.entry = Some(old);
            }
            Serve::Upstream => {
                drop(old);
                self.entry = Some(fresh);
            }
            Serve::Miss => {
                drop(old);
                drop(fresh);
                return self.process_miss(origin, LogTag::Miss);
            }
        }
        self.state = ContextState::Sending;
        Step::Continue
    }

    fn wait_collapsed(&mut self, origin: &dyn Origin, client: &mut dyn ClientWriter) -> Step {
        let Some(entry) = self.entry.take() else {
            return self.process_miss(origin, LogTag::Miss);
        };

        // 合流先が中断された。Varyバリアントで確定した場合もここに来る
        if entry.is_aborted() {
            drop(entry);
            self.retries += 1;
            if self.retries > MAX_COLLAPSED_RETRIES {
                warn!("giving up on {} after {} aborted writers", self.request.store_id(), self.retries - 1);
                return self.reply_status(client, 502, LogTag::Miss);
            }
            debug!("collapsed entry for {} aborted, restarting lookup", self.request.store_id());
            self.state = ContextState::Start;
            return Step::Continue;
        }

        if entry.store_status() != StoreStatus::Committed {
            self.entry = Some(entry);
            return Step::Wait;
        }

        // 別バリアントの応答だった場合はルックアップからやり直す
        if !vary_matches(&entry, &self.request) {
            drop(entry);
            self.retries += 1;
            if self.retries > MAX_COLLAPSED_RETRIES {
                return self.reply_status(client, 502, LogTag::Miss);
            }
            debug!("collapsed entry for {} is another variant", self.request.store_id());
            self.state = ContextState::Start;
            return Step::Continue;
        }

        self.entry = Some(entry);
        self.log = LogTag::Miss;
        self.state = ContextState::Sending;
        Step::Continue
    }

    fn send(&mut self, client: &mut dyn ClientWriter) -> Step {
        let Some(entry) = self.entry.take() else {
            warn!("nothing to send for {}", self.request.store_id());
            return self.reply_status(client, 500, self.log);
        };

        if !self.headers_sent {
            if entry.is_aborted() {
                drop(entry);
                return self.reply_status(client, 502, self.log);
            }
            match entry.freshest_reply() {
                Some(reply) => {
                    client.start_reply(&reply);
                    self.headers_sent = true;
                    self.status = reply.status();
                }
                None => {
                    self.entry = Some(entry);
                    return Step::Wait;
                }
            }
        }

        let available = entry.body_len();
        if available > self.delivered && self.request.method() != HttpMethod::Head {
            let range = self.delivered..available;
            if let Some(data) = entry.with_body(range.clone(), |data| data.to_vec()) {
                client.deliver(&entry, range, &data);
                self.delivered += data.len() as u64;
            }
        }

        if entry.is_aborted() {
            warn!(
                "{} aborted after {} bytes were sent",
                self.request.store_id(),
                self.delivered
            );
            drop(entry);
            return self.finish(self.status, self.log);
        }

        let body_done = self.request.method() == HttpMethod::Head || self.delivered >= entry.body_len();
        if entry.store_status() == StoreStatus::Committed && body_done {
            drop(entry);
            return self.finish(self.status, self.log);
        }

        self.entry = Some(entry);
        Step::Wait
    }

    /// PURGE の処理
    fn purge(&mut self, acl: &dyn AccessCheck, client: &mut dyn ClientWriter) -> Step {
        let store_id = self.request.store_id().to_string();
        let allowed = self.controller.config().enable_purge
            && acl.evaluate(AclPolicy::Purge, &AclContext::new(&self.request, None)) == AclDecision::Allow;
        if !allowed {
            info!("PURGE of {} denied", store_id);
            return self.reply_status(client, 403, LogTag::Denied);
        }

        let status = match self.controller.purge(&store_id) {
            PurgeOutcome::Purged => 200,
            PurgeOutcome::NotFound => 404,
        };
        self.reply_status(client, status, LogTag::Miss)
    }

    /// ボディなしの応答を返して終了
    fn reply_status(&mut self, client: &mut dyn ClientWriter, status: u16, log: LogTag) -> Step {
        if !self.headers_sent {
            client.start_reply(&HttpReply::new(status, vec![content_length_zero()]));
            self.headers_sent = true;
        }
        self.finish(status, log)
    }

    fn finish(&mut self, status: u16, log: LogTag) -> Step {
        self.entry = None;
        self.revalidation = None;
        debug!(
            "{} {} {} {} ({} bytes)",
            log.as_str(),
            status,
            self.request.method().as_str(),
            self.request.store_id(),
            self.delivered
        );
        self.outcome = Some(ReplyOutcome { status, log });
        self.state = ContextState::Done;
        Step::Continue
    }
}

fn content_length_zero() -> Header {
    (b"Content-Length".as_slice().into(), b"0".as_slice().into())
}

/// キャッシュ済みレスポンスから304を作成
fn not_modified_reply(cached: &HttpReply) -> HttpReply {
    let headers = cached
        .headers()
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case(b"content-length") && !name.eq_ignore_ascii_case(b"transfer-encoding")
        })
        .cloned()
        .collect();
    HttpReply::new(304, headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::StoreConfig;
    use crate::cache::controller::SharedStore;
    use crate::cache::decision::AllowAll;
    use std::cell::RefCell;

    fn h(name: &str, value: &str) -> Header {
        (name.as_bytes().into(), value.as_bytes().into())
    }

    #[derive(Default)]
    struct RecordingOrigin {
        fetches: RefCell<Vec<(EntryHandle, bool)>>,
    }

    impl Origin for RecordingOrigin {
        fn start_fetch(&self, handle: &EntryHandle, _request: &RequestInfo, validators: Option<&Validators>) {
            self.fetches.borrow_mut().push((handle.lock("test origin"), validators.is_some()));
        }
    }

    impl RecordingOrigin {
        fn respond(&self, n: usize, status: u16, body: &[u8]) {
            let fetches = self.fetches.borrow();
            let (handle, _) = &fetches[n];
            let controller = handle.controller();
            let reply = HttpReply::new(
                status,
                vec![h("Content-Length", &body.len().to_string()), h("Cache-Control", "max-age=60")],
            );
            controller.set_reply(handle, reply).unwrap();
            controller.append(handle, body).unwrap();
            controller.complete(handle).unwrap();
        }

        fn count(&self) -> usize {
            self.fetches.borrow().len()
        }
    }

    #[derive(Default)]
    struct Collector {
        status: Option<u16>,
        body: Vec<u8>,
    }

    impl ClientWriter for Collector {
        fn start_reply(&mut self, reply: &HttpReply) {
            self.status = Some(reply.status());
        }

        fn deliver(&mut self, _handle: &EntryHandle, _range: Range<u64>, data: &[u8]) {
            self.body.extend_from_slice(data);
        }
    }

    fn create_test_controller(config: StoreConfig) -> Arc<Controller> {
        Controller::new(0, Arc::new(SharedStore::new(config).unwrap()))
    }

    #[test]
    fn test_miss_then_hit() {
        let controller = create_test_controller(StoreConfig::default());
        let origin = RecordingOrigin::default();
        let request = RequestInfo::get("example.com", "/page");

        let mut first = ReplyContext::new(Arc::clone(&controller), request.clone());
        let mut client = Collector::default();
        assert_eq!(first.poll(&origin, &AllowAll, &mut client), Progress::Waiting);
        assert_eq!(origin.count(), 1);

        origin.respond(0, 200, b"hello");
        assert_eq!(
            first.poll(&origin, &AllowAll, &mut client),
            Progress::Done(ReplyOutcome { status: 200, log: LogTag::Miss })
        );
        assert_eq!(client.body, b"hello");

        let mut second = ReplyContext::new(controller, request);
        let mut client = Collector::default();
        assert_eq!(
            second.poll(&origin, &AllowAll, &mut client),
            Progress::Done(ReplyOutcome { status: 200, log: LogTag::MemHit })
        );
        assert_eq!(client.body, b"hello");
        assert_eq!(origin.count(), 1);
    }

    #[test]
    fn test_collapsed_requests_share_fetch() {
        let controller = create_test_controller(StoreConfig::default());
        let origin = RecordingOrigin::default();
        let request = RequestInfo::get("example.com", "/shared");

        let mut first = ReplyContext::new(Arc::clone(&controller), request.clone());
        let mut second = ReplyContext::new(Arc::clone(&controller), request);
        let mut c1 = Collector::default();
        let mut c2 = Collector::default();

        assert_eq!(first.poll(&origin, &AllowAll, &mut c1), Progress::Waiting);
        assert_eq!(second.poll(&origin, &AllowAll, &mut c2), Progress::Waiting);
        assert_eq!(second.state(), ContextState::WaitingForCollapsed);
        assert_eq!(origin.count(), 1);

        origin.respond(0, 200, b"once");
        assert!(matches!(first.poll(&origin, &AllowAll, &mut c1), Progress::Done(_)));
        assert!(matches!(second.poll(&origin, &AllowAll, &mut c2), Progress::Done(_)));
        assert_eq!(c1.body, b"once");
        assert_eq!(c2.body, b"once");
    }

    #[test]
    fn test_purge_requires_switch() {
        let controller = create_test_controller(StoreConfig::default());
        let origin = RecordingOrigin::default();
        let request = RequestInfo::get("example.com", "/p").with_method(HttpMethod::Purge);

        let mut ctx = ReplyContext::new(controller, request);
        let mut client = Collector::default();
        assert_eq!(
            ctx.poll(&origin, &AllowAll, &mut client),
            Progress::Done(ReplyOutcome { status: 403, log: LogTag::Denied })
        );
        assert_eq!(client.status, Some(403));
    }

    #[test]
    fn test_purge_removes_cached_object() {
        let config = StoreConfig {
            enable_purge: true,
            ..StoreConfig::default()
        };
        let controller = create_test_controller(config);
        let origin = RecordingOrigin::default();
        let request = RequestInfo::get("example.com", "/gone");

        let mut fetch = ReplyContext::new(Arc::clone(&controller), request.clone());
        let mut client = Collector::default();
        fetch.poll(&origin, &AllowAll, &mut client);
        origin.respond(0, 200, b"x");
        fetch.poll(&origin, &AllowAll, &mut client);

        let purge = request.with_method(HttpMethod::Purge);
        let mut ctx = ReplyContext::new(Arc::clone(&controller), purge.clone());
        assert_eq!(
            ctx.poll(&origin, &AllowAll, &mut Collector::default()),
            Progress::Done(ReplyOutcome { status: 200, log: LogTag::Miss })
        );

        let mut again = ReplyContext::new(controller, purge);
        assert_eq!(
            again.poll(&origin, &AllowAll, &mut Collector::default()),
            Progress::Done(ReplyOutcome { status: 404, log: LogTag::Miss })
        );
    }

    #[test]
    fn test_only_if_cached_miss() {
        let controller = create_test_controller(StoreConfig::default());
        let origin = RecordingOrigin::default();
        let request = RequestInfo::get("example.com", "/none").with_header("Cache-Control", "only-if-cached");

        let mut ctx = ReplyContext::new(controller, request);
        let mut client = Collector::default();
        assert_eq!(
            ctx.poll(&origin, &AllowAll, &mut client),
            Progress::Done(ReplyOutcome { status: 504, log: LogTag::Miss })
        );
        assert_eq!(origin.count(), 0);
    }

    #[test]
    fn test_post_is_forwarded_uncached() {
        let controller = create_test_controller(StoreConfig::default());
        let origin = RecordingOrigin::default();
        let request = RequestInfo::get("example.com", "/form").with_method(HttpMethod::Post);

        let mut ctx = ReplyContext::new(Arc::clone(&controller), request);
        let mut client = Collector::default();
        assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), Progress::Waiting);
        origin.respond(0, 200, b"ok");
        assert!(matches!(ctx.poll(&origin, &AllowAll, &mut client), Progress::Done(_)));
        assert_eq!(controller.stats().memory_objects, 0);
    }

    #[test]
    fn test_head_sends_no_body() {
        let controller = create_test_controller(StoreConfig::default());
        let origin = RecordingOrigin::default();
        let request = RequestInfo::get("example.com", "/head").with_method(HttpMethod::Head);

        let mut ctx = ReplyContext::new(controller, request);
        let mut client = Collector::default();
        ctx.poll(&origin, &AllowAll, &mut client);
        origin.respond(0, 200, b"");
        assert!(matches!(ctx.poll(&origin, &AllowAll, &mut client), Progress::Done(_)));
        assert!(client.body.is_empty());
    }

    #[test]
    fn test_not_modified_reply_drops_length() {
        let cached = HttpReply::new(200, vec![h("Content-Length", "10"), h("ETag", "\"a\"")]);
        let reply = not_modified_reply(&cached);
        assert_eq!(reply.status(), 304);
        assert!(reply.header(b"content-length").is_none());
        assert!(reply.header(b"etag").is_some());
    }
}
