//! リバリデーション統合テスト
//!
//! 古いコピーへの条件付き取得と、オリジンの応答ごとの扱いを確認します。

mod common;

use common::*;
use std::sync::Arc;

use veil_store::cache::{
    AllowAll, Controller, ETag, HttpReply, LogTag, Progress, ReplyContext, ReplyOutcome, RequestInfo, SharedStore,
};

fn done(status: u16, log: LogTag) -> Progress {
    Progress::Done(ReplyOutcome { status, log })
}

/// 常に古いと判定されるストアにバージョン1のオブジェクトを置く
fn create_test_stale_store() -> (Arc<SharedStore>, Arc<Controller>, RequestInfo) {
    let shared = create_test_store_with_freshness(create_test_config(), true);
    let controller = Controller::new(0, Arc::clone(&shared));
    let request = RequestInfo::get("example.com", "/article");
    let last_modified = http_date(-1000);
    let reply = create_test_reply(
        10,
        &[("Last-Modified", last_modified.as_str()), ("ETag", "\"v1\""), ("X-Version", "1")],
    );
    store_object(&controller, &request, reply, b"version v1");
    (shared, controller, request)
}

fn create_test_304(date_offset: i64) -> HttpReply {
    HttpReply::new(
        304,
        vec![h("Date", &http_date(date_offset)), h("ETag", "\"v1\""), h("X-Version", "2")],
    )
}

#[test]
fn test_stale_entry_sends_validators() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut ctx = ReplyContext::new(controller, request);
    let mut client = MockClient::new();
    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), Progress::Waiting);
    assert_eq!(origin.count(), 1);

    let validators = origin.validators(0).unwrap();
    assert_eq!(validators.etag, ETag::parse("\"v1\""));
    assert!(validators.last_modified.is_some());
    assert!(origin.request(0).flags().refresh);
}

#[test]
fn test_not_modified_merges_headers() {
    let (shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut ctx = ReplyContext::new(controller, request.clone());
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    origin.respond(0, create_test_304(0), b"");

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(200, LogTag::RefreshUnmodified));
    assert_eq!(client.body, b"version v1");
    assert_eq!(client.header("x-version").as_deref(), Some("2"));
    assert_eq!(client.header("content-length").as_deref(), Some("10"));

    let stored = shared.memory().get(&request.public_key()).unwrap();
    assert_eq!(stored.reply.header(b"x-version"), Some(&b"2"[..]));
    assert_eq!(&stored.body[..], b"version v1");
}

#[test]
fn test_older_not_modified_does_not_regress_headers() {
    let (shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut ctx = ReplyContext::new(controller, request.clone());
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    origin.respond(0, create_test_304(-5000), b"");

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(200, LogTag::RefreshUnmodified));
    assert_eq!(client.header("x-version").as_deref(), Some("1"));

    let stored = shared.memory().get(&request.public_key()).unwrap();
    assert_eq!(stored.reply.header(b"x-version"), Some(&b"1"[..]));
}

#[test]
fn test_not_modified_forwarded_to_conditional_client() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let conditional = request.with_header("If-Modified-Since", &http_date(0));
    let mut ctx = ReplyContext::new(controller, conditional);
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    origin.respond(0, create_test_304(0), b"");

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(304, LogTag::RefreshUnmodified));
    assert_eq!(client.status(), Some(304));
    assert!(client.body.is_empty());
}

#[test]
fn test_modified_reply_replaces_cached_copy() {
    let (shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut ctx = ReplyContext::new(controller, request.clone());
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    origin.respond(0, create_test_reply(10, &[("X-Version", "2")]), b"version v2");

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(200, LogTag::RefreshModified));
    assert_eq!(client.body, b"version v2");

    let stored = shared.memory().get(&request.public_key()).unwrap();
    assert_eq!(&stored.body[..], b"version v2");
}

#[test]
fn test_older_reply_is_ignored() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut ctx = ReplyContext::new(controller, request);
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);

    let date = http_date(-5000);
    let older = HttpReply::new(
        200,
        vec![h("Date", &date), h("Content-Length", "9"), h("Cache-Control", "max-age=60")],
    );
    origin.respond(0, older, b"outdated!");

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(200, LogTag::RefreshIgnored));
    assert_eq!(client.body, b"version v1");
}

#[test]
fn test_origin_error_serves_stale_copy() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut ctx = ReplyContext::new(controller, request);
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    origin.respond(0, HttpReply::new(503, vec![h("Content-Length", "0")]), b"");

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(200, LogTag::RefreshFailOld));
    assert_eq!(client.body, b"version v1");
}

#[test]
fn test_origin_error_forwarded_when_requested() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut strict = request.clone();
    strict.flags_mut().fail_on_validation_error = true;
    let mut ctx = ReplyContext::new(controller, strict);
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    origin.respond(0, HttpReply::new(503, vec![h("Content-Length", "0")]), b"");

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(503, LogTag::RefreshFailErr));
    assert_eq!(client.status(), Some(503));
}

#[test]
fn test_aborted_revalidation_serves_stale_copy() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut ctx = ReplyContext::new(controller, request);
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    origin.abort(0);

    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(200, LogTag::RefreshFailOld));
    assert_eq!(client.body, b"version v1");
}

#[test]
fn test_concurrent_revalidations_collapse() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let mut first = ReplyContext::new(Arc::clone(&controller), request.clone());
    let mut second = ReplyContext::new(Arc::clone(&controller), request);
    let mut c1 = MockClient::new();
    let mut c2 = MockClient::new();
    first.poll(&origin, &AllowAll, &mut c1);
    second.poll(&origin, &AllowAll, &mut c2);
    assert_eq!(origin.count(), 1);

    origin.respond(0, create_test_304(0), b"");
    assert_eq!(first.poll(&origin, &AllowAll, &mut c1), done(200, LogTag::RefreshUnmodified));
    assert_eq!(second.poll(&origin, &AllowAll, &mut c2), done(200, LogTag::RefreshUnmodified));
    assert_eq!(c1.header("x-version").as_deref(), Some("2"));
    assert_eq!(c2.header("x-version").as_deref(), Some("2"));
}

#[test]
fn test_client_reload_bypasses_validation() {
    let (_shared, controller, request) = create_test_stale_store();
    let origin = MockOrigin::new();

    let reload = request.with_header("Cache-Control", "no-cache");
    let mut ctx = ReplyContext::new(controller, reload);
    let mut client = MockClient::new();
    ctx.poll(&origin, &AllowAll, &mut client);
    assert_eq!(origin.count(), 1);
    assert!(origin.validators(0).is_none());

    origin.respond(0, create_test_reply(5, &[]), b"fresh");
    assert_eq!(ctx.poll(&origin, &AllowAll, &mut client), done(200, LogTag::ClientRefreshMiss));
    assert_eq!(client.body, b"fresh");
}
