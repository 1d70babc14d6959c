//! ヒット／ミス判定
//!
//! ルックアップで見つかったエントリとリクエストから、ヒットとして返すか、
//! 再検証するか、ミスとして転送するかを決定します。副作用を持たない純粋関数です。

use super::entry::{MemStatus, StoreEntry};
use super::key::HttpMethod;
use super::policy::FreshnessPolicy;
use super::request::RequestInfo;
use super::vary::VarySelector;

/// アクセス制御ポリシー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclPolicy {
    /// キャッシュヒットを返してよいか
    SendHit,
    /// PURGE を受け付けるか
    Purge,
}

/// アクセス制御の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclDecision {
    Allow,
    Deny,
}

/// アクセス制御の評価に渡す情報
#[derive(Debug, Clone, Copy)]
pub struct AclContext<'a> {
    pub method: HttpMethod,
    pub store_id: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    /// キャッシュ済みレスポンスのステータス
    pub status: Option<u16>,
}

impl<'a> AclContext<'a> {
    pub fn new(request: &'a RequestInfo, status: Option<u16>) -> Self {
        Self {
            method: request.method(),
            store_id: request.store_id(),
            host: request.host(),
            path: request.path(),
            status,
        }
    }
}

/// アクセス制御
///
/// 評価ロジック自体はストアの外側にあります。
pub trait AccessCheck {
    fn evaluate(&self, policy: AclPolicy, ctx: &AclContext<'_>) -> AclDecision;
}

/// すべて許可するアクセス制御
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn evaluate(&self, _policy: AclPolicy, _ctx: &AclContext<'_>) -> AclDecision {
        AclDecision::Allow
    }
}

/// ミスの理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// エントリが見つからない
    NotFound,
    /// 共有できないエントリ（プライベート、放棄済みなど）
    Unshareable,
    Aborted,
    /// ストアIDが一致しない
    UrlMismatch,
    VaryMismatch,
    /// SendHit ACL がヒットを拒否
    BlockedBySendHit,
    /// 古いがバリデータを作れない
    NoLastModified,
    /// クライアントの no-cache
    ClientRefresh,
    /// 再検証できないスキーム
    NonHttpScheme,
    /// 条件付きリクエストだがキャッシュ済みレスポンスが200以外
    NotOkForConditional,
}

/// 判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitDecision {
    Miss(MissReason),
    NegativeHit,
    /// 古いコピーを条件付きリクエストで再検証
    Validate,
    /// キャッシュから304または412を生成
    ConditionalResponse { status: u16 },
    PlainHit,
    /// only-if-cached だがオリジンが必要
    GatewayTimeout,
}

impl HitDecision {
    /// オリジンへのアクセスが必要か
    #[inline]
    pub fn needs_origin(&self) -> bool {
        matches!(self, HitDecision::Miss(_) | HitDecision::Validate)
    }
}

/// アクセスログのタグ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Hit,
    MemHit,
    NegativeHit,
    ImsHit,
    Miss,
    ClientRefreshMiss,
    RefreshUnmodified,
    RefreshModified,
    RefreshIgnored,
    RefreshFailOld,
    RefreshFailErr,
    Denied,
}

impl LogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTag::Hit => "TCP_HIT",
            LogTag::MemHit => "TCP_MEM_HIT",
            LogTag::NegativeHit => "TCP_NEGATIVE_HIT",
            LogTag::ImsHit => "TCP_IMS_HIT",
            LogTag::Miss => "TCP_MISS",
            LogTag::ClientRefreshMiss => "TCP_CLIENT_REFRESH_MISS",
            LogTag::RefreshUnmodified => "TCP_REFRESH_UNMODIFIED",
            LogTag::RefreshModified => "TCP_REFRESH_MODIFIED",
            LogTag::RefreshIgnored => "TCP_REFRESH_IGNORED",
            LogTag::RefreshFailOld => "TCP_REFRESH_FAIL_OLD",
            LogTag::RefreshFailErr => "TCP_REFRESH_FAIL_ERR",
            LogTag::Denied => "TCP_DENIED",
        }
    }

    /// ヒットとして数えるか
    #[inline]
    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            LogTag::Hit
                | LogTag::MemHit
                | LogTag::NegativeHit
                | LogTag::ImsHit
                | LogTag::RefreshUnmodified
                | LogTag::RefreshIgnored
                | LogTag::RefreshFailOld
        )
    }

    /// ヒット判定に対応するタグ
    pub fn for_decision(decision: HitDecision, entry: Option<&StoreEntry>) -> Self {
        match decision {
            HitDecision::Miss(MissReason::ClientRefresh) => LogTag::ClientRefreshMiss,
            HitDecision::Miss(_) | HitDecision::GatewayTimeout | HitDecision::Validate => LogTag::Miss,
            HitDecision::NegativeHit => LogTag::NegativeHit,
            HitDecision::ConditionalResponse { status: 304 } => LogTag::ImsHit,
            HitDecision::ConditionalResponse { .. } => LogTag::Hit,
            HitDecision::PlainHit => match entry.map(|e| e.mem_status()) {
                Some(MemStatus::InMemory) => LogTag::MemHit,
                _ => LogTag::Hit,
            },
        }
    }
}

/// 判定に使う外部ポリシー
pub struct HitContext<'a> {
    pub acl: &'a dyn AccessCheck,
    pub freshness: &'a dyn FreshnessPolicy,
    pub now: i64,
}

/// キャッシュ済みエントリをどう扱うかを判定
pub fn classify(entry: Option<&StoreEntry>, request: &RequestInfo, ctx: &HitContext<'_>) -> HitDecision {
    let decision = match entry {
        Some(entry) => classify_found(entry, request, ctx),
        None => HitDecision::Miss(MissReason::NotFound),
    };

    if request.flags().only_if_cached && decision.needs_origin() {
        return HitDecision::GatewayTimeout;
    }
    decision
}

fn classify_found(entry: &StoreEntry, request: &RequestInfo, ctx: &HitContext<'_>) -> HitDecision {
    if entry.is_aborted() {
        return HitDecision::Miss(MissReason::Aborted);
    }
    if !entry.may_start_hitting() {
        return HitDecision::Miss(MissReason::Unshareable);
    }
    if entry.store_id() != request.store_id() {
        return HitDecision::Miss(MissReason::UrlMismatch);
    }
    if !vary_matches(entry, request) {
        return HitDecision::Miss(MissReason::VaryMismatch);
    }

    if entry.check_negative_hit(ctx.now) && !request.flags().no_cache {
        return HitDecision::NegativeHit;
    }

    let acl_ctx = AclContext::new(request, entry.status());
    if ctx.acl.evaluate(AclPolicy::SendHit, &acl_ctx) == AclDecision::Deny {
        return HitDecision::Miss(MissReason::BlockedBySendHit);
    }

    if !request.flags().internal && ctx.freshness.is_stale(entry, request, ctx.now) {
        if entry.timestamps().last_modified().is_none() {
            return HitDecision::Miss(MissReason::NoLastModified);
        }
        if request.flags().no_cache {
            return HitDecision::Miss(MissReason::ClientRefresh);
        }
        if !request.uses_http_scheme() {
            return HitDecision::Miss(MissReason::NonHttpScheme);
        }
        return HitDecision::Validate;
    }

    if request.is_conditional() {
        if let Some(decision) = conditional(entry, request) {
            return decision;
        }
    }

    HitDecision::PlainHit
}

/// Varyセレクタの一致確認
pub fn vary_matches(entry: &StoreEntry, request: &RequestInfo) -> bool {
    let selector = match entry.vary_selector() {
        Some(selector) => selector,
        None => return true,
    };
    let names = entry
        .freshest_reply()
        .and_then(|reply| reply.vary().headers().cloned())
        .unwrap_or_default();
    VarySelector::compute(&names, request.headers()) == selector
}

/// 条件付きリクエストの処理
///
/// 通常のヒットとして扱う場合は `None` を返します。
fn conditional(entry: &StoreEntry, request: &RequestInfo) -> Option<HitDecision> {
    let reply = entry.freshest_reply()?;
    if reply.status() != 200 {
        return Some(HitDecision::Miss(MissReason::NotOkForConditional));
    }

    if let Some(if_match) = request.if_match() {
        if !if_match.matches_strong(reply.etag()) {
            return Some(HitDecision::ConditionalResponse { status: 412 });
        }
    }

    // If-None-Match があれば If-Modified-Since は見ない
    if let Some(if_none_match) = request.if_none_match() {
        let safe = matches!(request.method(), HttpMethod::Get | HttpMethod::Head);
        let matched = if safe {
            if_none_match.matches_weak(reply.etag())
        } else {
            if_none_match.matches_strong(reply.etag())
        };
        if !matched {
            return None;
        }
        let status = if safe { 304 } else { 412 };
        return Some(HitDecision::ConditionalResponse { status });
    }

    if let Some(ims) = request.ims() {
        if !entry.modified_since(ims) {
            return Some(HitDecision::ConditionalResponse { status: 304 });
        }
    }

    None
}
