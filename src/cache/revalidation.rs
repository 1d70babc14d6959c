//! リバリデーション
//!
//! 古いキャッシュコピーを条件付きリクエストで確認し、オリジンの応答に応じて
//! 古いコピーを返すか、新しいレスポンスを返すかを決定します。
//!
//! 新しいレスポンスのDateが古いコピーより前であれば古いコピーを返します（鮮度を後退させない）。

use ftlog::debug;

use super::decision::LogTag;
use super::entry::{EntryHandle, StoreEntry};
use super::reply::{format_http_date, ETag, Header};
use super::request::RequestInfo;

/// 条件付きリクエストに付けるバリデータ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// If-Modified-Since に使う時刻
    pub last_modified: Option<i64>,
    /// If-None-Match に使う強いETag
    pub etag: Option<ETag>,
}

impl Validators {
    /// 古いコピーからバリデータを作成
    ///
    /// 弱いETagは使いません。
    pub fn for_entry(entry: &StoreEntry) -> Self {
        let etag = entry
            .freshest_reply()
            .and_then(|reply| reply.etag().cloned())
            .filter(|etag| !etag.weak);
        Self {
            last_modified: entry.timestamps().last_modified(),
            etag,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.last_modified.is_none() && self.etag.is_none()
    }

    /// オリジンへのリクエストに追加するヘッダー
    pub fn to_headers(&self) -> Vec<Header> {
        let mut headers = Vec::with_capacity(2);
        if let Some(lastmod) = self.last_modified {
            headers.push((
                b"If-Modified-Since".as_slice().into(),
                format_http_date(lastmod).into_bytes().into_boxed_slice(),
            ));
        }
        if let Some(etag) = &self.etag {
            headers.push((b"If-None-Match".as_slice().into(), etag.tag.as_bytes().into()));
        }
        headers
    }
}

/// リバリデーションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationState {
    AwaitingOriginReply,
    OriginSays304,
    /// 304以外の非エラー応答
    OriginSays2xx,
    /// 5xx
    OriginSaysError,
    OriginAborted,
}

/// クライアントに返すもの
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serve {
    /// 古いコピー（304でヘッダー更新済みの場合を含む）
    OldEntry,
    /// オリジンの応答
    Upstream,
    /// 古いコピーを更新できなかったのでミスとしてやり直す
    Miss,
}

/// リバリデーションの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidationOutcome {
    pub serve: Serve,
    pub log: LogTag,
}

impl RevalidationOutcome {
    fn new(serve: Serve, log: LogTag) -> Self {
        Self { serve, log }
    }
}

/// 進行中のリバリデーション
pub struct Revalidation {
    old: EntryHandle,
    fresh: EntryHandle,
    validators: Validators,
    state: RevalidationState,
    outcome: Option<RevalidationOutcome>,
}

impl Revalidation {
    /// 古いコピーと条件付きリクエストの応答を受けるエントリから開始
    pub fn new(old: EntryHandle, fresh: EntryHandle) -> Self {
        let validators = Validators::for_entry(&old);
        Self {
            old,
            fresh,
            validators,
            state: RevalidationState::AwaitingOriginReply,
            outcome: None,
        }
    }

    #[inline]
    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    #[inline]
    pub fn state(&self) -> RevalidationState {
        self.state
    }

    #[inline]
    pub fn old(&self) -> &EntryHandle {
        &self.old
    }

    #[inline]
    pub fn fresh(&self) -> &EntryHandle {
        &self.fresh
    }

    /// (古いコピー, 新しい応答) を取り出す
    pub fn into_parts(self) -> (EntryHandle, EntryHandle) {
        (self.old, self.fresh)
    }

    /// オリジンの応答ヘッダーが届いていれば結果を決定
    ///
    /// まだ届いていなければ `None`。一度決まった結果は変わりません。
    pub fn resolve(&mut self, request: &RequestInfo) -> Option<RevalidationOutcome> {
        if let Some(outcome) = self.outcome {
            return Some(outcome);
        }

        let outcome = if self.fresh.is_aborted() {
            debug!("request to origin aborted for {}, sending old entry", self.old.store_id());
            self.state = RevalidationState::OriginAborted;
            RevalidationOutcome::new(Serve::OldEntry, LogTag::RefreshFailOld)
        } else {
            let reply = self.fresh.freshest_reply()?;
            let status = reply.status();
            if status == 304 {
                self.state = RevalidationState::OriginSays304;
                self.on_not_modified(request)
            } else if status > 0 && status < 500 {
                self.state = RevalidationState::OriginSays2xx;
                let older = self.old.freshest_reply().is_some_and(|old| reply.older_than(&old));
                if older {
                    debug!("origin replied {} with an older date for {}, sending old entry", status, self.old.store_id());
                    RevalidationOutcome::new(Serve::OldEntry, LogTag::RefreshIgnored)
                } else {
                    debug!("origin replied {} for {}, forwarding", status, self.old.store_id());
                    RevalidationOutcome::new(Serve::Upstream, LogTag::RefreshModified)
                }
            } else {
                self.state = RevalidationState::OriginSaysError;
                if request.flags().fail_on_validation_error {
                    debug!("origin replied with error {} for {}, forwarding", status, self.old.store_id());
                    RevalidationOutcome::new(Serve::Upstream, LogTag::RefreshFailErr)
                } else {
                    debug!("origin replied with error {} for {}, sending old entry", status, self.old.store_id());
                    RevalidationOutcome::new(Serve::OldEntry, LogTag::RefreshFailOld)
                }
            }
        };

        self.outcome = Some(outcome);
        Some(outcome)
    }

    fn on_not_modified(&self, request: &RequestInfo) -> RevalidationOutcome {
        let controller = self.old.controller();
        if !controller.update_on_not_modified(&self.old, &self.fresh) {
            controller.release(self.old.entry(), true);
            return RevalidationOutcome::new(Serve::Miss, LogTag::Miss);
        }

        // クライアント自身のIMSも満たすなら304をそのまま返す
        if let Some(ims) = request.ims() {
            if !self.old.modified_since(ims) {
                return RevalidationOutcome::new(Serve::Upstream, LogTag::RefreshUnmodified);
            }
        }
        RevalidationOutcome::new(Serve::OldEntry, LogTag::RefreshUnmodified)
    }
}
