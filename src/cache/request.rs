//! リクエストレコード
//!
//! ルックアップと判定に必要なリクエスト属性（メソッド、正規化URL、ヘッダー）と、
//! そこから導出したフラグを保持します。

use super::key::{store_id, CacheKey, HttpMethod, KeyScope};
use super::policy::CacheControl;
use super::reply::{parse_http_date, ETag, Header};

/// リクエストフラグ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// レスポンスをキャッシュに保存してよい
    pub cachable: bool,
    /// 再検証リクエスト（Revalidationスコープで合流）
    pub refresh: bool,
    /// クライアントが no-cache を送信した
    pub no_cache: bool,
    /// Cache-Control: only-if-cached
    pub only_if_cached: bool,
    /// 再検証失敗時に古いコピーを返さない
    pub fail_on_validation_error: bool,
    /// 内部生成オブジェクトへのリクエスト
    pub internal: bool,
    /// 有効な If-Modified-Since を持つ
    pub ims: bool,
}

/// If-Match / If-None-Match の値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ETagList {
    /// `*`
    Any,
    Tags(Vec<ETag>),
}

impl ETagList {
    /// ヘッダー値をパース
    pub fn parse(value: &[u8]) -> Option<Self> {
        let value = std::str::from_utf8(value).ok()?.trim();
        if value == "*" {
            return Some(ETagList::Any);
        }
        let tags: Vec<ETag> = value.split(',').filter_map(ETag::parse).collect();
        if tags.is_empty() {
            None
        } else {
            Some(ETagList::Tags(tags))
        }
    }

    /// 強い比較で一致するか
    ///
    /// `*` は ETag を持たない表現にも一致します。
    pub fn matches_strong(&self, etag: Option<&ETag>) -> bool {
        match (self, etag) {
            (ETagList::Any, _) => true,
            (ETagList::Tags(tags), Some(etag)) => tags.iter().any(|t| t.strong_eq(etag)),
            (_, None) => false,
        }
    }

    /// 弱い比較で一致するか
    pub fn matches_weak(&self, etag: Option<&ETag>) -> bool {
        match (self, etag) {
            (ETagList::Any, _) => true,
            (ETagList::Tags(tags), Some(etag)) => tags.iter().any(|t| t.weak_eq(etag)),
            (_, None) => false,
        }
    }
}

/// リクエスト情報
#[derive(Debug, Clone)]
pub struct RequestInfo {
    method: HttpMethod,
    scheme: Box<str>,
    host: Box<str>,
    path: Box<str>,
    query: Option<Box<str>>,
    headers: Vec<Header>,
    store_id: String,
    cache_control: CacheControl,
    ims: Option<i64>,
    if_match: Option<ETagList>,
    if_none_match: Option<ETagList>,
    flags: RequestFlags,
}

impl RequestInfo {
    /// リクエスト情報を作成し、ヘッダーからフラグを導出
    pub fn new(
        method: HttpMethod,
        scheme: &str,
        host: &str,
        path: &str,
        query: Option<&str>,
        headers: Vec<Header>,
    ) -> Self {
        let mut cache_control = CacheControl::default();
        let mut pragma_no_cache = false;
        let mut ims = None;
        let mut if_match = None;
        let mut if_none_match = None;

        for (name, value) in &headers {
            if name.eq_ignore_ascii_case(b"cache-control") {
                cache_control = CacheControl::parse(value);
            } else if name.eq_ignore_ascii_case(b"pragma") {
                pragma_no_cache |= value.eq_ignore_ascii_case(b"no-cache");
            } else if name.eq_ignore_ascii_case(b"if-modified-since") {
                ims = parse_http_date(value);
            } else if name.eq_ignore_ascii_case(b"if-match") {
                if_match = ETagList::parse(value);
            } else if name.eq_ignore_ascii_case(b"if-none-match") {
                if_none_match = ETagList::parse(value);
            }
        }

        let flags = RequestFlags {
            cachable: method.resp_maybe_cacheable() && !cache_control.no_store,
            refresh: false,
            no_cache: cache_control.no_cache || pragma_no_cache,
            only_if_cached: cache_control.only_if_cached,
            fail_on_validation_error: false,
            internal: false,
            ims: ims.is_some(),
        };

        Self {
            method,
            store_id: store_id(scheme, host, path, query),
            scheme: scheme.to_ascii_lowercase().into(),
            host: host.to_ascii_lowercase().into(),
            path: path.into(),
            query: query.map(Into::into),
            headers,
            cache_control,
            ims,
            if_match,
            if_none_match,
            flags,
        }
    }

    /// GETリクエストを作成（テスト・内部用途）
    pub fn get(url_host: &str, path: &str) -> Self {
        Self::new(HttpMethod::Get, "http", url_host, path, None, Vec::new())
    }

    /// ヘッダーを追加した新しいリクエストを返す
    pub fn with_header(&self, name: &str, value: &str) -> Self {
        let mut headers = self.headers.clone();
        headers.push((name.as_bytes().into(), value.as_bytes().into()));
        let mut request = Self::new(
            self.method,
            &self.scheme,
            &self.host,
            &self.path,
            self.query.as_deref(),
            headers,
        );
        request.flags.refresh = self.flags.refresh;
        request.flags.internal = self.flags.internal;
        request.flags.fail_on_validation_error = self.flags.fail_on_validation_error;
        request
    }

    /// メソッドだけを差し替えたリクエストを返す
    pub fn with_method(&self, method: HttpMethod) -> Self {
        let mut request = self.clone();
        request.method = method;
        request.flags.cachable = method.resp_maybe_cacheable() && !self.cache_control.no_store;
        request
    }

    #[inline]
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    #[inline]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// 名前でヘッダー値を取得
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// ストアID（正規化URL）
    #[inline]
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    #[inline]
    pub fn cache_control(&self) -> &CacheControl {
        &self.cache_control
    }

    #[inline]
    pub fn flags(&self) -> &RequestFlags {
        &self.flags
    }

    #[inline]
    pub fn flags_mut(&mut self) -> &mut RequestFlags {
        &mut self.flags
    }

    /// If-Modified-Since（UNIX秒）
    #[inline]
    pub fn ims(&self) -> Option<i64> {
        if self.flags.ims {
            self.ims
        } else {
            None
        }
    }

    #[inline]
    pub fn if_match(&self) -> Option<&ETagList> {
        self.if_match.as_ref()
    }

    #[inline]
    pub fn if_none_match(&self) -> Option<&ETagList> {
        self.if_none_match.as_ref()
    }

    /// If-None-Match があれば If-Modified-Since を無視する
    pub fn ignore_ims(&mut self) {
        self.flags.ims = false;
        self.ims = None;
    }

    /// 条件付きリクエストかどうか
    #[inline]
    pub fn is_conditional(&self) -> bool {
        self.if_match.is_some() || self.if_none_match.is_some() || self.flags.ims
    }

    /// HTTP/HTTPSスキームかどうか（再検証可能なプロトコル）
    #[inline]
    pub fn uses_http_scheme(&self) -> bool {
        matches!(&*self.scheme, "http" | "https")
    }

    /// キースコープ
    ///
    /// `refresh` が立っている場合は再検証スコープになります。
    #[inline]
    pub fn key_scope(&self) -> KeyScope {
        if self.flags.refresh {
            KeyScope::Revalidation
        } else {
            KeyScope::Default
        }
    }

    /// このリクエストの公開キー
    pub fn public_key(&self) -> CacheKey {
        CacheKey::public(self.method, &self.store_id, self.key_scope())
    }
}
