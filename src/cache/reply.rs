//! レスポンスレコード
//!
//! HTTPレスポンスをヘッダーリストと抽出済みアクセサフィールド
//! （Date、Last-Modified、Expires、ETag、Content-Length）として保持します。
//! ヘッダーの構文解析は行いません。

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::policy::{CacheControl, CachePolicy, VaryResult};

/// ヘッダー（名前-値ペア）
pub type Header = (Box<[u8]>, Box<[u8]>);

/// 304で上書きしてはいけないヘッダー
const NOT_UPDATED_ON_304: &[&[u8]] = &[
    b"content-length",
    b"content-encoding",
    b"content-range",
    b"transfer-encoding",
    b"connection",
    b"keep-alive",
    b"te",
    b"trailer",
    b"upgrade",
    b"proxy-authenticate",
    b"proxy-authorization",
];

/// 現在時刻（UNIX秒）
#[inline]
pub fn now_secs() -> i64 {
    unix_secs(SystemTime::now())
}

/// SystemTime を UNIX秒に変換
pub fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// UNIX秒を SystemTime に変換
pub fn system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// HTTP-date をパース
pub fn parse_http_date(value: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(value).ok()?;
    httpdate::parse_http_date(s.trim()).ok().map(unix_secs)
}

/// HTTP-date にフォーマット
pub fn format_http_date(secs: i64) -> String {
    httpdate::fmt_http_date(system_time(secs))
}

/// エンティティタグ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ETag {
    /// 引用符を含む不透明タグ
    pub tag: Box<str>,
    /// 弱いバリデータかどうか
    pub weak: bool,
}

impl ETag {
    /// `W/"abc"` または `"abc"` をパース
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (weak, tag) = match value.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        if tag.len() < 2 || !tag.starts_with('"') || !tag.ends_with('"') {
            return None;
        }
        Some(Self { tag: tag.into(), weak })
    }

    /// 強い比較（If-Match用）
    #[inline]
    pub fn strong_eq(&self, other: &ETag) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }

    /// 弱い比較（If-None-Match用）
    #[inline]
    pub fn weak_eq(&self, other: &ETag) -> bool {
        self.tag == other.tag
    }
}

/// HTTPレスポンス
#[derive(Debug, Clone)]
pub struct HttpReply {
    status: u16,
    headers: Vec<Header>,
    date: Option<i64>,
    last_modified: Option<i64>,
    expires: Option<i64>,
    etag: Option<ETag>,
    content_length: Option<u64>,
    cache_control: CacheControl,
    vary: VaryResult,
}

impl HttpReply {
    /// ステータスとヘッダーからレスポンスを作成
    pub fn new(status: u16, headers: Vec<Header>) -> Self {
        let mut reply = Self {
            status,
            headers,
            date: None,
            last_modified: None,
            expires: None,
            etag: None,
            content_length: None,
            cache_control: CacheControl::default(),
            vary: VaryResult::NotPresent,
        };
        reply.extract_fields();
        reply
    }

    /// ヘッダーから重要な値を抽出
    fn extract_fields(&mut self) {
        self.date = None;
        self.last_modified = None;
        self.expires = None;
        self.etag = None;
        self.content_length = None;
        self.cache_control = CacheControl::default();

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case(b"date") {
                self.date = parse_http_date(value);
            } else if name.eq_ignore_ascii_case(b"last-modified") {
                self.last_modified = parse_http_date(value);
            } else if name.eq_ignore_ascii_case(b"expires") {
                // 不正な Expires は「既に期限切れ」を意味する
                self.expires = Some(parse_http_date(value).unwrap_or(0));
            } else if name.eq_ignore_ascii_case(b"etag") {
                self.etag = std::str::from_utf8(value).ok().and_then(ETag::parse);
            } else if name.eq_ignore_ascii_case(b"content-length") {
                self.content_length = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.trim().parse().ok());
            } else if name.eq_ignore_ascii_case(b"cache-control") {
                self.cache_control = CacheControl::parse(value);
            }
        }

        self.vary = CachePolicy::parse_vary_ex(&self.headers);
    }

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[inline]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// 名前でヘッダー値を取得（最初の一致）
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    #[inline]
    pub fn date(&self) -> Option<i64> {
        self.date
    }

    #[inline]
    pub fn last_modified(&self) -> Option<i64> {
        self.last_modified
    }

    #[inline]
    pub fn expires(&self) -> Option<i64> {
        self.expires
    }

    #[inline]
    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[inline]
    pub fn cache_control(&self) -> &CacheControl {
        &self.cache_control
    }

    #[inline]
    pub fn vary(&self) -> &VaryResult {
        &self.vary
    }

    /// Dateヘッダーで比較して `other` より古いかどうか
    ///
    /// どちらかのDateが不明な場合は古いとみなしません。
    pub fn older_than(&self, other: &HttpReply) -> bool {
        match (self.date, other.date) {
            (Some(mine), Some(theirs)) => mine < theirs,
            _ => false,
        }
    }

    /// 304レスポンスのヘッダーをマージ
    ///
    /// ボディに関するヘッダーは保持し、それ以外は304側の値で置き換えます。
    pub fn update_on_not_modified(&mut self, r304: &HttpReply) {
        for (name, _) in r304.headers() {
            if NOT_UPDATED_ON_304.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        }
        for (name, value) in r304.headers() {
            if NOT_UPDATED_ON_304.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            self.headers.push((name.clone(), value.clone()));
        }
        self.extract_fields();
    }

    /// ヘッダーを置き換え（存在しなければ追加）
    pub fn set_header(&mut self, name: &[u8], value: &[u8]) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.into(), value.into()));
        self.extract_fields();
    }

    /// 概算メモリ使用量
    pub fn memory_usage(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        for (name, value) in &self.headers {
            size += name.len() + value.len();
        }
        size
    }
}
