//! キャッシュポリシー
//!
//! Cache-Controlヘッダーの解析、キャッシュ可否判定、鮮度判定を行います。

use super::entry::StoreEntry;
use super::reply::HttpReply;
use super::request::RequestInfo;

/// Varyヘッダー解析結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaryResult {
    /// Varyヘッダーが存在しない
    NotPresent,
    /// Vary: * でキャッシュ不可
    Uncacheable,
    /// Varyヘッダーで指定されたヘッダー名のリスト
    Headers(Vec<String>),
}

impl VaryResult {
    /// キャッシュ可能かどうか
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, VaryResult::Uncacheable)
    }

    /// ヘッダーリストを取得
    #[inline]
    pub fn headers(&self) -> Option<&Vec<String>> {
        match self {
            VaryResult::Headers(h) => Some(h),
            _ => None,
        }
    }
}

/// Cache-Control ディレクティブ
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    /// max-age（秒）
    pub max_age: Option<u64>,
    /// s-maxage（秒、プロキシ用）
    pub s_maxage: Option<u64>,
    /// no-cache フラグ
    pub no_cache: bool,
    /// no-store フラグ
    pub no_store: bool,
    /// private フラグ
    pub private: bool,
    /// public フラグ
    pub public: bool,
    /// must-revalidate フラグ
    pub must_revalidate: bool,
    /// proxy-revalidate フラグ
    pub proxy_revalidate: bool,
    /// only-if-cached フラグ（リクエスト用）
    pub only_if_cached: bool,
    /// immutable フラグ
    pub immutable: bool,
}

impl CacheControl {
    /// Cache-Controlヘッダー値をパース
    pub fn parse(value: &[u8]) -> Self {
        let mut cc = Self::default();

        let value_str = match std::str::from_utf8(value) {
            Ok(s) => s,
            Err(_) => return cc,
        };

        for directive in value_str.split(',') {
            let directive = directive.trim().to_lowercase();

            if directive == "no-cache" {
                cc.no_cache = true;
            } else if directive == "no-store" {
                cc.no_store = true;
            } else if directive == "private" {
                cc.private = true;
            } else if directive == "public" {
                cc.public = true;
            } else if directive == "must-revalidate" {
                cc.must_revalidate = true;
            } else if directive == "proxy-revalidate" {
                cc.proxy_revalidate = true;
            } else if directive == "only-if-cached" {
                cc.only_if_cached = true;
            } else if directive == "immutable" {
                cc.immutable = true;
            } else if let Some(value) = directive.strip_prefix("max-age=") {
                cc.max_age = value.trim_matches('"').parse().ok();
            } else if let Some(value) = directive.strip_prefix("s-maxage=") {
                cc.s_maxage = value.trim_matches('"').parse().ok();
            }
        }

        cc
    }

    /// プロキシでキャッシュ可能かどうか
    pub fn is_cacheable(&self) -> bool {
        // no-store は絶対にキャッシュ不可
        if self.no_store {
            return false;
        }

        // private はプロキシでキャッシュ不可
        if self.private {
            return false;
        }

        true
    }

    /// 明示的な鮮度寿命（秒）
    ///
    /// 優先順位: s-maxage > max-age
    #[inline]
    pub fn explicit_ttl(&self) -> Option<u64> {
        self.s_maxage.or(self.max_age)
    }

    /// 再検証失敗時に古いコピーを返してはいけないか
    #[inline]
    pub fn forbids_stale(&self) -> bool {
        self.must_revalidate || self.proxy_revalidate || self.s_maxage.is_some()
    }
}

/// キャッシュポリシー
///
/// レスポンスを共有ティアに保存してよいかを判定します。
pub struct CachePolicy;

impl CachePolicy {
    /// レスポンスを共有ティアに保存してよいかどうか
    ///
    /// # Arguments
    ///
    /// * `reply` - オリジンのレスポンス
    /// * `cacheable_statuses` - キャッシュ可能なステータスコードのリスト
    /// * `negative_ttl_secs` - 0以外ならエラーレスポンスもネガティブキャッシュする
    pub fn is_storable(reply: &HttpReply, cacheable_statuses: &[u16], negative_ttl_secs: u64) -> bool {
        let status = reply.status();
        let status_ok = cacheable_statuses.contains(&status)
            || (negative_ttl_secs > 0 && Self::is_negative(status));
        if !status_ok {
            return false;
        }

        if !reply.cache_control().is_cacheable() {
            return false;
        }

        // Vary: * はキャッシュ不可
        reply.vary().is_cacheable()
    }

    /// ネガティブキャッシュ対象のステータスかどうか
    #[inline]
    pub fn is_negative(status: u16) -> bool {
        status >= 400
    }

    /// Varyヘッダーを解析
    ///
    /// 戻り値:
    /// - `VaryResult::NotPresent` - Varyヘッダーなし
    /// - `VaryResult::Uncacheable` - Vary: * でキャッシュ不可
    /// - `VaryResult::Headers(vec)` - Varyヘッダーのリスト
    pub fn parse_vary_ex(response_headers: &[(Box<[u8]>, Box<[u8]>)]) -> VaryResult {
        let vary_header = response_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b"vary"))
            .map(|(_, value)| value);

        let vary_header = match vary_header {
            Some(h) => h,
            None => return VaryResult::NotPresent,
        };

        let vary_str = match std::str::from_utf8(vary_header) {
            Ok(s) => s,
            Err(_) => return VaryResult::NotPresent,
        };

        // Vary: * はキャッシュ不可
        if vary_str.trim() == "*" {
            return VaryResult::Uncacheable;
        }

        let headers: Vec<String> = vary_str
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        if headers.is_empty() {
            return VaryResult::NotPresent;
        }

        VaryResult::Headers(headers)
    }
}

/// 鮮度判定ポリシー
///
/// エントリが再検証を必要とするかを判定します。
pub trait FreshnessPolicy: Send + Sync {
    /// エントリが古くなっているかどうか
    fn is_stale(&self, entry: &StoreEntry, request: &RequestInfo, now: i64) -> bool;
}

/// 標準の鮮度判定
///
/// s-maxage > max-age > Expires > Last-Modified ヒューリスティック > デフォルトTTL
/// の順で鮮度寿命を決定します。
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// デフォルトTTL（秒）
    pub default_ttl_secs: u64,
    /// Last-Modified からの経過時間に掛ける割合（%）
    pub heuristic_percent: u64,
    /// ヒューリスティック寿命の下限（秒）
    pub heuristic_min_secs: u64,
    /// ヒューリスティック寿命の上限（秒）
    pub heuristic_max_secs: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            heuristic_percent: 20,
            heuristic_min_secs: 0,
            heuristic_max_secs: 3 * 24 * 3600,
        }
    }
}

impl RefreshPolicy {
    /// 鮮度寿命（秒）を計算
    pub fn freshness_lifetime(&self, reply: &HttpReply, served_at: i64, lastmod: Option<i64>) -> u64 {
        if let Some(ttl) = reply.cache_control().explicit_ttl() {
            return ttl;
        }

        if let Some(expires) = reply.expires() {
            let date = reply.date().unwrap_or(served_at);
            return expires.saturating_sub(date).max(0) as u64;
        }

        if let Some(lastmod) = lastmod {
            let age_at_fetch = served_at.saturating_sub(lastmod).max(0) as u64;
            let ttl = age_at_fetch * self.heuristic_percent / 100;
            return ttl.max(self.heuristic_min_secs).min(self.heuristic_max_secs);
        }

        self.default_ttl_secs
    }
}

impl FreshnessPolicy for RefreshPolicy {
    fn is_stale(&self, entry: &StoreEntry, request: &RequestInfo, now: i64) -> bool {
        // クライアントの強制リロード
        if request.flags().no_cache {
            return true;
        }

        let reply = match entry.freshest_reply() {
            Some(reply) => reply,
            None => return true,
        };

        if reply.cache_control().no_cache {
            return true;
        }

        let ts = entry.timestamps();
        let served_at = match ts.timestamp {
            Some(t) => t,
            None => return true,
        };

        let age = now.saturating_sub(served_at).max(0) as u64;

        if let Some(max_age) = request.cache_control().max_age {
            if age > max_age {
                return true;
            }
        }

        if reply.cache_control().immutable && reply.cache_control().explicit_ttl().is_some() {
            return false;
        }

        age > self.freshness_lifetime(&reply, served_at, ts.lastmod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(Box<[u8]>, Box<[u8]>)> {
        pairs
            .iter()
            .map(|(n, v)| (n.as_bytes().into(), v.as_bytes().into()))
            .collect()
    }

    #[test]
    fn test_parse_cache_control_basic() {
        let cc = CacheControl::parse(b"max-age=3600, public");
        assert_eq!(cc.max_age, Some(3600));
        assert!(cc.public);
        assert!(!cc.private);
    }

    #[test]
    fn test_parse_cache_control_no_store() {
        let cc = CacheControl::parse(b"no-store");
        assert!(cc.no_store);
        assert!(!cc.is_cacheable());
    }

    #[test]
    fn test_parse_cache_control_private() {
        let cc = CacheControl::parse(b"private, max-age=300");
        assert!(cc.private);
        assert_eq!(cc.max_age, Some(300));
        assert!(!cc.is_cacheable()); // プロキシではキャッシュ不可
    }

    #[test]
    fn test_parse_cache_control_s_maxage() {
        let cc = CacheControl::parse(b"max-age=300, s-maxage=600");
        assert_eq!(cc.explicit_ttl(), Some(600)); // s-maxageが優先
        assert!(cc.forbids_stale());
    }

    #[test]
    fn test_storable() {
        let ok = HttpReply::new(200, headers(&[("Cache-Control", "max-age=60")]));
        assert!(CachePolicy::is_storable(&ok, &[200], 0));

        let no_store = HttpReply::new(200, headers(&[("Cache-Control", "no-store")]));
        assert!(!CachePolicy::is_storable(&no_store, &[200], 0));

        let vary_star = HttpReply::new(200, headers(&[("Vary", "*")]));
        assert!(!CachePolicy::is_storable(&vary_star, &[200], 0));

        let not_found = HttpReply::new(404, vec![]);
        assert!(!CachePolicy::is_storable(&not_found, &[200], 0));
        assert!(CachePolicy::is_storable(&not_found, &[200], 30));
    }

    #[test]
    fn test_parse_vary_ex() {
        let result = CachePolicy::parse_vary_ex(&headers(&[("Vary", "Accept-Encoding, User-Agent")]));
        let list = result.headers().unwrap();
        assert!(list.contains(&"accept-encoding".to_string()));
        assert!(list.contains(&"user-agent".to_string()));

        assert_eq!(CachePolicy::parse_vary_ex(&[]), VaryResult::NotPresent);
        assert_eq!(
            CachePolicy::parse_vary_ex(&headers(&[("Vary", "*")])),
            VaryResult::Uncacheable
        );
    }

    #[test]
    fn test_freshness_lifetime_order() {
        let policy = RefreshPolicy::default();

        let max_age = HttpReply::new(200, headers(&[("Cache-Control", "max-age=60")]));
        assert_eq!(policy.freshness_lifetime(&max_age, 1000, None), 60);

        let expires = HttpReply::new(
            200,
            headers(&[
                ("Date", "Sun, 06 Nov 1994 08:49:37 GMT"),
                ("Expires", "Sun, 06 Nov 1994 08:50:37 GMT"),
            ]),
        );
        assert_eq!(policy.freshness_lifetime(&expires, 0, None), 60);

        // Last-Modified から 1000秒経過 → 20% = 200秒
        let bare = HttpReply::new(200, vec![]);
        assert_eq!(policy.freshness_lifetime(&bare, 2000, Some(1000)), 200);
        assert_eq!(policy.freshness_lifetime(&bare, 2000, None), 300);
    }

    #[test]
    fn test_heuristic_cap() {
        let policy = RefreshPolicy {
            heuristic_max_secs: 100,
            ..Default::default()
        };
        let bare = HttpReply::new(200, vec![]);
        assert_eq!(policy.freshness_lifetime(&bare, 100_000, Some(0)), 100);
    }

    #[test]
    fn test_heuristic_inverted_bounds_do_not_panic() {
        let policy = RefreshPolicy {
            heuristic_min_secs: 600,
            heuristic_max_secs: 60,
            ..Default::default()
        };
        let bare = HttpReply::new(200, vec![]);
        assert_eq!(policy.freshness_lifetime(&bare, 2000, Some(1000)), 60);
    }
}
