//! キャッシュキー
//!
//! リソース識別子（メソッド・正規化URL・Varyセレクタ）から
//! 固定長のダイジェストを計算します。

use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// HTTPメソッド
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Purge,
    Other,
}

impl HttpMethod {
    /// バイト列からパース
    pub fn from_bytes(method: &[u8]) -> Self {
        if method.eq_ignore_ascii_case(b"GET") {
            HttpMethod::Get
        } else if method.eq_ignore_ascii_case(b"HEAD") {
            HttpMethod::Head
        } else if method.eq_ignore_ascii_case(b"POST") {
            HttpMethod::Post
        } else if method.eq_ignore_ascii_case(b"PUT") {
            HttpMethod::Put
        } else if method.eq_ignore_ascii_case(b"DELETE") {
            HttpMethod::Delete
        } else if method.eq_ignore_ascii_case(b"PURGE") {
            HttpMethod::Purge
        } else {
            HttpMethod::Other
        }
    }

    /// 文字列として取得
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Purge => "PURGE",
            HttpMethod::Other => "OTHER",
        }
    }

    /// レスポンスがキャッシュされうるメソッドか
    #[inline]
    pub fn resp_maybe_cacheable(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head)
    }

    /// 安全でない（キャッシュ無効化を伴う）メソッドか
    #[inline]
    pub fn invalidates_cache(&self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Delete | HttpMethod::Other
        )
    }

    /// レスポンスがキャッシュされうる全メソッド
    pub const CACHEABLE: [HttpMethod; 2] = [HttpMethod::Get, HttpMethod::Head];
}

/// キーのスコープ
///
/// 再検証リクエストは通常キーとは別のキーで合流させ、
/// 再検証中の古いコピーを隠さないようにします。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyScope {
    #[default]
    Default,
    Revalidation,
}

impl KeyScope {
    fn tag(&self) -> u8 {
        match self {
            KeyScope::Default => 0,
            KeyScope::Revalidation => 1,
        }
    }
}

/// キャッシュキー
///
/// 128bitのxxh3ダイジェスト。`Copy`で安価に受け渡しできます。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: u128,
}

impl CacheKey {
    /// 公開キーを作成
    pub fn public(method: HttpMethod, store_id: &str, scope: KeyScope) -> Self {
        Self::compute(b'P', method, store_id, None, scope)
    }

    /// Varyセレクタ付きの公開キーを作成
    pub fn with_vary(method: HttpMethod, store_id: &str, selector: &str, scope: KeyScope) -> Self {
        Self::compute(b'P', method, store_id, Some(selector), scope)
    }

    /// プライベートキーを作成
    ///
    /// `worker` と単調増加の `id` の組で一意になります。公開されることはありません。
    pub fn private(worker: u32, id: u64) -> Self {
        let mut data = [0u8; 13];
        data[0] = b'X';
        data[1..5].copy_from_slice(&worker.to_le_bytes());
        data[5..13].copy_from_slice(&id.to_le_bytes());
        Self { digest: xxh3_128(&data) }
    }

    /// 永続化データからキーを復元
    #[inline]
    pub fn from_digest(digest: u128) -> Self {
        Self { digest }
    }

    fn compute(
        kind: u8,
        method: HttpMethod,
        store_id: &str,
        selector: Option<&str>,
        scope: KeyScope,
    ) -> Self {
        let mut data = Vec::with_capacity(store_id.len() + 32);

        data.push(kind);
        data.push(scope.tag());
        data.extend_from_slice(method.as_str().as_bytes());
        data.push(b'\x00');
        data.extend_from_slice(store_id.as_bytes());

        if let Some(selector) = selector {
            data.push(b'\x00');
            data.extend_from_slice(selector.as_bytes());
        }

        Self { digest: xxh3_128(&data) }
    }

    /// ダイジェストを取得
    #[inline]
    pub fn digest(&self) -> u128 {
        self.digest
    }

    /// 64bitハッシュ値を取得
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.digest as u64
    }

    /// ディスクキャッシュ用のファイルパス部分を生成
    pub fn to_path_components(&self) -> (String, String, String) {
        let hash = self.hash_value();
        let dir1 = format!("{:02x}", (hash >> 56) as u8);
        let dir2 = format!("{:02x}", (hash >> 48) as u8);
        let filename = format!("{:032x}.swap", self.digest);
        (dir1, dir2, filename)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032X}", self.digest)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self)
    }
}

/// ストアIDを生成
///
/// スキーム・ホスト・パス・クエリから正規化URLを組み立てます。
/// ホストとスキームは小文字化されます。
pub fn store_id(scheme: &str, host: &str, path: &str, query: Option<&str>) -> String {
    let path = if path.is_empty() { "/" } else { path };
    match query {
        Some(q) if !q.is_empty() => format!(
            "{}://{}{}?{}",
            scheme.to_ascii_lowercase(),
            host.to_ascii_lowercase(),
            path,
            q
        ),
        _ => format!(
            "{}://{}{}",
            scheme.to_ascii_lowercase(),
            host.to_ascii_lowercase(),
            path
        ),
    }
}
