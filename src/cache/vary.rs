//! Varyバリアント管理
//!
//! ベースキー（Varyセレクタなし）ごとに、バリアントの順序付きリストを保持します。
//! ルックアップは先頭から走査し、最初に完全一致したセレクタを採用します。

use dashmap::DashMap;

use super::key::CacheKey;
use super::reply::Header;

/// Varyセレクタ
///
/// Varyで指定されたリクエストヘッダーの正規化済み値。
/// ヘッダー名は小文字化・ソート済みで、値は前後の空白を除去します。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarySelector(Box<str>);

impl VarySelector {
    /// Varyヘッダー名とリクエストヘッダーからセレクタを計算
    pub fn compute(vary_headers: &[String], request_headers: &[Header]) -> Self {
        let mut names: Vec<String> = vary_headers.iter().map(|n| n.to_ascii_lowercase()).collect();
        names.sort();
        names.dedup();

        let mut out = String::new();
        for name in &names {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(name);

            // 同名ヘッダーは出現順に連結
            let values: Vec<&str> = request_headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
                .filter_map(|(_, v)| std::str::from_utf8(v).ok())
                .map(str::trim)
                .collect();
            if !values.is_empty() {
                out.push_str("=\"");
                out.push_str(&values.join(", "));
                out.push('"');
            }
        }
        Self(out.into())
    }

    /// 永続化済みの文字列から復元
    pub fn from_persisted(s: &str) -> Self {
        Self(s.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// バリアント1件
#[derive(Debug, Clone)]
pub struct VaryVariant {
    /// レスポンスの Vary ヘッダー名
    pub headers: Vec<String>,
    pub selector: VarySelector,
    pub key: CacheKey,
}

/// Varyインデックス
#[derive(Default)]
pub struct VaryIndex {
    variants: DashMap<CacheKey, Vec<VaryVariant>>,
}

impl VaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// バリアントを登録
    ///
    /// 同じセレクタのバリアントが既にあれば置き換えます。
    pub fn register(&self, base: CacheKey, headers: Vec<String>, selector: VarySelector, key: CacheKey) {
        let mut list = self.variants.entry(base).or_default();
        if let Some(existing) = list.iter_mut().find(|v| v.selector == selector) {
            existing.key = key;
            existing.headers = headers;
        } else {
            list.push(VaryVariant { headers, selector, key });
        }
    }

    /// リクエストヘッダーに一致するバリアントのキー
    pub fn find(&self, base: &CacheKey, request_headers: &[Header]) -> Option<CacheKey> {
        let list = self.variants.get(base)?;
        list.iter()
            .find(|v| VarySelector::compute(&v.headers, request_headers) == v.selector)
            .map(|v| v.key)
    }

    /// ベースキーに属する全バリアントのキー
    pub fn variants(&self, base: &CacheKey) -> Vec<CacheKey> {
        self.variants
            .get(base)
            .map(|list| list.iter().map(|v| v.key).collect())
            .unwrap_or_default()
    }

    /// ベースキーを削除し、属していたバリアントのキーを返す
    pub fn remove_base(&self, base: &CacheKey) -> Vec<CacheKey> {
        self.variants
            .remove(base)
            .map(|(_, list)| list.into_iter().map(|v| v.key).collect())
            .unwrap_or_default()
    }

    /// バリアント1件を削除
    pub fn remove_variant(&self, key: &CacheKey) {
        self.variants.retain(|_, list| {
            list.retain(|v| v.key != *key);
            !list.is_empty()
        });
    }

    /// 登録済みベースキー数
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{HttpMethod, KeyScope};

    fn h(name: &str, value: &str) -> Header {
        (name.as_bytes().into(), value.as_bytes().into())
    }

    fn create_test_key(selector: &str) -> CacheKey {
        CacheKey::with_vary(HttpMethod::Get, "http://example.com/v", selector, KeyScope::Default)
    }

    #[test]
    fn test_selector_normalization() {
        let vary = vec!["Accept-Encoding".to_string(), "accept-language".to_string()];
        let a = VarySelector::compute(&vary, &[h("Accept-Language", "ja"), h("accept-encoding", " gzip ")]);
        let b = VarySelector::compute(
            &["accept-language".to_string(), "accept-encoding".to_string()],
            &[h("ACCEPT-ENCODING", "gzip"), h("Accept-Language", "ja")],
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "accept-encoding=\"gzip\",accept-language=\"ja\"");
    }

    #[test]
    fn test_missing_header_differs_from_empty() {
        let vary = vec!["accept-encoding".to_string()];
        let missing = VarySelector::compute(&vary, &[]);
        let empty = VarySelector::compute(&vary, &[h("Accept-Encoding", "")]);
        assert_ne!(missing, empty);
    }

    #[test]
    fn test_first_match_wins() {
        let index = VaryIndex::new();
        let base = CacheKey::public(HttpMethod::Get, "http://example.com/v", KeyScope::Default);
        let vary = vec!["accept-encoding".to_string()];

        let gzip = VarySelector::compute(&vary, &[h("Accept-Encoding", "gzip")]);
        let br = VarySelector::compute(&vary, &[h("Accept-Encoding", "br")]);
        index.register(base, vary.clone(), gzip.clone(), create_test_key(gzip.as_str()));
        index.register(base, vary.clone(), br.clone(), create_test_key(br.as_str()));

        assert_eq!(
            index.find(&base, &[h("Accept-Encoding", "br")]),
            Some(create_test_key(br.as_str()))
        );
        assert_eq!(index.find(&base, &[h("Accept-Encoding", "deflate")]), None);
        assert_eq!(index.variants(&base).len(), 2);
    }

    #[test]
    fn test_register_replaces_same_selector() {
        let index = VaryIndex::new();
        let base = CacheKey::public(HttpMethod::Get, "http://example.com/v", KeyScope::Default);
        let vary = vec!["accept".to_string()];
        let sel = VarySelector::compute(&vary, &[h("Accept", "text/html")]);

        index.register(base, vary.clone(), sel.clone(), create_test_key("1"));
        index.register(base, vary.clone(), sel.clone(), create_test_key("2"));
        assert_eq!(index.variants(&base), vec![create_test_key("2")]);
    }

    #[test]
    fn test_remove() {
        let index = VaryIndex::new();
        let base = CacheKey::public(HttpMethod::Get, "http://example.com/v", KeyScope::Default);
        let vary = vec!["accept".to_string()];
        let sel = VarySelector::compute(&vary, &[]);
        index.register(base, vary, sel, create_test_key("x"));

        index.remove_variant(&create_test_key("x"));
        assert!(index.is_empty());
        assert!(index.remove_base(&base).is_empty());
    }
}
