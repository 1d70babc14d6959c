//! ストア設定

use ftlog::warn;
use serde::Deserialize;
use std::path::PathBuf;

use super::policy::RefreshPolicy;

/// デフォルト値関数
fn default_memory_cache_size() -> usize { 256 * 1024 * 1024 } // 256MB
fn default_memory_page_size() -> usize { 4096 } // 4KB
fn default_max_in_memory_object_size() -> usize { 512 * 1024 } // 512KB
fn default_writer_lease_secs() -> u64 { 30 }
fn default_ttl() -> u64 { 300 } // 5分
fn default_heuristic_percent() -> u64 { 20 }
fn default_heuristic_max_secs() -> u64 { 3 * 24 * 3600 } // 3日
fn default_cacheable_statuses() -> Vec<u16> {
    vec![200, 203, 300, 301, 308, 410]
}
fn default_disk_max_size() -> u64 { 1024 * 1024 * 1024 } // 1GB
fn default_max_object_size() -> u64 { 64 * 1024 * 1024 } // 64MB
fn default_true() -> bool { true }

/// ストア設定
#[derive(Deserialize, Clone, Debug)]
pub struct StoreConfig {
    /// 共有メモリティアの最大サイズ（バイト）
    ///
    /// 0 の場合はメモリティアを使用しない
    ///
    /// デフォルト: 256MB
    #[serde(default = "default_memory_cache_size")]
    pub memory_cache_size: usize,

    /// メモリページサイズ（バイト）
    ///
    /// デフォルト: 4KB
    #[serde(default = "default_memory_page_size")]
    pub memory_page_size: usize,

    /// メモリティアに置ける最大オブジェクトサイズ（バイト）
    ///
    /// デフォルト: 512KB
    #[serde(default = "default_max_in_memory_object_size")]
    pub max_in_memory_object_size: usize,

    /// Collapsed Forwarding を有効化
    ///
    /// デフォルト: true
    #[serde(default = "default_true")]
    pub collapsed_forwarding: bool,

    /// ライター登録のリース期間（秒）
    ///
    /// この期間書き込みが進まないライターは放棄されたものとみなす
    ///
    /// デフォルト: 30秒
    #[serde(default = "default_writer_lease_secs")]
    pub writer_lease_secs: u64,

    /// ネガティブキャッシュのTTL（秒）
    ///
    /// 0 の場合はエラーレスポンスをキャッシュしない
    #[serde(default)]
    pub negative_ttl_secs: u64,

    /// デフォルトTTL（秒）
    ///
    /// Cache-Control、Expires、Last-Modified がない場合に使用
    ///
    /// デフォルト: 300秒（5分）
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// Last-Modified ヒューリスティックの割合（%）
    ///
    /// デフォルト: 20
    #[serde(default = "default_heuristic_percent")]
    pub heuristic_percent: u64,

    /// ヒューリスティック寿命の下限（秒）
    #[serde(default)]
    pub heuristic_min_secs: u64,

    /// ヒューリスティック寿命の上限（秒）
    ///
    /// デフォルト: 3日
    #[serde(default = "default_heuristic_max_secs")]
    pub heuristic_max_secs: u64,

    /// PURGE メソッドを許可
    ///
    /// デフォルト: false
    #[serde(default)]
    pub enable_purge: bool,

    /// キャッシュ除外パスパターン（globパターン）
    ///
    /// 例: ["/api/user/*", "/api/session"]
    #[serde(default)]
    pub bypass_patterns: Vec<String>,

    /// キャッシュ対象ステータスコード
    ///
    /// デフォルト: [200, 203, 300, 301, 308, 410]
    #[serde(default = "default_cacheable_statuses")]
    pub cacheable_statuses: Vec<u16>,

    /// ディスクティア
    ///
    /// `[[store.disks]]` テーブルで複数指定可能
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
}

/// ディスクティア設定
#[derive(Deserialize, Clone, Debug)]
pub struct DiskConfig {
    /// ベースディレクトリ
    pub path: PathBuf,

    /// 最大ディスク使用量（バイト）
    ///
    /// デフォルト: 1GB
    #[serde(default = "default_disk_max_size")]
    pub max_size: u64,

    /// このディスクに置く最小オブジェクトサイズ（バイト）
    #[serde(default)]
    pub min_object_size: u64,

    /// このディスクに置く最大オブジェクトサイズ（バイト）
    ///
    /// デフォルト: 64MB
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl DiskConfig {
    /// パスだけを指定した設定
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size: default_disk_max_size(),
            min_object_size: 0,
            max_object_size: default_max_object_size(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: default_memory_cache_size(),
            memory_page_size: default_memory_page_size(),
            max_in_memory_object_size: default_max_in_memory_object_size(),
            collapsed_forwarding: true,
            writer_lease_secs: default_writer_lease_secs(),
            negative_ttl_secs: 0,
            default_ttl_secs: default_ttl(),
            heuristic_percent: default_heuristic_percent(),
            heuristic_min_secs: 0,
            heuristic_max_secs: default_heuristic_max_secs(),
            enable_purge: false,
            bypass_patterns: Vec::new(),
            cacheable_statuses: default_cacheable_statuses(),
            disks: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// ステータスコードがキャッシュ対象かチェック
    #[inline]
    pub fn is_cacheable_status(&self, status: u16) -> bool {
        self.cacheable_statuses.contains(&status)
    }

    /// パスがバイパスパターンにマッチするかチェック
    pub fn should_bypass(&self, path: &str) -> bool {
        for pattern in &self.bypass_patterns {
            if let Ok(glob) = glob::Pattern::new(pattern) {
                if glob.matches(path) {
                    return true;
                }
            }
        }
        false
    }

    /// メモリティアの最大ページ数
    #[inline]
    pub fn memory_pages_max(&self) -> usize {
        if self.memory_page_size == 0 {
            return 0;
        }
        self.memory_cache_size / self.memory_page_size
    }

    /// 設定値から標準の鮮度判定ポリシーを作成
    ///
    /// ヒューリスティック寿命の下限と上限が逆転していれば入れ替えます。
    pub fn refresh_policy(&self) -> RefreshPolicy {
        let (min, max) = if self.heuristic_min_secs > self.heuristic_max_secs {
            warn!(
                "heuristic_min_secs ({}) exceeds heuristic_max_secs ({}), swapping",
                self.heuristic_min_secs, self.heuristic_max_secs
            );
            (self.heuristic_max_secs, self.heuristic_min_secs)
        } else {
            (self.heuristic_min_secs, self.heuristic_max_secs)
        };
        RefreshPolicy {
            default_ttl_secs: self.default_ttl_secs,
            heuristic_percent: self.heuristic_percent,
            heuristic_min_secs: min,
            heuristic_max_secs: max,
        }
    }
}
