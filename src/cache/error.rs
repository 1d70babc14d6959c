//! # ストアエラー定義
//!
//! ティア操作・コントローラ操作で発生するエラー型を提供します。
//! `find()` / `peek()` はこれらのエラーを呼び出し元に伝播せず、
//! ログを出力したうえで「見つからない」として扱います。

use std::fmt;
use std::io;

use super::key::CacheKey;

/// ストアエラー
#[derive(Debug)]
pub enum StoreError {
    /// ティア間の不整合（インデックス破損、アンカー不能など）
    LookupInconsistency(String),
    /// 同一キーに対する二重ライター登録
    OwnershipConflict(CacheKey),
    /// ライターが書き込み途中で消失した
    AbandonedWriter(CacheKey),
    /// 削除予定としてマーク済み
    MarkedForDeletion(CacheKey),
    /// 容量不足でアドミッション拒否
    NoSpace { required: u64, available: u64 },
    /// 長さ不一致（切り詰められたエントリ）
    BadLength { expected: u64, actual: u64 },
    /// 永続化データの破損
    Corrupted(String),
    /// 並行更新との衝突
    UpdateConflict(String),
    /// 状態遷移違反
    InvalidState(&'static str),
    /// I/O エラー
    Io(io::Error),
}

impl StoreError {
    /// 「見つからない」として扱うべきエラーかどうか
    ///
    /// 破損・長さ不一致はティアのフォールバックやオリジン取得で回復します。
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BadLength { .. } | Self::Corrupted(_) | Self::LookupInconsistency(_)
        ) || matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LookupInconsistency(msg) => write!(f, "Lookup inconsistency: {}", msg),
            Self::OwnershipConflict(key) => {
                write!(f, "Ownership conflict: {} already has a writer", key)
            }
            Self::AbandonedWriter(key) => write!(f, "Writer abandoned entry {}", key),
            Self::MarkedForDeletion(key) => write!(f, "Entry {} is marked for deletion", key),
            Self::NoSpace { required, available } => {
                write!(f, "No space: {} bytes required, {} available", required, available)
            }
            Self::BadLength { expected, actual } => {
                write!(f, "Bad length: expected {} bytes, got {}", expected, actual)
            }
            Self::Corrupted(msg) => write!(f, "Corrupted entry: {}", msg),
            Self::UpdateConflict(msg) => write!(f, "Update conflict: {}", msg),
            Self::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// ストア操作の結果型
pub type Result<T> = std::result::Result<T, StoreError>;
