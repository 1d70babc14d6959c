//! # HTTPオブジェクトストア
//!
//! フォワードプロキシのキャッシュ層です。ワーカーごとの `Controller` が
//! 共有メモリティア、複数ディスク、Transients（取得中オブジェクトのレジストリ）を束ね、
//! 同じURLへの同時ミスを1回のオリジン取得にまとめます。
//!
//! ## 特徴
//!
//! - **Collapsed Forwarding**: 同一キーの同時ミスはライター1つに合流
//! - **メモリティア**: ページ単位で容量管理する共有キャッシュ（LRU置換）
//! - **ディスクティア**: 2階層ハッシュディレクトリ、オブジェクトサイズによる振り分け
//! - **リバリデーション**: IMS/INM による条件付き取得と304マージ
//! - **Vary対応**: リクエストヘッダーの組み合わせごとにバリアントを保持
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Controller（ワーカーごと）                │
//! │  └─ ローカルインデックス                   │← 使用中エントリ
//! ├──────────────────────────────────────────┤
//! │  SharedStore（全ワーカー共有）             │
//! │  ├─ Transients (DashMap)                 │← 取得中エントリ・削除通知
//! │  ├─ MemoryTier (LRU)                     │← 確定済みオブジェクト
//! │  ├─ Disks → FileSwapDir × N              │← 永続化
//! │  └─ VaryIndex                            │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## 設定例
//!
//! ```toml
//! [store]
//! memory_cache_size = 268435456  # 256MB
//! collapsed_forwarding = true
//! writer_lease_secs = 30
//!
//! [[store.disks]]
//! path = "/var/cache/veil/0"
//! max_size = 1073741824
//! ```

mod client;
mod config;
mod controller;
mod decision;
mod disk;
mod disks;
mod entry;
mod error;
mod key;
mod memory;
mod policy;
mod removal;
mod reply;
mod request;
mod revalidation;
mod swap_meta;
mod transients;
mod vary;

pub use client::{ClientWriter, ContextState, Origin, Progress, ReplyContext, ReplyOutcome};
pub use config::{DiskConfig, StoreConfig};
pub use controller::{CacheStats, Controller, PurgeOutcome, Role, SharedStore};
pub use decision::{
    classify, AccessCheck, AclContext, AclDecision, AclPolicy, AllowAll, HitContext, HitDecision, LogTag, MissReason,
};
pub use disk::{FileSwapDir, SwapDir};
pub use disks::Disks;
pub use entry::{flags, EntryHandle, Handler, MemObject, MemStatus, StoreEntry, StoreStatus, StoredObject, SwapLocation, Timestamps};
pub use error::{Result, StoreError};
pub use key::{CacheKey, HttpMethod, KeyScope};
pub use memory::MemoryTier;
pub use policy::{CacheControl, CachePolicy, FreshnessPolicy, RefreshPolicy, VaryResult};
pub use removal::{LruPolicy, RemovalPolicy};
pub use reply::{format_http_date, now_secs, parse_http_date, ETag, Header, HttpReply};
pub use request::{ETagList, RequestFlags, RequestInfo};
pub use revalidation::{Revalidation, RevalidationOutcome, RevalidationState, Serve, Validators};
pub use transients::{EntryStatus, IoMode, SlotInfo, Transients};
pub use vary::{VaryIndex, VarySelector};
