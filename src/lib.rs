//! veil-store
//!
//! HTTPフォワードプロキシ向けのオブジェクトストアとキャッシュ一貫性管理。

pub mod cache;
