//! スワップファイル形式
//!
//! ```text
//! "VSWP" | version:u8 | digest:u128 | timestamp | lastref | lastmod | expires (i64 x4)
//! | bits:u8 | method | status:u16 | store_id | vary selector
//! | header count:u32 | (name, value)* | body_len:u64 | body
//! ```
//!
//! 整数はリトルエンディアン、可変長フィールドは u32 長さプレフィックス付き。
//! タイムスタンプの欠損は `i64::MIN` で表します。

use std::sync::Arc;

use super::entry::{StoredObject, Timestamps};
use super::error::{Result, StoreError};
use super::key::{CacheKey, HttpMethod};
use super::reply::{Header, HttpReply};
use super::vary::VarySelector;

const MAGIC: &[u8; 4] = b"VSWP";
const VERSION: u8 = 1;
const NONE_TS: i64 = i64::MIN;

const BIT_NEGATIVE: u8 = 1 << 0;
const BIT_SELECTOR: u8 = 1 << 1;

/// オブジェクトをシリアライズ
pub fn encode(obj: &StoredObject) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + obj.reply.memory_usage() + obj.body.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&obj.key.digest().to_le_bytes());

    let ts = &obj.timestamps;
    for t in [ts.timestamp, ts.lastref, ts.lastmod, ts.expires] {
        out.extend_from_slice(&t.unwrap_or(NONE_TS).to_le_bytes());
    }

    let mut bits = 0u8;
    if obj.negative {
        bits |= BIT_NEGATIVE;
    }
    if obj.vary_selector.is_some() {
        bits |= BIT_SELECTOR;
    }
    out.push(bits);

    put_bytes(&mut out, obj.method.as_str().as_bytes());
    out.extend_from_slice(&obj.reply.status().to_le_bytes());
    put_bytes(&mut out, obj.store_id.as_bytes());
    put_bytes(&mut out, obj.vary_selector.as_ref().map(|s| s.as_str()).unwrap_or("").as_bytes());

    out.extend_from_slice(&(obj.reply.headers().len() as u32).to_le_bytes());
    for (name, value) in obj.reply.headers() {
        put_bytes(&mut out, name);
        put_bytes(&mut out, value);
    }

    out.extend_from_slice(&(obj.body.len() as u64).to_le_bytes());
    out.extend_from_slice(&obj.body);
    out
}

/// シリアライズ済みデータを復元
///
/// `expected` が与えられた場合はダイジェストの一致を確認します。
pub fn decode(data: &[u8], expected: Option<&CacheKey>) -> Result<StoredObject> {
    let mut r = Reader { data, pos: 0 };

    if r.take(4)? != MAGIC {
        return Err(StoreError::Corrupted("bad swap magic".into()));
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(StoreError::Corrupted(format!("unsupported swap version {}", version)));
    }

    let key = CacheKey::from_digest(u128::from_le_bytes(r.array()?));
    if let Some(expected) = expected {
        if key != *expected {
            return Err(StoreError::Corrupted(format!("swap key {} does not match {}", key, expected)));
        }
    }

    let mut ts = [None; 4];
    for t in ts.iter_mut() {
        let v = i64::from_le_bytes(r.array()?);
        *t = (v != NONE_TS).then_some(v);
    }
    let timestamps = Timestamps {
        timestamp: ts[0],
        lastref: ts[1],
        lastmod: ts[2],
        expires: ts[3],
    };

    let bits = r.u8()?;
    let method = HttpMethod::from_bytes(r.bytes()?);
    let status = u16::from_le_bytes(r.array()?);
    let store_id = std::str::from_utf8(r.bytes()?)
        .map_err(|_| StoreError::Corrupted("store id is not utf-8".into()))?;
    let selector = std::str::from_utf8(r.bytes()?)
        .map_err(|_| StoreError::Corrupted("vary selector is not utf-8".into()))?;

    let count = u32::from_le_bytes(r.array()?) as usize;
    let mut headers: Vec<Header> = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let name: Box<[u8]> = r.bytes()?.into();
        let value: Box<[u8]> = r.bytes()?.into();
        headers.push((name, value));
    }

    let body_len = u64::from_le_bytes(r.array()?);
    let actual = (data.len() - r.pos) as u64;
    if body_len != actual {
        return Err(StoreError::BadLength {
            expected: body_len,
            actual,
        });
    }
    let body: Arc<[u8]> = Arc::from(&data[r.pos..]);

    Ok(StoredObject {
        key,
        store_id: store_id.into(),
        method,
        reply: HttpReply::new(status, headers),
        body,
        timestamps,
        negative: bits & BIT_NEGATIVE != 0,
        vary_selector: (bits & BIT_SELECTOR != 0).then(|| VarySelector::from_persisted(selector)),
    })
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(StoreError::Corrupted("truncated swap metadata".into())),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = u32::from_le_bytes(self.array()?) as usize;
        self.take(len)
    }
}
