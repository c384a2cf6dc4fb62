//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型付けしています。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 先頭が timestamp なので生成順に並ぶ
//! - **分散生成可能**: 複数プロセスが調整なしで生成できる
//!
//! ## Phantom Type パターン
//! `Id<T>` が共通実装を持ち、`T` は実行時には使わないマーカー型です。
//! lease は EntryId と JobId の両方を持つので、取り違えると別のレコードを
//! 消してしまいます。型が違えばコンパイル時に弾けます。
//!
//! ## テキスト表現
//! `<prefix><ulid>`（`entry-01J…`, `job-01J…`）。SQLite アダプタはこの形で保存するので、
//! `FromStr` は `Display` の出力をそのまま受け付けます。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

use super::errors::StoreError;

/// ID 種別のマーカー trait。Display のプレフィックスを提供する
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// システム時刻から新しい ID を作る。
    /// 本番コードは `IdGenerator` 経由（テストで timestamp 部を固定できる）
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).ok_or_else(|| {
            StoreError::Corrupt(format!("id '{s}' is missing prefix '{}'", T::prefix()))
        })?;
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|e| StoreError::Corrupt(format!("invalid ulid in '{s}': {e}")))
    }
}

/// キューエントリ用マーカー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entry {}

impl IdMarker for Entry {
    fn prefix() -> &'static str {
        "entry-"
    }
}

/// ジョブ用マーカー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// キューエントリの ID。requeue しても変わらない
pub type EntryId = Id<Entry>;

/// エントリが指すジョブの ID
pub type JobId = Id<Job>;
