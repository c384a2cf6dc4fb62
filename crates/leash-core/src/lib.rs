//! leash-core
//!
//! 共有ジョブキューに対する at-least-once な fetch lease。
//!
//! ワーカーは `QueueStore` からエントリを 1 件 claim し、`FetchLease` として
//! 保持します。所有者は ack（エントリ削除）か nack（エントリを見える状態に戻し、
//! 待機中のワーカーに通知）のどちらかを決めます。決めないままスコープを抜けた
//! lease は、所有者の代わりに nack されます。
//!
//! ワーカー間の調停は store の claim（`fetched_at` の compare-and-set）だけで行い、
//! プロセス内のロックやコーディネータは持ちません。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, entry, notification, state, errors）
//! - **ports**: 抽象化レイヤー（QueueStore, NotificationChannel, Clock, IdGenerator）
//! - **lease**: FetchLease と Ack/Nack プロトコル
//! - **impls**: 実装（インメモリ、SQLite）
//! - **app**: アプリケーション層（JobFetcher, WorkerGroup）

pub mod app;
pub mod domain;
pub mod impls;
pub mod lease;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{FetcherOptions, HandlerError, JobFetcher, JobHandler, LeasedJob, WorkerGroup};
pub use domain::{
    EntryId, ErrorKind, JobId, LeaseError, LeaseOp, LeaseState, QueueName, StoreError,
};
pub use impls::{InMemoryNotificationChannel, InMemoryQueueStore, SqliteQueueStore};
pub use lease::{FetchLease, FetchLeaseBuilder};
pub use ports::{NotificationChannel, QueueStore};
