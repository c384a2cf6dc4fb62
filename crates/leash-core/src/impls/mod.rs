//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryQueueStore** / **InMemoryNotificationChannel**: 単一プロセス用（テスト・開発）
//! - **SqliteQueueStore**: sqlx による共有 store。QueueStore と NotificationChannel を兼ねる

pub mod inmem_notify;
pub mod inmem_store;
pub mod sqlite_store;

pub use self::inmem_notify::InMemoryNotificationChannel;
pub use self::inmem_store::InMemoryQueueStore;
pub use self::sqlite_store::SqliteQueueStore;
