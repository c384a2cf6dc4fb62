//! Ports - 抽象化レイヤー
//!
//! lease プロトコルはこれらの trait だけに依存します。
//! 実装は `impls` に置きます（テスト・開発用のインメモリ、共有 store としての SQLite）。
//!
//! - **QueueStore**: キューエントリの正本
//! - **NotificationChannel**: 待機ワーカーへの通知
//! - **Clock**: 時刻
//! - **IdGenerator**: ID 払い出し

pub mod clock;
pub mod id_generator;
pub mod notification;
pub mod queue_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::notification::NotificationChannel;
pub use self::queue_store::QueueStore;
