//! Domain - ドメインモデル
//!
//! - **ids**: 型付き ID（EntryId, JobId）
//! - **entry**: キューエントリと claim 結果
//! - **notification**: 待機ワーカー向けの通知
//! - **state**: lease の状態
//! - **errors**: エラー型

pub mod entry;
pub mod errors;
pub mod ids;
pub mod notification;
pub mod queue_name;
pub mod state;

pub use self::entry::{ClaimedEntry, QueueCounts, QueueEntry};
pub use self::errors::{ErrorKind, LeaseError, LeaseOp, StoreError};
pub use self::ids::{EntryId, JobId};
pub use self::notification::{Notification, NotificationKind};
pub use self::queue_name::QueueName;
pub use self::state::LeaseState;
