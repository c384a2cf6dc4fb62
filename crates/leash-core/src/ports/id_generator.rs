//! IdGenerator port - エントリ / ジョブの ID 払い出し

use crate::domain::ids::{EntryId, JobId};
use crate::ports::Clock;
use ulid::Ulid;

/// 調整なしでプロセスをまたいで一意な ID を作る
pub trait IdGenerator: Send + Sync {
    fn generate_entry_id(&self) -> EntryId;

    fn generate_job_id(&self) -> JobId;
}

/// timestamp 部を `Clock` から取る ULID 生成器
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_entry_id(&self) -> EntryId {
        EntryId::from(self.next_ulid())
    }

    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next_ulid())
    }
}
