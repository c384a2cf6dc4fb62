//! QueueEntry - キューエントリと claim 結果

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EntryId, JobId};
use super::queue_name::QueueName;

/// 未処理の仕事 1 件分の永続レコード。
///
/// - `fetched_at == None`: 見える状態（claim 可能）
/// - `Some(t)`: 時刻 `t` にワーカーが lease 済みで、他からは見えない
///
/// requeue は `fetched_at` だけを戻し、`entry_id` はそのまま。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: EntryId,
    pub job_id: JobId,
    pub queue: QueueName,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(entry_id: EntryId, job_id: JobId, queue: QueueName) -> Self {
        Self {
            entry_id,
            job_id,
            queue,
            fetched_at: None,
        }
    }

    /// `now` の時点で claim 可能か。
    ///
    /// invisibility timeout があれば、それより古い lease は放棄されたとみなす。
    pub fn is_claimable(&self, now: DateTime<Utc>, invisibility_timeout: Option<Duration>) -> bool {
        match (self.fetched_at, invisibility_timeout) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(fetched_at), Some(timeout)) => match chrono::Duration::from_std(timeout) {
                Ok(timeout) => fetched_at + timeout <= now,
                Err(_) => false,
            },
        }
    }
}

/// claim 成功時に返す識別情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedEntry {
    pub entry_id: EntryId,
    pub job_id: JobId,
    pub queue: QueueName,
    pub fetched_at: DateTime<Utc>,
}

/// キューごとの件数（観測用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub visible: usize,
    pub leased: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.visible + self.leased
    }
}
