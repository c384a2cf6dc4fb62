//! QueueStore port - キューエントリの共有された正本
//!
//! ワーカー間の調停はすべて `claim` を通ります。
//! `claim` は `fetched_at` に対する compare-and-set でなければならず、
//! 同時に走る 2 つの claim が同じエントリを返すことはありません。
//! ワーカーをまたぐプロセス内ロックはありません。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ClaimedEntry, EntryId, JobId, QueueCounts, QueueEntry, QueueName, StoreError};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// `queue` に `job_id` の見えるエントリを追加する
    async fn enqueue(&self, queue: &QueueName, job_id: JobId) -> Result<EntryId, StoreError>;

    /// `queue` の claim 可能なエントリを 1 件選び、`fetched_at = now` を刻んで返す（アトミック）。
    /// 対象が無ければ `None`。
    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedEntry>, StoreError>;

    /// エントリを削除する。0 件一致はエラーではない
    async fn delete(&self, entry_id: EntryId) -> Result<(), StoreError>;

    /// `fetched_at` を戻してエントリを見える状態にする。
    ///
    /// 呼び出し側の claim が刻んだ `fetched_at` がまだ残っているときだけ効く。
    /// その間に解放・再 claim されていれば 0 件一致で、エラーではない。
    async fn release_lease(
        &self,
        entry_id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get(&self, entry_id: EntryId) -> Result<Option<QueueEntry>, StoreError>;

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, StoreError>;
}
