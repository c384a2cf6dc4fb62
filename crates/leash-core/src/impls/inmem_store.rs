//! InMemoryQueueStore - インメモリの QueueStore
//!
//! 全エントリを 1 つの `tokio::sync::Mutex` で守るので、プロセス内の claim は
//! 互いにアトミックです。エントリは追加順に並び、claim は先頭から走査します
//! （キューごとに FIFO）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{
    ClaimedEntry, EntryId, JobId, QueueCounts, QueueEntry, QueueName, StoreError,
};
use crate::ports::{Clock, IdGenerator, QueueStore, SystemClock, UlidGenerator};

pub struct InMemoryQueueStore {
    entries: Mutex<Vec<QueueEntry>>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    invisibility_timeout: Option<Duration>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            invisibility_timeout: None,
        }
    }

    /// `timeout` より古い lease を再 claim 可能にする
    pub fn with_invisibility_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    /// `queue` の全エントリのスナップショット（claim 順）
    pub async fn entries(&self, queue: &QueueName) -> Vec<QueueEntry> {
        let entries = self.entries.lock().await;
        entries.iter().filter(|e| &e.queue == queue).cloned().collect()
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, queue: &QueueName, job_id: JobId) -> Result<EntryId, StoreError> {
        let entry_id = self.ids.generate_entry_id();
        let mut entries = self.entries.lock().await;
        entries.push(QueueEntry::new(entry_id, job_id, queue.clone()));
        Ok(entry_id)
    }

    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedEntry>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries
            .iter_mut()
            .find(|e| &e.queue == queue && e.is_claimable(now, self.invisibility_timeout))
        else {
            return Ok(None);
        };

        entry.fetched_at = Some(now);
        debug!(entry_id = %entry.entry_id, job_id = %entry.job_id, %queue, "claimed entry");
        Ok(Some(ClaimedEntry {
            entry_id: entry.entry_id,
            job_id: entry.job_id,
            queue: entry.queue.clone(),
            fetched_at: now,
        }))
    }

    async fn delete(&self, entry_id: EntryId) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.entry_id != entry_id);
        Ok(())
    }

    async fn release_lease(
        &self,
        entry_id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.entry_id == entry_id && e.fetched_at == Some(fetched_at))
        {
            entry.fetched_at = None;
        }
        Ok(())
    }

    async fn get(&self, entry_id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().find(|e| e.entry_id == entry_id).cloned())
    }

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, StoreError> {
        let entries = self.entries.lock().await;
        let mut counts = QueueCounts::default();
        for entry in entries.iter().filter(|e| &e.queue == queue) {
            match entry.fetched_at {
                None => counts.visible += 1,
                Some(_) => counts.leased += 1,
            }
        }
        Ok(counts)
    }
}
