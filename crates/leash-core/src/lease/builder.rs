//! FetchLeaseBuilder - 部品から lease を組み立てる
//!
//! `JobFetcher` を通さず、claim した行を自前で読むアダプタ向け。
//! 足りない部品は `build()` 時点で `LeaseError::InvalidArgument` になり、
//! `ack` / `nack` の中で初めて失敗することはない。
//!
//! `fetched_at` も必須。解放はこの値と一致するときだけ効くので、
//! 推測した時刻で埋めてはいけない。

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{ClaimedEntry, EntryId, JobId, LeaseError, QueueName};
use crate::ports::{NotificationChannel, QueueStore};

use super::fetch_lease::FetchLease;

#[derive(Default)]
pub struct FetchLeaseBuilder {
    store: Option<Arc<dyn QueueStore>>,
    notifications: Option<Arc<dyn NotificationChannel>>,
    entry_id: Option<EntryId>,
    job_id: Option<JobId>,
    queue: Option<String>,
    fetched_at: Option<DateTime<Utc>>,
}

impl FetchLeaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn NotificationChannel>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn entry_id(mut self, entry_id: EntryId) -> Self {
        self.entry_id = Some(entry_id);
        self
    }

    pub fn job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// claim が刻んだ時刻
    pub fn fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = Some(fetched_at);
        self
    }

    /// claim 結果から ids / queue / fetched_at をまとめて取る
    pub fn claimed(self, claimed: ClaimedEntry) -> Self {
        self.entry_id(claimed.entry_id)
            .job_id(claimed.job_id)
            .fetched_at(claimed.fetched_at)
            .queue(claimed.queue)
    }

    pub fn build(self) -> Result<FetchLease, LeaseError> {
        let store = self
            .store
            .ok_or_else(|| missing("store"))?;
        let notifications = self
            .notifications
            .ok_or_else(|| missing("notification channel"))?;
        let entry_id = self.entry_id.ok_or_else(|| missing("entry id"))?;
        let job_id = self.job_id.ok_or_else(|| missing("job id"))?;
        let fetched_at = self.fetched_at.ok_or_else(|| missing("claim time"))?;
        let queue = QueueName::new(self.queue.ok_or_else(|| missing("queue name"))?)?;

        Ok(FetchLease::from_parts(
            store,
            notifications,
            entry_id,
            job_id,
            queue,
            fetched_at,
        ))
    }
}

fn missing(what: &str) -> LeaseError {
    LeaseError::InvalidArgument(format!("{what} is required to build a fetch lease"))
}
