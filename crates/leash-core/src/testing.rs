//! テスト用ダブル（複数モジュールのテストで共有）

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ClaimedEntry, EntryId, JobId, QueueCounts, QueueEntry, QueueName, StoreError};
use crate::ports::{NotificationChannel, QueueStore};

/// store を包み、更新系の呼び出しを数え、指定した回数だけ失敗させる。
///
/// `deletes()` / `releases()` は失敗した試行も含めて数える。
pub struct RecordingStore {
    inner: Box<dyn QueueStore>,
    deletes: AtomicUsize,
    releases: AtomicUsize,
    failing_mutations: AtomicUsize,
    failing_claims: AtomicUsize,
}

impl RecordingStore {
    pub fn new(inner: impl QueueStore + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            deletes: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            failing_mutations: AtomicUsize::new(0),
            failing_claims: AtomicUsize::new(0),
        }
    }

    /// 次の `n` 回の delete / release を失敗させる
    pub fn fail_next(&self, n: usize) {
        self.failing_mutations.store(n, Ordering::SeqCst);
    }

    /// 次の `n` 回の claim を失敗させる
    pub fn fail_next_claims(&self, n: usize) {
        self.failing_claims.store(n, Ordering::SeqCst);
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected(op: &str) -> StoreError {
    StoreError::Backend(format!("injected {op} failure"))
}

#[async_trait]
impl QueueStore for RecordingStore {
    async fn enqueue(&self, queue: &QueueName, job_id: JobId) -> Result<EntryId, StoreError> {
        self.inner.enqueue(queue, job_id).await
    }

    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedEntry>, StoreError> {
        if take_failure(&self.failing_claims) {
            return Err(injected("claim"));
        }
        self.inner.claim(queue).await
    }

    async fn delete(&self, entry_id: EntryId) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_mutations) {
            return Err(injected("delete"));
        }
        self.inner.delete(entry_id).await
    }

    async fn release_lease(
        &self,
        entry_id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_mutations) {
            return Err(injected("release"));
        }
        self.inner.release_lease(entry_id, fetched_at).await
    }

    async fn get(&self, entry_id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.get(entry_id).await
    }

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, StoreError> {
        self.inner.counts(queue).await
    }
}

/// `notify` が常に失敗する NotificationChannel
pub struct FlakyNotifications;

#[async_trait]
impl NotificationChannel for FlakyNotifications {
    async fn notify(&self, _queue: &QueueName) -> Result<(), StoreError> {
        Err(StoreError::Backend("notification channel down".to_string()))
    }
}

/// `check` が真になるまでポーリングする。2 秒で panic
pub async fn eventually(mut check: impl AsyncFnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
