//! InMemoryNotificationChannel - 通知の記録と待機ワーカーの起床
//!
//! 単一プロセス向け（テスト・ローカル開発）。記録は検査用に保持し続けるので、
//! 長く動かすときは `purge` で古いものを捨てる
//! （`SqliteQueueStore::purge_notifications` と同じ役割）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{Notification, QueueName, StoreError};
use crate::ports::{Clock, NotificationChannel, SystemClock};

/// 通知を記録し、`tokio::sync::Notify` で待機側を起こす。
///
/// `notify_one` は待機者がいなくても permit を 1 つ残すので、
/// 空振りの claim と `wait` の間に来た通知も失われない。
pub struct InMemoryNotificationChannel {
    records: Mutex<Vec<Notification>>,
    wake: Notify,
    clock: Arc<dyn Clock>,
}

impl InMemoryNotificationChannel {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            wake: Notify::new(),
            clock,
        }
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.records.lock().await.clone()
    }

    pub async fn count_for(&self, queue: &QueueName) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|n| &n.queue == queue)
            .count()
    }

    /// `older_than` より前の通知を捨て、捨てた件数を返す。
    pub async fn purge(&self, older_than: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|n| n.created_at >= older_than);
        before - records.len()
    }
}

impl Default for InMemoryNotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for InMemoryNotificationChannel {
    async fn notify(&self, queue: &QueueName) -> Result<(), StoreError> {
        let notification = Notification::job_enqueued(queue.clone(), self.clock.now());
        self.records.lock().await.push(notification);
        self.wake.notify_one();
        Ok(())
    }

    async fn wait(&self, _queues: &[QueueName], timeout: Duration) -> bool {
        tokio::select! {
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}
