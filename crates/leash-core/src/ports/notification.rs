//! NotificationChannel port - 待機ワーカーへのベストエフォートな通知
//!
//! キューの正しさは store の `fetched_at` だけで決まります。
//! 通知が失われても遅延が増えるだけ（fetcher はポーリングに戻る）で、ジョブは失われません。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{QueueName, StoreError};

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// `queue` に見えるエントリがあることを記録する
    async fn notify(&self, queue: &QueueName) -> Result<(), StoreError>;

    /// `queues` のいずれかへの通知を最大 `timeout` 待つ。
    ///
    /// 通知で起きたら `true`。spurious wake は許容する。
    /// デフォルト実装は早起きしない（fetcher は単なるポーリングになる）。
    async fn wait(&self, queues: &[QueueName], timeout: Duration) -> bool {
        let _ = queues;
        tokio::time::sleep(timeout).await;
        false
    }
}
