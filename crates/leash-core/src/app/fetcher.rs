//! JobFetcher - store の claim を fetch lease に変える
//!
//! # フロー
//! 1. `try_fetch`: キューを順に 1 周 claim する
//! 2. `fetch`: lease が取れるか shutdown されるまで `try_fetch` を繰り返す
//! 3. 取れなかった周回の間は NotificationChannel で待つ
//!    （enqueue / nack があればすぐ起きる、無ければ poll_interval で再試行）

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::app::config::FetcherOptions;
use crate::domain::{EntryId, JobId, LeaseError, LeaseOp, QueueName, StoreError};
use crate::lease::FetchLease;
use crate::ports::{NotificationChannel, QueueStore};

#[derive(Clone)]
pub struct JobFetcher {
    store: Arc<dyn QueueStore>,
    notifications: Arc<dyn NotificationChannel>,
    options: FetcherOptions,
}

impl JobFetcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        notifications: Arc<dyn NotificationChannel>,
        options: FetcherOptions,
    ) -> Self {
        Self {
            store,
            notifications,
            options,
        }
    }

    pub fn options(&self) -> &FetcherOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// 生産者側: エントリを追加し、待機中の fetcher を起こす。
    ///
    /// 失敗として返すのは追加だけ。通知が落ちても次のポーリングで拾われる。
    pub async fn enqueue(&self, queue: &QueueName, job_id: JobId) -> Result<EntryId, StoreError> {
        let entry_id = self.store.enqueue(queue, job_id).await?;
        if let Err(e) = self.notifications.notify(queue).await {
            warn!(%entry_id, %job_id, %queue, error = %e, "entry enqueued but notification failed");
        }
        Ok(entry_id)
    }

    /// `queues` を順に 1 周 claim する。最初に取れたキューが勝つ。
    pub async fn try_fetch(&self, queues: &[QueueName]) -> Result<Option<FetchLease>, LeaseError> {
        ensure_queues(queues)?;

        for queue in queues {
            let claimed = self
                .store
                .claim(queue)
                .await
                .map_err(|source| LeaseError::StorageUnavailable {
                    op: LeaseOp::Claim,
                    source,
                })?;
            if let Some(claimed) = claimed {
                return Ok(Some(FetchLease::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.notifications),
                    claimed,
                )));
            }
        }
        Ok(None)
    }

    /// `queues` のいずれかで lease が取れるまで待つ。
    ///
    /// `shutdown` が `true` になるか送信側が消えたら `Ok(None)`。
    /// claim の失敗はログに出し、poll_interval 後に再試行する。
    pub async fn fetch(
        &self,
        queues: &[QueueName],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<FetchLease>, LeaseError> {
        ensure_queues(queues)?;
        let poll_interval = self.options.poll_interval();

        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            match self.try_fetch(queues).await {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "claim failed; retrying after poll interval");
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                woke = self.notifications.wait(queues, poll_interval) => {
                    if woke {
                        debug!("woken by notification");
                    }
                }
            }
        }
    }
}

fn ensure_queues(queues: &[QueueName]) -> Result<(), LeaseError> {
    if queues.is_empty() {
        return Err(LeaseError::InvalidArgument(
            "at least one queue is required to fetch".to_string(),
        ));
    }
    Ok(())
}
