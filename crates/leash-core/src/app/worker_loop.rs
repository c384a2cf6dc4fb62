//! WorkerGroup - fetch lease でキューを処理する N 本のワーカー
//!
//! # フロー
//! 1. JobFetcher::fetch() で lease 取得
//! 2. JobHandler を子タスクで実行
//! 3. 成功なら ack、失敗なら nack
//! 4. 最後に必ず finalize（panic や ack 失敗でもジョブはキューに戻る）
//!
//! handler を子タスクで動かすので、panic は `JoinError` として返り、
//! lease ごと巻き戻されることはありません。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, warn};

use crate::app::fetcher::JobFetcher;
use crate::domain::{EntryId, JobId, LeaseError, QueueName};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// handler に渡す lease 済みエントリの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    pub entry_id: EntryId,
    pub job_id: JobId,
    pub queue: QueueName,
}

/// ジョブを 1 件処理する。`Ok` なら ack、`Err`（または panic）ならキューに戻す。
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: LeasedJob) -> Result<(), HandlerError>;
}

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーが新しい lease を取らなくなる
/// - `shutdown_and_join()` は実行中のジョブの終了まで待つ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// 現在のランタイムに `n` 本のワーカーを spawn する
    pub fn spawn(
        n: usize,
        fetcher: JobFetcher,
        queues: Vec<QueueName>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, LeaseError> {
        if queues.is_empty() {
            return Err(LeaseError::InvalidArgument(
                "a worker group needs at least one queue".to_string(),
            ));
        }
        let queues: Arc<[QueueName]> = queues.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|worker_id| {
                let fetcher = fetcher.clone();
                let queues = Arc::clone(&queues);
                let handler = Arc::clone(&handler);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(worker_loop(worker_id, fetcher, queues, handler, shutdown_rx))
            })
            .collect();

        Ok(Self { shutdown_tx, joins })
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// 新しい lease を取らなくする。実行中の handler は最後まで走る
    pub fn request_shutdown(&self) {
        // receiver がすでに drop されていても無視
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    fetcher: JobFetcher,
    queues: Arc<[QueueName]>,
    handler: Arc<dyn JobHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let mut lease = match fetcher.fetch(&queues, &mut shutdown_rx).await {
            Ok(Some(lease)) => lease,
            Ok(None) => break,
            Err(e) => {
                error!(worker_id, error = %e, "worker cannot fetch; stopping");
                break;
            }
        };

        let job = LeasedJob {
            entry_id: lease.entry_id(),
            job_id: lease.job_id(),
            queue: lease.queue().clone(),
        };
        // ワーカー自身が abort されたら handler も止める。lease の Drop が
        // requeue するので、走り続けると同じジョブが二重に処理される
        let outcome = AbortOnDropHandle::new(tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle(job).await }
        }))
        .await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = lease.ack().await {
                    warn!(worker_id, job_id = %lease.job_id(), error = %e, "ack failed; job will be requeued");
                }
            }
            Ok(Err(e)) => {
                info!(worker_id, job_id = %lease.job_id(), error = %e, "job failed; requeueing");
                if let Err(e) = lease.nack().await {
                    warn!(worker_id, job_id = %lease.job_id(), error = %e, "nack failed");
                }
            }
            Err(e) => {
                error!(worker_id, job_id = %lease.job_id(), error = %e, "job handler panicked; requeueing");
            }
        }

        lease.finalize().await;
    }
}
