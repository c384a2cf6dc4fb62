//! FetchLease - 取得したキューエントリの所有権と Ack/Nack プロトコル
//!
//! # 状態遷移
//! - `Leased -> Acked`: `ack()` でエントリを削除（ジョブ消化）
//! - `Leased -> Nacked`: `nack()` で lease を解放し、通知を 1 件記録
//!
//! Acked / Nacked は終端で、互いに排他です。
//!
//! # 暗黙の finalize
//! 所有者がどちらも決めないままスコープを抜けた場合、lease 自身がエントリを
//! キューに戻します（Nack と同じ効果）。
//! - `finalize()` / `run()`: 通常経路での決定的な後始末
//! - `Drop`: それ以外の経路（`?` による早期 return、panic、タスクの abort）
//!
//! Drop では await できないので、現在の tokio ランタイムに requeue を spawn します。
//! ランタイムが無い場合は `error!` を出してエントリは leased のまま残ります
//! （invisibility timeout による再取得に任せる）。
//!
//! # 解放の照合
//! `release_lease` は claim 時の `fetched_at` と一致するときだけ効きます。
//! 一度キューに戻したエントリを別ワーカーが取り直した後に、古い lease から
//! 二度目の解放が届いても、その別ワーカーの lease は壊れません。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, trace, warn};

use crate::domain::{
    ClaimedEntry, EntryId, JobId, LeaseError, LeaseOp, LeaseState, QueueName, StoreError,
};
use crate::ports::{NotificationChannel, QueueStore};

use super::builder::FetchLeaseBuilder;

/// claim したワーカーが単独で所有する、キューエントリ 1 件分の lease。
///
/// ```ignore
/// let Some(lease) = fetcher.try_fetch(&queues).await? else { return Ok(()) };
/// lease
///     .run(async |lease| {
///         if process(lease.job_id()).await.is_ok() {
///             lease.ack().await?;
///         }
///         Ok::<_, LeaseError>(())
///     })
///     .await?;
/// ```
pub struct FetchLease {
    entry_id: EntryId,
    job_id: JobId,
    queue: QueueName,
    fetched_at: DateTime<Utc>,
    store: Arc<dyn QueueStore>,
    notifications: Arc<dyn NotificationChannel>,
    state: LeaseState,
}

impl FetchLease {
    pub fn new(
        store: Arc<dyn QueueStore>,
        notifications: Arc<dyn NotificationChannel>,
        claimed: ClaimedEntry,
    ) -> Self {
        Self::from_parts(
            store,
            notifications,
            claimed.entry_id,
            claimed.job_id,
            claimed.queue,
            claimed.fetched_at,
        )
    }

    pub(super) fn from_parts(
        store: Arc<dyn QueueStore>,
        notifications: Arc<dyn NotificationChannel>,
        entry_id: EntryId,
        job_id: JobId,
        queue: QueueName,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id,
            job_id,
            queue,
            fetched_at,
            store,
            notifications,
            state: LeaseState::Leased,
        }
    }

    pub fn builder() -> FetchLeaseBuilder {
        FetchLeaseBuilder::new()
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// claim 時に刻まれた `fetched_at`
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// ジョブを消化済みにする（エントリ削除）。
    ///
    /// 再度の `ack` は delete を発行し直すだけ（0 件一致でエラーにならない）。
    /// store 障害時は状態を変えずに `StorageUnavailable` を返すので、再試行できる。
    pub async fn ack(&mut self) -> Result<(), LeaseError> {
        if self.state == LeaseState::Nacked {
            warn!(
                entry_id = %self.entry_id,
                job_id = %self.job_id,
                queue = %self.queue,
                "ack after nack ignored; entry is back in the queue"
            );
            return Ok(());
        }

        self.store
            .delete(self.entry_id)
            .await
            .map_err(|source| LeaseError::StorageUnavailable {
                op: LeaseOp::Ack,
                source,
            })?;

        trace!(job_id = %self.job_id, queue = %self.queue, "removed job from queue");
        self.state = LeaseState::Acked;
        Ok(())
    }

    /// ジョブを手放す（lease 解放 + 待機中ワーカーへの通知）。
    ///
    /// 解放の失敗はエラーとして返し、状態は変えない。通知の失敗はログのみ
    /// （エントリはすでに見える状態に戻っている）。
    /// Nacked 後の `nack` は何もしない。エントリは他のワーカーが取り直して
    /// いるかもしれず、通知も 1 件で足りる。
    pub async fn nack(&mut self) -> Result<(), LeaseError> {
        match self.state {
            LeaseState::Acked => {
                warn!(
                    entry_id = %self.entry_id,
                    job_id = %self.job_id,
                    queue = %self.queue,
                    "nack after ack ignored; entry was already deleted"
                );
                return Ok(());
            }
            LeaseState::Nacked => {
                trace!(job_id = %self.job_id, queue = %self.queue, "already requeued");
                return Ok(());
            }
            LeaseState::Leased => {}
        }

        requeue(
            self.store.as_ref(),
            self.notifications.as_ref(),
            self.entry_id,
            self.fetched_at,
            &self.queue,
        )
        .await
        .map_err(|source| LeaseError::StorageUnavailable {
            op: LeaseOp::Nack,
            source,
        })?;

        trace!(job_id = %self.job_id, queue = %self.queue, "requeued job");
        self.state = LeaseState::Nacked;
        Ok(())
    }

    /// lease を閉じる。終端アクションが未実行なら Nack と同じ効果を 1 回だけ行う。
    ///
    /// 後始末の経路なので store 障害はログに出して握りつぶす
    /// （スコープを抜ける本来の理由を上書きしない）。
    pub async fn finalize(mut self) {
        if self.state.is_terminal() {
            return;
        }

        debug!(
            entry_id = %self.entry_id,
            job_id = %self.job_id,
            queue = %self.queue,
            "lease finalized without ack or nack; requeueing"
        );
        // 状態は試行の後に変える。finalize 自体が途中で drop されたら Drop が拾う
        if let Err(e) = requeue(
            self.store.as_ref(),
            self.notifications.as_ref(),
            self.entry_id,
            self.fetched_at,
            &self.queue,
        )
        .await
        {
            warn!(
                entry_id = %self.entry_id,
                job_id = %self.job_id,
                queue = %self.queue,
                error = %e,
                "requeue on finalize failed; entry stays leased until reclaimed"
            );
        }
        self.state = LeaseState::Nacked;
    }

    /// `f` に lease を貸し、戻ったら finalize する。
    ///
    /// `f` の中で明示的に ack / nack してよい。決めずに戻れば nack される。
    /// `f` が panic した場合や、返した future が drop された場合は `Drop` が引き継ぐ。
    pub async fn run<F, T>(mut self, f: F) -> T
    where
        F: AsyncFnOnce(&mut FetchLease) -> T,
    {
        let out = f(&mut self).await;
        self.finalize().await;
        out
    }
}

impl std::fmt::Debug for FetchLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchLease")
            .field("entry_id", &self.entry_id)
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("fetched_at", &self.fetched_at)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for FetchLease {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = LeaseState::Nacked;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(
                entry_id = %self.entry_id,
                job_id = %self.job_id,
                queue = %self.queue,
                "lease dropped outside a tokio runtime; entry stays leased until reclaimed"
            );
            return;
        };

        debug!(
            entry_id = %self.entry_id,
            job_id = %self.job_id,
            queue = %self.queue,
            "lease dropped without ack or nack; requeueing"
        );
        let store = Arc::clone(&self.store);
        let notifications = Arc::clone(&self.notifications);
        let entry_id = self.entry_id;
        let job_id = self.job_id;
        let fetched_at = self.fetched_at;
        let queue = self.queue.clone();
        let _ = handle.spawn(async move {
            if let Err(e) = requeue(
                store.as_ref(),
                notifications.as_ref(),
                entry_id,
                fetched_at,
                &queue,
            )
            .await
            {
                warn!(
                    %entry_id,
                    %job_id,
                    %queue,
                    error = %e,
                    "requeue on drop failed; entry stays leased until reclaimed"
                );
            }
        });
    }
}

/// Nack の効果: 解放してから通知。呼び出しを失敗させるのは解放だけ。
async fn requeue(
    store: &dyn QueueStore,
    notifications: &dyn NotificationChannel,
    entry_id: EntryId,
    fetched_at: DateTime<Utc>,
    queue: &QueueName,
) -> Result<(), StoreError> {
    store.release_lease(entry_id, fetched_at).await?;
    if let Err(e) = notifications.notify(queue).await {
        warn!(%entry_id, %queue, error = %e, "entry released but notification failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use chrono::TimeZone;

    use crate::domain::ErrorKind;
    use crate::impls::{InMemoryNotificationChannel, InMemoryQueueStore};
    use crate::ports::FixedClock;
    use crate::testing::{FlakyNotifications, RecordingStore, eventually};

    struct Fixture {
        store: Arc<RecordingStore>,
        notifications: Arc<InMemoryNotificationChannel>,
        queue: QueueName,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(RecordingStore::new(InMemoryQueueStore::new())),
                notifications: Arc::new(InMemoryNotificationChannel::new()),
                queue: QueueName::default_queue(),
            }
        }

        async fn enqueue_and_claim(&self) -> FetchLease {
            self.store
                .enqueue(&self.queue, JobId::generate())
                .await
                .unwrap();
            let claimed = self.store.claim(&self.queue).await.unwrap().unwrap();
            FetchLease::new(self.store.clone(), self.notifications.clone(), claimed)
        }

        async fn notification_count(&self) -> usize {
            self.notifications.count_for(&self.queue).await
        }
    }

    #[tokio::test]
    async fn ack_deletes_entry() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();
        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_some());

        lease.ack().await.unwrap();

        assert_eq!(lease.state(), LeaseState::Acked);
        assert!(fx.store.get(entry_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_ack_is_a_noop() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;

        lease.ack().await.unwrap();
        lease.ack().await.unwrap();

        assert_eq!(lease.state(), LeaseState::Acked);
        assert_eq!(fx.store.deletes(), 2);
    }

    #[tokio::test]
    async fn nack_releases_entry_and_notifies_once() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        lease.nack().await.unwrap();

        let entry = fx.store.get(entry_id).await.unwrap().unwrap();
        assert_eq!(entry.entry_id, entry_id);
        assert!(entry.fetched_at.is_none());
        assert_eq!(lease.state(), LeaseState::Nacked);
        assert_eq!(fx.notification_count().await, 1);
    }

    #[tokio::test]
    async fn nacked_entry_can_be_claimed_again_with_same_id() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();
        lease.nack().await.unwrap();

        let reclaimed = fx.store.claim(&fx.queue).await.unwrap().unwrap();
        assert_eq!(reclaimed.entry_id, entry_id);
    }

    #[tokio::test]
    async fn finalize_without_decision_requeues_once() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        lease.finalize().await;

        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_none());
        assert_eq!(fx.store.releases(), 1);
        assert_eq!(fx.notification_count().await, 1);

        // nothing trails behind on the runtime
        tokio::task::yield_now().await;
        assert_eq!(fx.store.releases(), 1);
        assert_eq!(fx.notification_count().await, 1);
    }

    #[tokio::test]
    async fn ack_then_scope_exit_mutates_nothing_more() {
        let fx = Fixture::new();
        {
            let mut lease = fx.enqueue_and_claim().await;
            lease.ack().await.unwrap();
        }
        tokio::task::yield_now().await;

        assert_eq!(fx.store.deletes(), 1);
        assert_eq!(fx.store.releases(), 0);
        assert_eq!(fx.notification_count().await, 0);
    }

    #[tokio::test]
    async fn nack_then_finalize_records_no_second_notification() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;
        lease.nack().await.unwrap();
        lease.finalize().await;
        tokio::task::yield_now().await;

        assert_eq!(fx.store.releases(), 1);
        assert_eq!(fx.notification_count().await, 1);
    }

    #[tokio::test]
    async fn dropped_lease_is_requeued_exactly_once() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        drop(lease);

        eventually(async || fx.store.releases() == 1).await;
        let entry = fx.store.get(entry_id).await.unwrap().unwrap();
        assert!(entry.fetched_at.is_none());
        eventually(async || fx.notification_count().await == 1).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.store.releases(), 1);
        assert_eq!(fx.notification_count().await, 1);
    }

    #[tokio::test]
    async fn early_return_from_scope_requeues() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        async fn process(lease: FetchLease) -> Result<u32, String> {
            let _lease = lease;
            let attempts: u32 = "not a number"
                .parse()
                .map_err(|e: std::num::ParseIntError| e.to_string())?;
            Ok(attempts)
        }
        assert!(process(lease).await.is_err());

        eventually(async || {
            fx.store
                .get(entry_id)
                .await
                .unwrap()
                .is_some_and(|e| e.fetched_at.is_none())
        })
        .await;
        assert_eq!(fx.store.deletes(), 0);
    }

    #[tokio::test]
    async fn panicking_task_requeues_its_lease() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;

        let joined = tokio::spawn(async move {
            let _lease = lease;
            panic!("job exploded");
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        eventually(async || fx.store.releases() == 1).await;
        eventually(async || fx.notification_count().await == 1).await;
    }

    #[tokio::test]
    async fn aborted_task_requeues_its_lease() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;

        let task = tokio::spawn(async move {
            let _lease = lease;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        eventually(async || fx.store.releases() == 1).await;
    }

    #[tokio::test]
    async fn run_finalizes_when_closure_leaves_lease_open() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        let seen = lease.run(async |lease| lease.job_id()).await;

        assert!(seen.to_string().starts_with("job-"));
        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_none());
        assert_eq!(fx.notification_count().await, 1);
    }

    #[tokio::test]
    async fn run_keeps_explicit_ack() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        lease
            .run(async |lease| lease.ack().await)
            .await
            .unwrap();
        tokio::task::yield_now().await;

        assert!(fx.store.get(entry_id).await.unwrap().is_none());
        assert_eq!(fx.store.releases(), 0);
        assert_eq!(fx.notification_count().await, 0);
    }

    #[tokio::test]
    async fn failed_ack_keeps_lease_open_and_can_be_retried() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        fx.store.fail_next(1);
        let err = lease.ack().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(matches!(
            err,
            LeaseError::StorageUnavailable {
                op: LeaseOp::Ack,
                ..
            }
        ));
        assert_eq!(lease.state(), LeaseState::Leased);
        assert!(fx.store.get(entry_id).await.unwrap().is_some());

        lease.ack().await.unwrap();
        assert_eq!(lease.state(), LeaseState::Acked);
        assert!(fx.store.get(entry_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_ack_then_scope_exit_still_requeues() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        fx.store.fail_next(1);
        assert!(lease.ack().await.is_err());
        lease.finalize().await;

        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_none());
    }

    #[tokio::test]
    async fn failed_nack_reports_storage_unavailable() {
        let fx = Fixture::new();
        let mut lease = fx.enqueue_and_claim().await;

        fx.store.fail_next(1);
        let err = lease.nack().await.unwrap_err();

        assert!(matches!(
            err,
            LeaseError::StorageUnavailable {
                op: LeaseOp::Nack,
                ..
            }
        ));
        assert_eq!(lease.state(), LeaseState::Leased);
        assert_eq!(fx.notification_count().await, 0);
    }

    #[tokio::test]
    async fn finalize_swallows_store_failure() {
        let fx = Fixture::new();
        let lease = fx.enqueue_and_claim().await;
        let entry_id = lease.entry_id();

        fx.store.fail_next(1);
        lease.finalize().await;
        tokio::task::yield_now().await;

        // one failed attempt, no second try from Drop
        assert_eq!(fx.store.releases(), 1);
        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_some());
        assert_eq!(fx.notification_count().await, 0);
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_nack() {
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = QueueName::default_queue();
        store.enqueue(&queue, JobId::generate()).await.unwrap();
        let claimed = store.claim(&queue).await.unwrap().unwrap();
        let entry_id = claimed.entry_id;
        let mut lease = FetchLease::new(store.clone(), Arc::new(FlakyNotifications), claimed);

        lease.nack().await.unwrap();

        assert_eq!(lease.state(), LeaseState::Nacked);
        assert!(store.get(entry_id).await.unwrap().unwrap().fetched_at.is_none());
    }

    #[tokio::test]
    async fn cross_actions_after_terminal_state_touch_nothing() {
        let fx = Fixture::new();
        let mut acked = fx.enqueue_and_claim().await;
        acked.ack().await.unwrap();
        acked.nack().await.unwrap();
        assert_eq!(acked.state(), LeaseState::Acked);
        assert_eq!(fx.store.releases(), 0);

        let mut nacked = fx.enqueue_and_claim().await;
        let entry_id = nacked.entry_id();
        nacked.nack().await.unwrap();
        nacked.ack().await.unwrap();
        assert_eq!(nacked.state(), LeaseState::Nacked);
        assert!(fx.store.get(entry_id).await.unwrap().is_some());
        assert_eq!(fx.store.deletes(), 1);
    }

    #[tokio::test]
    async fn repeated_nack_leaves_next_owner_alone() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(RecordingStore::new(InMemoryQueueStore::with_clock(
            clock.clone(),
        )));
        let notifications = Arc::new(InMemoryNotificationChannel::new());
        let queue = QueueName::default_queue();
        store.enqueue(&queue, JobId::generate()).await.unwrap();

        let claimed = store.claim(&queue).await.unwrap().unwrap();
        let mut first = FetchLease::new(store.clone(), notifications.clone(), claimed);
        first.nack().await.unwrap();

        clock.advance(Duration::from_secs(1));
        let claimed = store.claim(&queue).await.unwrap().unwrap();
        let second = FetchLease::new(store.clone(), notifications.clone(), claimed);
        assert_eq!(second.entry_id(), first.entry_id());

        first.nack().await.unwrap();
        drop(first);
        tokio::task::yield_now().await;

        let entry = store.get(second.entry_id()).await.unwrap().unwrap();
        assert_eq!(entry.fetched_at, Some(second.fetched_at()));
        assert!(store.claim(&queue).await.unwrap().is_none());
        assert_eq!(store.releases(), 1);
        assert_eq!(notifications.count_for(&queue).await, 1);
        second.finalize().await;
    }

    // Scenario A
    #[tokio::test]
    async fn claim_then_ack_removes_entry_from_default_queue() {
        let fx = Fixture::new();
        let job_id = JobId::generate();
        let entry_id = fx.store.enqueue(&fx.queue, job_id).await.unwrap();
        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_none());

        let claimed = fx.store.claim(&fx.queue).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_some());

        let mut lease = FetchLease::new(fx.store.clone(), fx.notifications.clone(), claimed);
        lease.ack().await.unwrap();

        assert!(fx.store.get(entry_id).await.unwrap().is_none());
    }

    // Scenario B
    #[tokio::test]
    async fn scope_end_without_decision_returns_entry_to_default_queue() {
        let fx = Fixture::new();
        let entry_id = {
            let lease = fx.enqueue_and_claim().await;
            assert!(fx.store.get(lease.entry_id()).await.unwrap().unwrap().fetched_at.is_some());
            lease.entry_id()
        };

        eventually(async || fx.notification_count().await == 1).await;
        assert!(fx.store.get(entry_id).await.unwrap().unwrap().fetched_at.is_none());
    }
}
