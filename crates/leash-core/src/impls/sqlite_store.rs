//! SqliteQueueStore - SQLite による QueueStore / NotificationChannel
//!
//! # テーブル
//! - `job_queue`: キューエントリ
//! - `notifications`: 起床記録
//!
//! 時刻は unix ミリ秒で保存し、可視性の判定を SQL 内の整数比較にしています。
//!
//! # claim
//! 1 本の `UPDATE … RETURNING` で行います。`WHERE` に可視性の条件を重ねて書くので、
//! 書き込みの時点でまだ claim 可能な行だけに時刻が刻まれます。
//! 同じ行を取り合った 2 つのワーカーが両方とも受け取ることはありません。
//! ロック競合（SQLITE_BUSY）は `StoreError::Backend` として返ります。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{
    ClaimedEntry, EntryId, JobId, Notification, NotificationKind, QueueCounts, QueueEntry,
    QueueName, StoreError,
};
use crate::ports::{Clock, IdGenerator, NotificationChannel, QueueStore, SystemClock, UlidGenerator};

/// `wait` が notifications テーブルを読み直す間隔
const NOTIFICATION_POLL: Duration = Duration::from_millis(100);

pub struct SqliteQueueStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    invisibility_timeout: Option<Duration>,
}

impl SqliteQueueStore {
    /// 既存の pool を包み、テーブルが無ければ作る
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        init_schema(&pool).await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            pool,
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            invisibility_timeout: None,
        })
    }

    /// `url` のデータベースを開く（無ければ作る）。
    ///
    /// インメモリ DB は接続が生きている間しか存在しないので、
    /// 再利用されない接続 1 本だけの pool にする。
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Backend(format!("invalid database url '{url}': {e}")))?
            .create_if_missing(true);
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to open queue database: {e}")))?;
        Self::new(pool).await
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Box::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    /// `timeout` より古い lease を再 claim 可能にする
    pub fn with_invisibility_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `queue` の通知（古い順）
    pub async fn notifications(&self, queue: &QueueName) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            "SELECT queue, kind, created_at FROM notifications WHERE queue = ?1 ORDER BY id",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to list notifications: {e}")))?;

        rows.iter().map(parse_notification_row).collect()
    }

    /// `older_than` より前の通知を削除し、削除件数を返す
    pub async fn purge_notifications(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE created_at < ?1")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to purge notifications: {e}")))?;
        Ok(result.rows_affected())
    }

    /// これより古い刻印は期限切れ。lease が期限切れにならないなら `None`
    fn stale_before(&self, now: DateTime<Utc>) -> Option<i64> {
        let timeout = chrono::Duration::from_std(self.invisibility_timeout?).ok()?;
        Some((now - timeout).timestamp_millis())
    }

    async fn latest_notification_id(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(id), 0) FROM notifications")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to read notifications: {e}")))
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS job_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT NOT NULL UNIQUE,
            job_id TEXT NOT NULL,
            queue TEXT NOT NULL,
            fetched_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_job_queue_queue_fetched
            ON job_queue (queue, fetched_at)",
        "CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            kind TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
    ];
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to create queue schema: {e}")))?;
    }
    Ok(())
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("failed to read {name}: {e}")))
}

fn parse_entry_row(row: &SqliteRow) -> Result<QueueEntry, StoreError> {
    let entry_id: EntryId = column::<String>(row, "entry_id")?.parse()?;
    let job_id: JobId = column::<String>(row, "job_id")?.parse()?;
    let queue = QueueName::new(column::<String>(row, "queue")?)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let fetched_at = column::<Option<i64>>(row, "fetched_at")?
        .map(millis_to_datetime)
        .transpose()?;

    Ok(QueueEntry {
        entry_id,
        job_id,
        queue,
        fetched_at,
    })
}

fn parse_notification_row(row: &SqliteRow) -> Result<Notification, StoreError> {
    let queue = QueueName::new(column::<String>(row, "queue")?)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let kind: NotificationKind = column::<String>(row, "kind")?.parse()?;
    let created_at = millis_to_datetime(column::<i64>(row, "created_at")?)?;

    Ok(Notification {
        queue,
        kind,
        created_at,
    })
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, queue: &QueueName, job_id: JobId) -> Result<EntryId, StoreError> {
        let entry_id = self.ids.generate_entry_id();
        sqlx::query("INSERT INTO job_queue (entry_id, job_id, queue, fetched_at) VALUES (?1, ?2, ?3, NULL)")
            .bind(entry_id.to_string())
            .bind(job_id.to_string())
            .bind(queue.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to enqueue: {e}")))?;
        Ok(entry_id)
    }

    async fn claim(&self, queue: &QueueName) -> Result<Option<ClaimedEntry>, StoreError> {
        // 保存精度 (ミリ秒) に揃える。release_lease はこの値で照合する
        let now = millis_to_datetime(self.clock.now().timestamp_millis())?;
        let row = sqlx::query(
            "UPDATE job_queue SET fetched_at = ?1
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE queue = ?2 AND (fetched_at IS NULL OR fetched_at <= ?3)
                 ORDER BY id
                 LIMIT 1
             )
             AND (fetched_at IS NULL OR fetched_at <= ?3)
             RETURNING entry_id, job_id",
        )
        .bind(now.timestamp_millis())
        .bind(queue.as_str())
        .bind(self.stale_before(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to claim: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entry_id: EntryId = column::<String>(&row, "entry_id")?.parse()?;
        let job_id: JobId = column::<String>(&row, "job_id")?.parse()?;
        debug!(%entry_id, %job_id, %queue, "claimed entry");

        Ok(Some(ClaimedEntry {
            entry_id,
            job_id,
            queue: queue.clone(),
            fetched_at: now,
        }))
    }

    async fn delete(&self, entry_id: EntryId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue WHERE entry_id = ?1")
            .bind(entry_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to delete entry: {e}")))?;
        Ok(())
    }

    async fn release_lease(
        &self,
        entry_id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_queue SET fetched_at = NULL WHERE entry_id = ?1 AND fetched_at = ?2")
            .bind(entry_id.to_string())
            .bind(fetched_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to release lease: {e}")))?;
        Ok(())
    }

    async fn get(&self, entry_id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        sqlx::query("SELECT entry_id, job_id, queue, fetched_at FROM job_queue WHERE entry_id = ?1")
            .bind(entry_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to load entry: {e}")))?
            .map(|row| parse_entry_row(&row))
            .transpose()
    }

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, StoreError> {
        let (visible, leased): (i64, i64) = sqlx::query_as(
            "SELECT
                 COALESCE(SUM(CASE WHEN fetched_at IS NULL THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN fetched_at IS NULL THEN 0 ELSE 1 END), 0)
             FROM job_queue WHERE queue = ?1",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to count entries: {e}")))?;

        Ok(QueueCounts {
            visible: usize::try_from(visible).unwrap_or(0),
            leased: usize::try_from(leased).unwrap_or(0),
        })
    }
}

#[async_trait]
impl NotificationChannel for SqliteQueueStore {
    async fn notify(&self, queue: &QueueName) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO notifications (queue, kind, created_at) VALUES (?1, ?2, ?3)")
            .bind(queue.as_str())
            .bind(NotificationKind::JobEnqueued.as_str())
            .bind(self.clock.now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to record notification: {e}")))?;
        Ok(())
    }

    /// キューを問わず、新しい通知行があれば起きる
    async fn wait(&self, _queues: &[QueueName], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let start = match self.latest_notification_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "cannot watch notifications; sleeping instead");
                tokio::time::sleep_until(deadline).await;
                return false;
            }
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(remaining.min(NOTIFICATION_POLL)).await;
            match self.latest_notification_id().await {
                Ok(latest) if latest > start => return true,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to poll notifications"),
            }
        }
    }
}
