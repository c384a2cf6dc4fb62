//! Notification - 待機ワーカーを起こすためのベストエフォートな記録

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreError;
use super::queue_name::QueueName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// キューに見えるエントリが 1 件以上できた
    JobEnqueued,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::JobEnqueued => "job_enqueued",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job_enqueued" => Ok(NotificationKind::JobEnqueued),
            other => Err(StoreError::Corrupt(format!(
                "unknown notification kind '{other}'"
            ))),
        }
    }
}

/// キュー単位の起床記録。届かなくても正しさには影響しない
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub queue: QueueName,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn job_enqueued(queue: QueueName, created_at: DateTime<Utc>) -> Self {
        Self {
            queue,
            kind: NotificationKind::JobEnqueued,
            created_at,
        }
    }
}
