//! Errors - エラー型
//!
//! - **StoreError**: アダプタ（QueueStore / NotificationChannel）の失敗
//! - **LeaseError**: lease 操作の失敗。`kind()` で運用上の分類を返す

use std::fmt;

use thiserror::Error;

/// アダプタが報告する失敗
#[derive(Debug, Error)]
pub enum StoreError {
    /// バックエンドが操作を完了できなかった（接続、ロック、I/O）
    #[error("store backend error: {0}")]
    Backend(String),

    /// 永続化されたレコードを復元できなかった
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// 失敗した store 操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOp {
    Claim,
    Ack,
    Nack,
}

impl fmt::Display for LeaseOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseOp::Claim => f.write_str("claim"),
            LeaseOp::Ack => f.write_str("ack"),
            LeaseOp::Nack => f.write_str("nack"),
        }
    }
}

/// `LeaseError` の運用上の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StorageUnavailable,
    InvalidArgument,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    /// claim または明示的な Ack/Nack 中に store が失敗した。
    /// lease の状態は変わらないので、同じ呼び出しを再試行できる。
    #[error("storage unavailable during {op}: {source}")]
    StorageUnavailable {
        op: LeaseOp,
        #[source]
        source: StoreError,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LeaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeaseError::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            LeaseError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageUnavailable
    }
}
