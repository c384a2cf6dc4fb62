//! Config - fetcher の設定

use std::time::Duration;

use serde::Deserialize;

/// `JobFetcher` と claim 元の store の調整項目。
///
/// serde で読み込み、欠けたフィールドはデフォルト値になる。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetcherOptions {
    /// 待機中の fetcher が次のポーリングまで通知を待つ最長時間
    pub poll_interval_ms: u64,
    /// これより古い lease は再 claim 可能になる。
    /// `None` なら ack / nack されるまで見えないまま
    pub invisibility_timeout_secs: Option<u64>,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            invisibility_timeout_secs: None,
        }
    }
}

impl FetcherOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn invisibility_timeout(&self) -> Option<Duration> {
        self.invisibility_timeout_secs.map(Duration::from_secs)
    }
}
