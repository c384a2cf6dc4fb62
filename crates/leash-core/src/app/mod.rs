//! App - アプリケーション層
//!
//! ports を組み合わせて、実際に動くワーカーにします。
//!
//! - **FetcherOptions**: ポーリング間隔と invisibility timeout
//! - **JobFetcher**: claim → `FetchLease`。アイドル時は通知を待つ
//! - **WorkerGroup**: fetch lease の下で `JobHandler` を回す N 本のワーカー

pub mod config;
pub mod fetcher;
pub mod worker_loop;

pub use self::config::FetcherOptions;
pub use self::fetcher::JobFetcher;
pub use self::worker_loop::{HandlerError, JobHandler, LeasedJob, WorkerGroup};
