//! Lease - fetch lease と Ack/Nack プロトコル
//!
//! - **FetchLease**: claim したエントリ 1 件の所有権
//! - **FetchLeaseBuilder**: 部品から lease を組み立てる（build 時に検証）

mod builder;
mod fetch_lease;

pub use builder::FetchLeaseBuilder;
pub use fetch_lease::FetchLease;
