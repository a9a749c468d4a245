//! Concurrent package fetching: the fetch contract, per-item state tracking,
//! the bounded worker pool, run lifecycle, caller-side retry wrappers, and the
//! aggregated run result.

pub mod fetch;
pub mod lifecycle;
pub mod result;
pub mod retry;
pub mod runner;
pub mod state;
pub mod worker_pool;
