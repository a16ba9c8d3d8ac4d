//! Infrastructure layer of the backfill runner: storage backends, pacing,
//! work executors, job execution and process configuration.

pub mod config;
pub mod executors;
pub mod jobs;
pub mod rate_limiter;
pub mod storage;

#[cfg(test)]
mod integration_tests;
