//! HTTP surface of the backfill runner.

pub mod app;
