//! Backfill job execution: creation, the per-job unit loop, startup recovery,
//! retention and the orchestrator façade.
//!
//! ## Components
//!
//! - `JobManager`: creates jobs under the single-active-job rule and runs each
//!   job's unit loop on a background worker
//! - `RecoveryManager`: resumes or fails jobs left non-terminal by a crash
//! - `retention`: periodic removal of old terminal jobs
//! - `BackfillOrchestrator`: the entry point used by the API layer

pub mod error;
pub mod manager;
pub mod orchestrator;
pub mod recovery;
pub mod retention;

pub use error::{BackfillError, BackfillResult};
pub use manager::{JobManager, JobManagerConfig, SUPERSEDED_REASON};
pub use orchestrator::{
    BackfillOrchestrator, CreatedJob, JobPreview, RetentionPolicy, estimate_duration,
};
pub use recovery::{DUPLICATE_REASON, RecoveryManager, RecoveryReport};
pub use retention::{spawn_retention_sweep, sweep_once};
