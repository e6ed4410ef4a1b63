//! Persistent job queue over the relational store.
//!
//! Replica-safe by construction: skip-locked reservation, expiring leases,
//! a partial unique index on fire keys, and best-effort wakeup
//! notifications on top of timer polling.

pub mod job;
pub mod job_result;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod worker;

pub use job::{metadata, Job, JobStates, JobStats, JobStatus, JobType, ListJobsOptions};
pub use job_result::JobResult;
pub use queue::{EnqueueResult, JobRepo, PostgresJobRepo};
pub use reaper::{Reaper, SweepStats};
pub use registry::{JobHandler, JobRegistry};
pub use worker::{JobWorker, JobWorkerConfig};
