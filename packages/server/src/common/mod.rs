// Common types and utilities shared across the application

pub mod hash;
pub mod id;

pub use id::{
    AlertId, EventId, Id, JobId, RuleId, ScheduledTaskId, SecretId, SinkId, SiteId, SourceId,
};
