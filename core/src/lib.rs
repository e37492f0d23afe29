//! Background upload coordination: a durable, prioritized queue of transfer
//! jobs with bounded concurrency, retry with backoff, and progress callbacks.

pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod store;

pub use config::{ConfigError, CourierConfig, SchedulerConfig};
pub use engine::{
	DirectoryTransport, ProgressEvent, ProgressHub, ProgressStatus, QueueStats, Scheduler, SchedulerError, Subscription,
	TransferError, Transport,
};
pub use models::{Artifact, ArtifactId, JobId, JobStatus, TargetMetadata, TransferJob};
pub use store::{JobRecord, JobStore, StoreError, SurrealJobStore};
