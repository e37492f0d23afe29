mod artifact;
mod job;

pub use artifact::{Artifact, ArtifactId, TargetMetadata};
pub use job::{FailureKind, FailureOutcome, InvalidTransition, JobId, JobStatus, RetryPolicy, TransferJob};
