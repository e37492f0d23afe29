use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Artifact, FailureKind, TargetMetadata};

/// Failure of one upload attempt, already classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
	/// Network trouble, rate limiting, a temporarily unavailable remote.
	#[error("transient transfer failure: {0}")]
	Transient(String),

	/// Waiting will not help: malformed artifact, rejected content, bad credentials.
	#[error("permanent transfer failure: {0}")]
	Permanent(String),
}

impl TransferError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, TransferError::Transient(_))
	}

	pub fn kind(&self) -> FailureKind {
		match self {
			TransferError::Transient(_) => FailureKind::Transient,
			TransferError::Permanent(_) => FailureKind::Permanent,
		}
	}

	pub fn message(&self) -> &str {
		match self {
			TransferError::Transient(m) | TransferError::Permanent(m) => m,
		}
	}
}

/// Moves one artifact's bytes to the remote store.
///
/// Called from up to `concurrency` tasks at once. Implementations own any
/// timeout policy; the scheduler waits for every call to return.
#[async_trait]
pub trait Transport: Send + Sync {
	/// Upload the artifact and return the identifier the remote assigned to it.
	async fn send(&self, artifact: &Artifact, target: &TargetMetadata) -> Result<String, TransferError>;

	/// Name used in logs
	fn name(&self) -> &str;
}
