//! Durable mirror of the scheduler's jobs.
//!
//! The scheduler writes through [`JobStore`] before every state change becomes
//! visible, and reads it back once at start-up to rebuild its queue.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbHandle;
use crate::models::{Artifact, ArtifactId, FailureKind, JobId, JobStatus, TransferJob};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Db(String),

	#[error("failed to decode job record {job_id}: {reason}")]
	Decode { job_id: String, reason: String },

	#[error("store I/O error: {0}")]
	Io(#[from] std::io::Error),
}

/// What gets persisted per job: the lifecycle record plus the artifact needed
/// to send it again after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
	pub job: TransferJob,
	pub artifact: Artifact,
}

#[async_trait]
pub trait JobStore: Send + Sync {
	/// Insert or overwrite the record for `record.job.id`.
	async fn put(&self, record: &JobRecord) -> Result<(), StoreError>;

	async fn delete(&self, job_id: &JobId) -> Result<(), StoreError>;

	async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError>;

	/// Jobs persisted as pending or uploading, oldest first.
	async fn list_pending(&self) -> Result<Vec<JobRecord>, StoreError>;

	/// Terminally failed jobs, oldest first.
	async fn list_failed(&self) -> Result<Vec<JobRecord>, StoreError>;

	/// Every record, oldest first.
	async fn list_all(&self) -> Result<Vec<JobRecord>, StoreError>;
}

/// [`JobStore`] on SurrealDB (SurrealKV on disk, or the in-memory engine).
#[derive(Clone)]
pub struct SurrealJobStore {
	handle: DbHandle,
}

impl SurrealJobStore {
	pub fn new(handle: DbHandle) -> Self {
		Self { handle }
	}

	async fn select(&self, filter: &str) -> Result<Vec<JobRecord>, StoreError> {
		let mut response = self
			.handle
			.db
			.query(format!("SELECT * FROM transfer_job {filter} ORDER BY created_at ASC"))
			.await
			.map_err(|e| StoreError::Db(e.to_string()))?;

		let rows: Vec<serde_json::Value> = response.take(0).map_err(|e| StoreError::Db(e.to_string()))?;
		rows.into_iter().map(decode_row).collect()
	}
}

#[async_trait]
impl JobStore for SurrealJobStore {
	async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
		let job = &record.job;
		let artifact = serde_json::to_string(&record.artifact).map_err(|e| StoreError::Decode {
			job_id: job.id.to_string(),
			reason: e.to_string(),
		})?;

		self.handle
			.db
			.query(
				"BEGIN TRANSACTION;
                 DELETE transfer_job WHERE job_id = $job_id;
                 CREATE transfer_job CONTENT {
                    job_id: $job_id,
                    artifact_id: $artifact_id,
                    artifact: $artifact,
                    status: $status,
                    priority: $priority,
                    attempts: $attempts,
                    max_attempts: $max_attempts,
                    last_error: $last_error,
                    error_kind: $error_kind,
                    remote_id: $remote_id,
                    created_at: $created_at,
                    last_attempt_at: $last_attempt_at,
                    next_retry_at: $next_retry_at,
                 };
                 COMMIT TRANSACTION;",
			)
			.bind(("job_id", job.id.to_string()))
			.bind(("artifact_id", job.artifact_id.to_string()))
			.bind(("artifact", artifact))
			.bind(("status", job.status.as_str().to_string()))
			.bind(("priority", job.priority as i64))
			.bind(("attempts", job.attempts as i64))
			.bind(("max_attempts", job.max_attempts as i64))
			.bind(("last_error", job.last_error.clone()))
			.bind(("error_kind", job.error_kind.map(|k| k.as_str().to_string())))
			.bind(("remote_id", job.remote_id.clone()))
			.bind(("created_at", format_time(&job.created_at)))
			.bind(("last_attempt_at", job.last_attempt_at.as_ref().map(format_time)))
			.bind(("next_retry_at", job.next_retry_at.as_ref().map(format_time)))
			.await
			.map_err(|e| StoreError::Db(e.to_string()))?
			.check()
			.map_err(|e| StoreError::Db(e.to_string()))?;

		Ok(())
	}

	async fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
		self.handle
			.db
			.query("DELETE transfer_job WHERE job_id = $job_id")
			.bind(("job_id", job_id.to_string()))
			.await
			.map_err(|e| StoreError::Db(e.to_string()))?
			.check()
			.map_err(|e| StoreError::Db(e.to_string()))?;
		Ok(())
	}

	async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError> {
		let mut response = self
			.handle
			.db
			.query("SELECT * FROM transfer_job WHERE job_id = $job_id LIMIT 1")
			.bind(("job_id", job_id.to_string()))
			.await
			.map_err(|e| StoreError::Db(e.to_string()))?;

		let rows: Vec<serde_json::Value> = response.take(0).map_err(|e| StoreError::Db(e.to_string()))?;
		rows.into_iter().next().map(decode_row).transpose()
	}

	async fn list_pending(&self) -> Result<Vec<JobRecord>, StoreError> {
		self.select("WHERE status IN ['pending', 'uploading']").await
	}

	async fn list_failed(&self) -> Result<Vec<JobRecord>, StoreError> {
		self.select("WHERE status = 'failed'").await
	}

	async fn list_all(&self) -> Result<Vec<JobRecord>, StoreError> {
		self.select("").await
	}
}

/// Row shape as stored; `id` (the record id) is ignored.
#[derive(Debug, Deserialize)]
struct JobRow {
	job_id: String,
	artifact_id: String,
	artifact: String,
	status: String,
	priority: i64,
	attempts: i64,
	max_attempts: i64,
	#[serde(default)]
	last_error: Option<String>,
	#[serde(default)]
	error_kind: Option<String>,
	#[serde(default)]
	remote_id: Option<String>,
	created_at: String,
	#[serde(default)]
	last_attempt_at: Option<String>,
	#[serde(default)]
	next_retry_at: Option<String>,
}

fn decode_row(row: serde_json::Value) -> Result<JobRecord, StoreError> {
	let row: JobRow = serde_json::from_value(row).map_err(|e| StoreError::Decode {
		job_id: "<unknown>".to_string(),
		reason: e.to_string(),
	})?;
	let job_id = row.job_id.clone();
	let fail = |reason: String| StoreError::Decode { job_id: job_id.clone(), reason };

	let status = JobStatus::parse(&row.status).ok_or_else(|| fail(format!("unknown status {:?}", row.status)))?;
	let error_kind = match row.error_kind.as_deref() {
		Some(kind) => Some(FailureKind::parse(kind).ok_or_else(|| fail(format!("unknown error kind {kind:?}")))?),
		None => None,
	};
	let artifact: Artifact = serde_json::from_str(&row.artifact).map_err(|e| fail(format!("artifact: {e}")))?;
	let parse_opt = |value: Option<String>| value.as_deref().map(parse_time).transpose().map_err(&fail);

	let job = TransferJob {
		id: JobId::from(row.job_id.as_str()),
		artifact_id: ArtifactId::new(row.artifact_id),
		status,
		priority: to_u32(row.priority).map_err(&fail)?,
		created_at: parse_time(&row.created_at).map_err(&fail)?,
		last_attempt_at: parse_opt(row.last_attempt_at)?,
		next_retry_at: parse_opt(row.next_retry_at)?,
		attempts: to_u32(row.attempts).map_err(&fail)?,
		max_attempts: to_u32(row.max_attempts).map_err(&fail)?,
		last_error: row.last_error,
		error_kind,
		remote_id: row.remote_id,
	};

	Ok(JobRecord { job, artifact })
}

fn format_time(time: &DateTime<Utc>) -> String {
	time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
	DateTime::parse_from_rfc3339(value)
		.map(|t| t.with_timezone(&Utc))
		.map_err(|e| format!("timestamp {value:?}: {e}"))
}

fn to_u32(value: i64) -> Result<u32, String> {
	u32::try_from(value).map_err(|_| format!("integer out of range: {value}"))
}
