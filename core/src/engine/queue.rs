use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio::time::Instant;

use super::transport::TransferError;
use crate::models::{Artifact, ArtifactId, JobId, JobStatus, TransferJob};

/// Counts over the active set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
	pub pending: usize,
	pub uploading: usize,
	/// Jobs completed since the scheduler started (completed jobs leave the active set).
	pub completed: usize,
	pub failed: usize,
}

/// Result of an attempt whose outcome could not be persisted yet.
#[derive(Debug, Clone)]
pub(crate) struct Unsettled {
	pub result: Result<String, TransferError>,
	pub retry_at: Instant,
}

#[derive(Debug)]
pub(crate) struct Entry {
	pub job: TransferJob,
	pub artifact: Artifact,
	/// Admission order; last tie-breaker.
	pub seq: u64,
	/// Monotonic deadline mirroring `job.next_retry_at`.
	pub retry_deadline: Option<Instant>,
	/// Token of the transport call currently running for this job.
	pub attempt: Option<u64>,
	pub unsettled: Option<Unsettled>,
}

/// The scheduler's in-memory view of live jobs.
///
/// Only the scheduler task touches it. Transport calls are tracked separately
/// from entries: a cancelled job's call keeps its slot until it returns.
#[derive(Debug, Default)]
pub(crate) struct ActiveSet {
	entries: HashMap<JobId, Entry>,
	by_artifact: HashMap<ArtifactId, JobId>,
	in_flight: HashMap<u64, ArtifactId>,
	busy_artifacts: HashSet<ArtifactId>,
	next_seq: u64,
	next_token: u64,
}

impl ActiveSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn get(&self, job_id: &JobId) -> Option<&Entry> {
		self.entries.get(job_id)
	}

	pub fn get_mut(&mut self, job_id: &JobId) -> Option<&mut Entry> {
		self.entries.get_mut(job_id)
	}

	pub fn job_for_artifact(&self, artifact_id: &ArtifactId) -> Option<&Entry> {
		self.by_artifact.get(artifact_id).and_then(|id| self.entries.get(id))
	}

	/// Insert or replace the entry for a job.
	pub fn insert(&mut self, job: TransferJob, artifact: Artifact, retry_deadline: Option<Instant>) {
		let seq = self.next_seq;
		self.next_seq += 1;
		self.by_artifact.insert(job.artifact_id.clone(), job.id.clone());
		self.entries.insert(
			job.id.clone(),
			Entry { job, artifact, seq, retry_deadline, attempt: None, unsettled: None },
		);
	}

	pub fn remove(&mut self, job_id: &JobId) -> Option<Entry> {
		let entry = self.entries.remove(job_id)?;
		if self.by_artifact.get(&entry.job.artifact_id) == Some(job_id) {
			self.by_artifact.remove(&entry.job.artifact_id);
		}
		Some(entry)
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.len()
	}

	/// Concurrency slots in use: live transport calls plus finished attempts
	/// whose outcome is not persisted yet (those jobs are still uploading).
	pub fn busy_slots(&self) -> usize {
		self.in_flight.len() + self.entries.values().filter(|e| e.unsettled.is_some()).count()
	}

	/// Claim a transport slot for an artifact. Returns the attempt token.
	pub fn start_flight(&mut self, artifact_id: &ArtifactId) -> u64 {
		let token = self.next_token;
		self.next_token += 1;
		self.in_flight.insert(token, artifact_id.clone());
		self.busy_artifacts.insert(artifact_id.clone());
		token
	}

	pub fn end_flight(&mut self, token: u64) {
		if let Some(artifact_id) = self.in_flight.remove(&token) {
			self.busy_artifacts.remove(&artifact_id);
		}
	}

	/// Pending jobs that may start now, best first, at most `limit`.
	///
	/// Order: priority descending, then creation time, then admission order.
	pub fn select(&self, now: Instant, limit: usize) -> Vec<JobId> {
		if limit == 0 {
			return Vec::new();
		}
		let mut candidates: Vec<&Entry> = self
			.entries
			.values()
			.filter(|e| e.job.status == JobStatus::Pending)
			.filter(|e| e.unsettled.is_none())
			.filter(|e| e.retry_deadline.map_or(true, |d| d <= now))
			.filter(|e| !self.busy_artifacts.contains(&e.job.artifact_id))
			.collect();

		candidates.sort_by(|a, b| {
			b.job
				.priority
				.cmp(&a.job.priority)
				.then(a.job.created_at.cmp(&b.job.created_at))
				.then(a.seq.cmp(&b.seq))
		});

		candidates.into_iter().take(limit).map(|e| e.job.id.clone()).collect()
	}

	/// Earliest moment something may become actionable without an external trigger.
	pub fn next_wake(&self) -> Option<Instant> {
		self.entries
			.values()
			.filter_map(|e| match (&e.unsettled, e.job.status) {
				(Some(u), _) => Some(u.retry_at),
				(None, JobStatus::Pending) => e.retry_deadline,
				_ => None,
			})
			.min()
	}

	/// Entries whose persisted outcome is due for another write.
	pub fn due_unsettled(&self, now: Instant) -> Vec<JobId> {
		self.entries
			.values()
			.filter(|e| e.unsettled.as_ref().is_some_and(|u| u.retry_at <= now))
			.map(|e| e.job.id.clone())
			.collect()
	}

	pub fn stats(&self, completed: usize) -> QueueStats {
		let mut stats = QueueStats { completed, ..QueueStats::default() };
		for entry in self.entries.values() {
			match entry.job.status {
				JobStatus::Pending => stats.pending += 1,
				JobStatus::Uploading => stats.uploading += 1,
				JobStatus::Completed => stats.completed += 1,
				JobStatus::Failed => stats.failed += 1,
			}
		}
		stats
	}

	/// Nothing pending, nothing uploading, no transport call outstanding.
	pub fn is_idle(&self) -> bool {
		self.in_flight.is_empty()
			&& self
				.entries
				.values()
				.all(|e| matches!(e.job.status, JobStatus::Failed | JobStatus::Completed))
	}
}
