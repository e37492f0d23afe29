use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ArtifactId, JobId, JobStatus, TransferJob};

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
	Uploading,
	Completed,
	Failed,
}

/// One state transition of one job.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent {
	pub job_id: JobId,
	pub artifact_id: ArtifactId,
	pub status: ProgressStatus,
	/// 0 when an attempt starts, 100 on completion.
	pub progress: u8,
	pub attempts: u32,
	pub error: Option<String>,
	/// Set on an interim failure: when the next attempt becomes eligible.
	pub retry_at: Option<DateTime<Utc>>,
}

impl ProgressEvent {
	pub fn uploading(job: &TransferJob) -> Self {
		Self::from_job(job, ProgressStatus::Uploading, 0)
	}

	pub fn completed(job: &TransferJob) -> Self {
		Self::from_job(job, ProgressStatus::Completed, 100)
	}

	pub fn failed(job: &TransferJob) -> Self {
		Self::from_job(job, ProgressStatus::Failed, 0)
	}

	/// Terminal failure, as opposed to a failure with a retry already scheduled.
	pub fn is_terminal(&self) -> bool {
		self.status == ProgressStatus::Completed || (self.status == ProgressStatus::Failed && self.retry_at.is_none())
	}

	fn from_job(job: &TransferJob, status: ProgressStatus, progress: u8) -> Self {
		Self {
			job_id: job.id.clone(),
			artifact_id: job.artifact_id.clone(),
			status,
			progress,
			attempts: job.attempts,
			error: job.last_error.clone(),
			retry_at: match job.status {
				JobStatus::Pending => job.next_retry_at,
				_ => None,
			},
		}
	}
}

type Observer = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

struct HubInner {
	observers: Mutex<HashMap<JobId, (u64, Observer)>>,
	next_token: AtomicU64,
	feed: broadcast::Sender<ProgressEvent>,
}

/// Routes job transitions to observers.
///
/// Each job id has at most one callback observer; subscribing again replaces it.
/// Every event is also sent on a broadcast feed that any number of listeners
/// can follow.
#[derive(Clone)]
pub struct ProgressHub {
	inner: Arc<HubInner>,
}

impl ProgressHub {
	pub fn new() -> Self {
		let (feed, _) = broadcast::channel(FEED_CAPACITY);
		Self {
			inner: Arc::new(HubInner {
				observers: Mutex::new(HashMap::new()),
				next_token: AtomicU64::new(1),
				feed,
			}),
		}
	}

	/// Register `callback` for `job_id`, replacing any previous observer.
	///
	/// Callbacks run on the scheduler task and must return quickly.
	pub fn subscribe<F>(&self, job_id: &JobId, callback: F) -> Subscription
	where
		F: Fn(&ProgressEvent) + Send + Sync + 'static,
	{
		let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
		self.inner.observers.lock().insert(job_id.clone(), (token, Arc::new(callback)));
		Subscription {
			hub: Arc::downgrade(&self.inner),
			job_id: job_id.clone(),
			token,
		}
	}

	/// Receiver of every event for every job.
	pub fn feed(&self) -> broadcast::Receiver<ProgressEvent> {
		self.inner.feed.subscribe()
	}

	pub(crate) fn publish(&self, event: ProgressEvent) {
		// Clone the callback out so it never runs under the lock.
		let observer = self.inner.observers.lock().get(&event.job_id).map(|(_, cb)| cb.clone());
		if let Some(callback) = observer {
			callback(&event);
		}
		let _ = self.inner.feed.send(event);
	}

	/// Drop the observer of a job that left the active set.
	pub(crate) fn forget(&self, job_id: &JobId) {
		self.inner.observers.lock().remove(job_id);
	}

	pub fn has_observer(&self, job_id: &JobId) -> bool {
		self.inner.observers.lock().contains_key(job_id)
	}
}

impl Default for ProgressHub {
	fn default() -> Self {
		Self::new()
	}
}

/// Handle returned by [`ProgressHub::subscribe`].
#[derive(Debug)]
pub struct Subscription {
	hub: Weak<HubInner>,
	job_id: JobId,
	token: u64,
}

impl Subscription {
	pub fn job_id(&self) -> &JobId {
		&self.job_id
	}

	/// Remove the observer, unless a later subscriber already replaced it.
	pub fn unsubscribe(self) {
		let Some(hub) = self.hub.upgrade() else {
			return;
		};
		let mut observers = hub.observers.lock();
		if observers.get(&self.job_id).is_some_and(|(token, _)| *token == self.token) {
			observers.remove(&self.job_id);
		}
	}
}
