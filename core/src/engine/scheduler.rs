use std::{sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::{
	sync::{mpsc, oneshot, watch},
	time::Instant,
};
use tracing::{debug, error, info, warn};

use super::{
	progress::{ProgressEvent, ProgressHub, Subscription},
	queue::{ActiveSet, QueueStats, Unsettled},
	transport::{TransferError, Transport},
};
use crate::{
	config::{ConfigError, SchedulerConfig},
	models::{Artifact, FailureOutcome, JobId, JobStatus, RetryPolicy, TransferJob},
	store::{JobRecord, JobStore, StoreError},
};

/// Wait before repeating a store write that failed (attempt outcome or dispatch).
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error("job not found: {0}")]
	NotFound(JobId),

	#[error("cannot {action} job {job_id} while it is {status}")]
	InvalidState {
		job_id: JobId,
		status: JobStatus,
		action: &'static str,
	},

	#[error("job store error: {0}")]
	Store(#[from] StoreError),

	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("scheduler has shut down")]
	Closed,
}

enum Command {
	Enqueue {
		artifact: Artifact,
		reply: oneshot::Sender<Result<JobId, SchedulerError>>,
	},
	Cancel {
		job_id: JobId,
		reply: oneshot::Sender<Result<(), SchedulerError>>,
	},
	Retry {
		job_id: JobId,
		reply: oneshot::Sender<Result<(), SchedulerError>>,
	},
	Status {
		job_id: JobId,
		reply: oneshot::Sender<Result<TransferJob, SchedulerError>>,
	},
	Stats {
		reply: oneshot::Sender<QueueStats>,
	},
	SetPaused {
		paused: bool,
		reply: oneshot::Sender<()>,
	},
	Shutdown {
		reply: oneshot::Sender<()>,
	},
}

/// A transport call came back.
struct Finished {
	job_id: JobId,
	token: u64,
	result: Result<String, TransferError>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Activity {
	stats: QueueStats,
	idle: bool,
}

enum Event {
	Command(Option<Command>),
	Finished(Finished),
	Wake,
}

/// Handle to the upload scheduler.
///
/// All job state lives in one background task; every method here is a message
/// to it. Methods return once the request is applied and persisted, never
/// waiting on a transfer. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
	commands: mpsc::UnboundedSender<Command>,
	hub: ProgressHub,
	activity: watch::Receiver<Activity>,
}

impl Scheduler {
	/// Rebuild the queue from `store` and start dispatching.
	pub async fn start(
		config: &SchedulerConfig,
		store: Arc<dyn JobStore>,
		transport: Arc<dyn Transport>,
	) -> Result<Self, SchedulerError> {
		Self::launch(config, store, transport, false).await
	}

	/// Like [`Scheduler::start`], but nothing is dispatched until [`Scheduler::resume`].
	pub async fn start_paused(
		config: &SchedulerConfig,
		store: Arc<dyn JobStore>,
		transport: Arc<dyn Transport>,
	) -> Result<Self, SchedulerError> {
		Self::launch(config, store, transport, true).await
	}

	async fn launch(
		config: &SchedulerConfig,
		store: Arc<dyn JobStore>,
		transport: Arc<dyn Transport>,
		paused: bool,
	) -> Result<Self, SchedulerError> {
		config.validate()?;
		let queue = recover(store.as_ref()).await?;

		let hub = ProgressHub::new();
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let (finished_tx, finished_rx) = mpsc::unbounded_channel();
		let (activity_tx, activity_rx) = watch::channel(Activity::default());

		let worker = Worker {
			concurrency: config.concurrency,
			policy: config.retry_policy(),
			store,
			transport,
			hub: hub.clone(),
			queue,
			paused,
			completed: 0,
			pass_retry_at: None,
			commands: commands_rx,
			finished_tx,
			finished_rx,
			activity: activity_tx,
		};
		worker.publish();
		tokio::spawn(worker.run());

		Ok(Self { commands: commands_tx, hub, activity: activity_rx })
	}

	async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SchedulerError> {
		let (reply, rx) = oneshot::channel();
		self.commands.send(make(reply)).map_err(|_| SchedulerError::Closed)?;
		rx.await.map_err(|_| SchedulerError::Closed)
	}

	/// Persist and queue a job for `artifact`.
	///
	/// If the artifact already has a pending or uploading job, its id is
	/// returned and nothing else happens.
	pub async fn enqueue(&self, artifact: Artifact) -> Result<JobId, SchedulerError> {
		self.request(|reply| Command::Enqueue { artifact, reply }).await?
	}

	/// Drop a pending, uploading or failed job and its persisted record.
	///
	/// A running transfer is not interrupted; its result is discarded when it
	/// returns.
	pub async fn cancel(&self, job_id: &JobId) -> Result<(), SchedulerError> {
		let job_id = job_id.clone();
		self.request(|reply| Command::Cancel { job_id, reply }).await?
	}

	/// Give a failed job a fresh attempt budget.
	pub async fn retry(&self, job_id: &JobId) -> Result<(), SchedulerError> {
		let job_id = job_id.clone();
		self.request(|reply| Command::Retry { job_id, reply }).await?
	}

	pub async fn status(&self, job_id: &JobId) -> Result<TransferJob, SchedulerError> {
		let job_id = job_id.clone();
		self.request(|reply| Command::Status { job_id, reply }).await?
	}

	pub async fn queue_stats(&self) -> Result<QueueStats, SchedulerError> {
		self.request(|reply| Command::Stats { reply }).await
	}

	/// Stop starting new attempts. Running transfers finish normally.
	pub async fn pause(&self) -> Result<(), SchedulerError> {
		self.request(|reply| Command::SetPaused { paused: true, reply }).await
	}

	pub async fn resume(&self) -> Result<(), SchedulerError> {
		self.request(|reply| Command::SetPaused { paused: false, reply }).await
	}

	pub fn progress(&self) -> &ProgressHub {
		&self.hub
	}

	/// Shorthand for `progress().subscribe(..)`.
	pub fn subscribe<F>(&self, job_id: &JobId, callback: F) -> Subscription
	where
		F: Fn(&ProgressEvent) + Send + Sync + 'static,
	{
		self.hub.subscribe(job_id, callback)
	}

	/// Resolve once nothing is pending or uploading and no transport call is
	/// outstanding. Never resolves while paused with pending work.
	pub async fn wait_idle(&self) -> Result<(), SchedulerError> {
		let mut activity = self.activity.clone();
		activity.wait_for(|a| a.idle).await.map_err(|_| SchedulerError::Closed)?;
		Ok(())
	}

	/// Stop the scheduler task. Transfers already running are left to finish.
	pub async fn shutdown(&self) -> Result<(), SchedulerError> {
		self.request(|reply| Command::Shutdown { reply }).await
	}
}

/// Load persisted jobs. Interrupted uploads go back to pending (or to failed if
/// their last attempt was the final one) and are written back before use.
async fn recover(store: &dyn JobStore) -> Result<ActiveSet, SchedulerError> {
	let mut records = store.list_pending().await?;
	records.extend(store.list_failed().await?);
	records.sort_by(|a, b| a.job.created_at.cmp(&b.job.created_at));

	let mut queue = ActiveSet::new();
	let now = Utc::now();
	let now_instant = Instant::now();

	for mut record in records {
		if record.job.recover_after_restart() {
			store.put(&record).await?;
			warn!(job_id = %record.job.id, status = %record.job.status, "recovered interrupted upload");
		}

		let deadline = match (record.job.status, record.job.next_retry_at) {
			(JobStatus::Pending, Some(at)) => {
				let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
				Some(now_instant + remaining)
			}
			_ => None,
		};
		queue.insert(record.job, record.artifact, deadline);
	}

	Ok(queue)
}

struct Worker {
	concurrency: usize,
	policy: RetryPolicy,
	store: Arc<dyn JobStore>,
	transport: Arc<dyn Transport>,
	hub: ProgressHub,
	queue: ActiveSet,
	paused: bool,
	completed: usize,
	/// Set when a dispatch write failed; the next pass runs no later than this.
	pass_retry_at: Option<Instant>,
	commands: mpsc::UnboundedReceiver<Command>,
	finished_tx: mpsc::UnboundedSender<Finished>,
	finished_rx: mpsc::UnboundedReceiver<Finished>,
	activity: watch::Sender<Activity>,
}

impl Worker {
	async fn run(mut self) {
		info!(
			transport = self.transport.name(),
			concurrency = self.concurrency,
			jobs = self.queue.len(),
			paused = self.paused,
			"scheduler started"
		);

		self.process().await;
		self.publish();

		loop {
			let wake = match (self.queue.next_wake(), self.pass_retry_at) {
				(Some(a), Some(b)) => Some(a.min(b)),
				(a, b) => a.or(b),
			};
			let event = tokio::select! {
				command = self.commands.recv() => Event::Command(command),
				Some(done) = self.finished_rx.recv() => Event::Finished(done),
				_ = sleep_until(wake) => Event::Wake,
			};

			match event {
				Event::Command(Some(Command::Shutdown { reply })) => {
					self.publish();
					let _ = reply.send(());
					break;
				}
				Event::Command(Some(command)) => self.handle(command).await,
				// Every handle dropped.
				Event::Command(None) => break,
				Event::Finished(done) => self.settle(done).await,
				Event::Wake => {}
			}

			self.process().await;
			self.publish();
		}

		info!(in_flight = self.queue.in_flight(), "scheduler stopped");
	}

	fn publish(&self) {
		self.activity.send_replace(Activity {
			stats: self.queue.stats(self.completed),
			idle: self.queue.is_idle(),
		});
	}

	/// Publish activity before answering, so a caller that awaits the reply and
	/// then waits for idle sees its own request.
	fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) {
		self.publish();
		let _ = reply.send(value);
	}

	async fn handle(&mut self, command: Command) {
		match command {
			Command::Enqueue { artifact, reply } => {
				let result = self.enqueue(artifact).await;
				self.respond(reply, result);
			}
			Command::Cancel { job_id, reply } => {
				let result = self.cancel(&job_id).await;
				self.respond(reply, result);
			}
			Command::Retry { job_id, reply } => {
				let result = self.retry(&job_id).await;
				self.respond(reply, result);
			}
			Command::Status { job_id, reply } => {
				let result = self.status(&job_id).await;
				self.respond(reply, result);
			}
			Command::Stats { reply } => {
				let stats = self.queue.stats(self.completed);
				self.respond(reply, stats);
			}
			Command::SetPaused { paused, reply } => {
				if self.paused != paused {
					info!(paused, "dispatching {}", if paused { "paused" } else { "resumed" });
				}
				self.paused = paused;
				self.respond(reply, ());
			}
			Command::Shutdown { reply } => self.respond(reply, ()),
		}
	}

	async fn enqueue(&mut self, artifact: Artifact) -> Result<JobId, SchedulerError> {
		if let Some(existing) = self.queue.job_for_artifact(&artifact.id) {
			if existing.job.is_active() {
				debug!(job_id = %existing.job.id, "artifact already queued");
				return Ok(existing.job.id.clone());
			}
		}

		let job = TransferJob::new(artifact.id.clone(), self.policy.max_attempts, Utc::now());
		let record = JobRecord { job, artifact };
		self.store.put(&record).await?;

		info!(
			job_id = %record.job.id,
			artifact_id = %record.artifact.id,
			size_bytes = record.artifact.size_bytes,
			"job enqueued"
		);
		let job_id = record.job.id.clone();
		self.queue.insert(record.job, record.artifact, None);
		Ok(job_id)
	}

	async fn cancel(&mut self, job_id: &JobId) -> Result<(), SchedulerError> {
		if self.queue.get(job_id).is_none() {
			return Err(SchedulerError::NotFound(job_id.clone()));
		}

		self.store.delete(job_id).await?;
		if let Some(entry) = self.queue.remove(job_id) {
			info!(
				job_id = %job_id,
				status = %entry.job.status,
				in_flight = entry.attempt.is_some(),
				"job cancelled"
			);
		}
		self.hub.forget(job_id);
		Ok(())
	}

	async fn retry(&mut self, job_id: &JobId) -> Result<(), SchedulerError> {
		let entry = self.queue.get(job_id).ok_or_else(|| SchedulerError::NotFound(job_id.clone()))?;

		let mut job = entry.job.clone();
		job.reset_for_retry().map_err(|t| SchedulerError::InvalidState {
			job_id: job_id.clone(),
			status: t.status,
			action: "retry",
		})?;
		self.store.put(&JobRecord { job: job.clone(), artifact: entry.artifact.clone() }).await?;

		if let Some(entry) = self.queue.get_mut(job_id) {
			entry.job = job;
			entry.retry_deadline = None;
		}
		info!(job_id = %job_id, "manual retry");
		Ok(())
	}

	async fn status(&self, job_id: &JobId) -> Result<TransferJob, SchedulerError> {
		if let Some(entry) = self.queue.get(job_id) {
			return Ok(entry.job.clone());
		}
		// Completed jobs have left the active set; the store still has them.
		match self.store.get(job_id).await? {
			Some(record) => Ok(record.job),
			None => Err(SchedulerError::NotFound(job_id.clone())),
		}
	}

	/// One processing pass: re-apply outcomes the store refused earlier, then
	/// start as many eligible jobs as there are free slots.
	async fn process(&mut self) {
		let now = Instant::now();

		for job_id in self.queue.due_unsettled(now) {
			let unsettled = self.queue.get_mut(&job_id).and_then(|e| e.unsettled.take());
			if let Some(unsettled) = unsettled {
				self.apply_outcome(&job_id, unsettled.result).await;
			}
		}

		if self.paused {
			return;
		}

		self.pass_retry_at = None;
		let capacity = self.concurrency.saturating_sub(self.queue.busy_slots());
		for job_id in self.queue.select(now, capacity) {
			if let Err(e) = self.dispatch(&job_id).await {
				error!(job_id = %job_id, error = %e, "failed to persist attempt start; pass aborted");
				self.pass_retry_at = Some(Instant::now() + STORE_RETRY_DELAY);
				break;
			}
		}
	}

	async fn dispatch(&mut self, job_id: &JobId) -> Result<(), StoreError> {
		let Some(entry) = self.queue.get(job_id) else {
			return Ok(());
		};
		let mut job = entry.job.clone();
		if let Err(e) = job.begin_attempt(Utc::now()) {
			warn!(job_id = %job_id, error = %e, "job not startable");
			return Ok(());
		}
		let artifact = entry.artifact.clone();

		self.store.put(&JobRecord { job: job.clone(), artifact: artifact.clone() }).await?;

		let token = self.queue.start_flight(&job.artifact_id);
		if let Some(entry) = self.queue.get_mut(job_id) {
			entry.job = job.clone();
			entry.retry_deadline = None;
			entry.attempt = Some(token);
		}
		debug!(job_id = %job.id, attempts = job.attempts, priority = job.priority, "upload started");
		self.hub.publish(ProgressEvent::uploading(&job));

		let transport = self.transport.clone();
		let finished = self.finished_tx.clone();
		let job_id = job.id.clone();
		tokio::spawn(async move {
			let call = tokio::spawn(async move { transport.send(&artifact, &artifact.target_metadata).await });
			let result = match call.await {
				Ok(result) => result,
				Err(e) => Err(TransferError::Transient(format!("transport task failed: {e}"))),
			};
			let _ = finished.send(Finished { job_id, token, result });
		});

		Ok(())
	}

	async fn settle(&mut self, done: Finished) {
		self.queue.end_flight(done.token);

		match self.queue.get_mut(&done.job_id) {
			Some(entry) if entry.attempt == Some(done.token) => entry.attempt = None,
			_ => {
				debug!(job_id = %done.job_id, "discarding result of cancelled attempt");
				return;
			}
		}

		self.apply_outcome(&done.job_id, done.result).await;
	}

	async fn apply_outcome(&mut self, job_id: &JobId, result: Result<String, TransferError>) {
		let Some(entry) = self.queue.get(job_id) else {
			return;
		};

		let mut job = entry.job.clone();
		let transition = match &result {
			Ok(remote_id) => job.complete(remote_id.clone()).map(|_| None),
			Err(err) => job.fail(err.kind(), err.message().to_string(), &self.policy, Utc::now()).map(Some),
		};
		let outcome = match transition {
			Ok(outcome) => outcome,
			Err(e) => {
				error!(job_id = %job_id, error = %e, "dropping attempt outcome");
				return;
			}
		};

		let record = JobRecord { job, artifact: entry.artifact.clone() };
		if let Err(e) = self.store.put(&record).await {
			error!(job_id = %job_id, error = %e, "failed to persist attempt outcome; will retry");
			if let Some(entry) = self.queue.get_mut(job_id) {
				entry.unsettled = Some(Unsettled { result, retry_at: Instant::now() + STORE_RETRY_DELAY });
			}
			return;
		}
		let job = record.job;

		match outcome {
			None => {
				info!(
					job_id = %job_id,
					attempts = job.attempts,
					remote_id = job.remote_id.as_deref().unwrap_or_default(),
					"upload completed"
				);
				self.queue.remove(job_id);
				self.completed += 1;
				self.hub.publish(ProgressEvent::completed(&job));
				self.hub.forget(job_id);
			}
			Some(FailureOutcome::RetryScheduled(delay)) => {
				warn!(
					job_id = %job_id,
					attempts = job.attempts,
					delay_ms = delay.as_millis() as u64,
					error = job.last_error.as_deref().unwrap_or_default(),
					"transient failure; retry scheduled"
				);
				if let Some(entry) = self.queue.get_mut(job_id) {
					entry.job = job.clone();
					entry.retry_deadline = Some(Instant::now() + delay);
				}
				self.hub.publish(ProgressEvent::failed(&job));
			}
			Some(FailureOutcome::Exhausted) => {
				error!(
					job_id = %job_id,
					attempts = job.attempts,
					kind = job.error_kind.map(|k| k.as_str()).unwrap_or_default(),
					error = job.last_error.as_deref().unwrap_or_default(),
					"upload failed"
				);
				if let Some(entry) = self.queue.get_mut(job_id) {
					entry.job = job.clone();
					entry.retry_deadline = None;
				}
				self.hub.publish(ProgressEvent::failed(&job));
			}
		}
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}
