use std::{
	collections::{BTreeMap, HashMap, VecDeque},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{
	config::SchedulerConfig,
	db,
	engine::{DirectoryTransport, ProgressEvent, ProgressStatus},
	models::{Artifact, ArtifactId, JobId, JobStatus, TargetMetadata, TransferJob},
	store::{JobRecord, JobStore, StoreError, SurrealJobStore},
	Scheduler, SchedulerError, TransferError, Transport,
};
use parking_lot::Mutex;
use tokio::{sync::Semaphore, time::Instant};

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
	records: Mutex<BTreeMap<JobId, JobRecord>>,
	fail_puts: AtomicUsize,
}

impl MemoryStore {
	fn fail_next_puts(&self, n: usize) {
		self.fail_puts.store(n, Ordering::SeqCst);
	}

	fn record(&self, job_id: &JobId) -> Option<JobRecord> {
		self.records.lock().get(job_id).cloned()
	}

	fn len(&self) -> usize {
		self.records.lock().len()
	}

	fn by_status(&self, status: JobStatus) -> Vec<JobRecord> {
		let mut records: Vec<JobRecord> =
			self.records.lock().values().filter(|r| r.job.status == status).cloned().collect();
		records.sort_by(|a, b| a.job.created_at.cmp(&b.job.created_at));
		records
	}
}

#[async_trait]
impl JobStore for MemoryStore {
	async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
		let injected = self
			.fail_puts
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if injected {
			return Err(StoreError::Db("injected write failure".into()));
		}
		self.records.lock().insert(record.job.id.clone(), record.clone());
		Ok(())
	}

	async fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
		self.records.lock().remove(job_id);
		Ok(())
	}

	async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError> {
		Ok(self.record(job_id))
	}

	async fn list_pending(&self) -> Result<Vec<JobRecord>, StoreError> {
		let mut records = self.by_status(JobStatus::Pending);
		records.extend(self.by_status(JobStatus::Uploading));
		Ok(records)
	}

	async fn list_failed(&self) -> Result<Vec<JobRecord>, StoreError> {
		Ok(self.by_status(JobStatus::Failed))
	}

	async fn list_all(&self) -> Result<Vec<JobRecord>, StoreError> {
		Ok(self.records.lock().values().cloned().collect())
	}
}

/// Answers each artifact from a script, then succeeds. Every call takes `latency`.
#[derive(Default)]
struct ScriptedTransport {
	latency: Duration,
	script: Mutex<HashMap<ArtifactId, VecDeque<Result<String, TransferError>>>>,
	calls: Mutex<Vec<(ArtifactId, Instant)>>,
	active: AtomicUsize,
	peak: AtomicUsize,
}

impl ScriptedTransport {
	fn with_latency(latency: Duration) -> Self {
		Self { latency, ..Self::default() }
	}

	fn script(&self, artifact_id: &str, results: Vec<Result<String, TransferError>>) {
		self.script.lock().insert(ArtifactId::from(artifact_id), results.into());
	}

	fn call_times(&self, artifact_id: &str) -> Vec<Instant> {
		let id = ArtifactId::from(artifact_id);
		self.calls.lock().iter().filter(|(a, _)| *a == id).map(|(_, at)| *at).collect()
	}

	fn call_count(&self) -> usize {
		self.calls.lock().len()
	}
}

#[async_trait]
impl Transport for ScriptedTransport {
	async fn send(&self, artifact: &Artifact, _target: &TargetMetadata) -> Result<String, TransferError> {
		self.calls.lock().push((artifact.id.clone(), Instant::now()));
		let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
		self.peak.fetch_max(running, Ordering::SeqCst);

		if !self.latency.is_zero() {
			tokio::time::sleep(self.latency).await;
		}

		self.active.fetch_sub(1, Ordering::SeqCst);
		let scripted = self.script.lock().get_mut(&artifact.id).and_then(|q| q.pop_front());
		scripted.unwrap_or_else(|| Ok(format!("remote/{}", artifact.id)))
	}

	fn name(&self) -> &str {
		"scripted"
	}
}

/// Blocks every call until a permit is released.
struct GatedTransport {
	gate: Semaphore,
	calls: AtomicUsize,
}

impl GatedTransport {
	fn new() -> Self {
		Self { gate: Semaphore::new(0), calls: AtomicUsize::new(0) }
	}
}

#[async_trait]
impl Transport for GatedTransport {
	async fn send(&self, artifact: &Artifact, _target: &TargetMetadata) -> Result<String, TransferError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let permit = self.gate.acquire().await.map_err(|e| TransferError::Transient(e.to_string()))?;
		permit.forget();
		Ok(format!("remote/{}", artifact.id))
	}

	fn name(&self) -> &str {
		"gated"
	}
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn artifact(id: &str) -> Artifact {
	Artifact {
		id: ArtifactId::from(id),
		local_path: format!("/captures/{id}.jpg").into(),
		size_bytes: 2048,
		mime_type: "image/jpeg".into(),
		content_fingerprint: format!("fp-{id}"),
		target_metadata: TargetMetadata::new(),
	}
}

fn config(concurrency: usize, max_attempts: u32) -> SchedulerConfig {
	SchedulerConfig { concurrency, max_attempts, ..SchedulerConfig::default() }
}

fn transient(msg: &str) -> Result<String, TransferError> {
	Err(TransferError::Transient(msg.into()))
}

fn record_events(scheduler: &Scheduler, job_id: &JobId) -> Arc<Mutex<Vec<ProgressEvent>>> {
	let events = Arc::new(Mutex::new(Vec::new()));
	let sink = events.clone();
	// Dropping the handle keeps the observer; it goes away when the job leaves the queue.
	let _ = scheduler.subscribe(job_id, move |event| sink.lock().push(event.clone()));
	events
}

async fn wait_for_status(scheduler: &Scheduler, job_id: &JobId, status: JobStatus) {
	for _ in 0..200 {
		if scheduler.status(job_id).await.unwrap().status == status {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("job {job_id} never reached {status}");
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrency_limit_is_never_exceeded() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(100)));
	let scheduler = Scheduler::start(&config(2, 5), store.clone(), transport.clone()).await.unwrap();

	for id in ["a", "b", "c", "d", "e"] {
		scheduler.enqueue(artifact(id)).await.unwrap();
	}

	let mut samples = Vec::new();
	for _ in 0..6 {
		samples.push(scheduler.queue_stats().await.unwrap().uploading);
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	assert!(samples.iter().all(|&n| n <= 2), "{samples:?}");
	assert_eq!(samples[0], 2);

	scheduler.wait_idle().await.unwrap();

	assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
	assert_eq!(transport.call_count(), 5);

	let stats = scheduler.queue_stats().await.unwrap();
	assert_eq!((stats.pending, stats.uploading, stats.completed, stats.failed), (0, 0, 5, 0));
	assert_eq!(store.by_status(JobStatus::Completed).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn paused_scheduler_dispatches_nothing_until_resumed() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start_paused(&config(2, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	tokio::time::sleep(Duration::from_secs(5)).await;
	assert_eq!(transport.call_count(), 0);
	assert_eq!(scheduler.status(&job_id).await.unwrap().status, JobStatus::Pending);

	scheduler.resume().await.unwrap();
	scheduler.wait_idle().await.unwrap();
	assert_eq!(transport.call_count(), 1);
	assert_eq!(scheduler.status(&job_id).await.unwrap().status, JobStatus::Completed);
}

// ---------------------------------------------------------------------------
// Retry behaviour
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_succeed() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	transport.script("a", vec![transient("timeout"), transient("timeout"), transient("503")]);
	let scheduler = Scheduler::start(&config(2, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = JobId::for_artifact(&ArtifactId::from("a"));
	let events = record_events(&scheduler, &job_id);

	assert_eq!(scheduler.enqueue(artifact("a")).await.unwrap(), job_id);
	scheduler.wait_idle().await.unwrap();

	let calls = transport.call_times("a");
	assert_eq!(calls.len(), 4);
	for (gap, expected) in calls.windows(2).map(|w| w[1] - w[0]).zip([1, 2, 4]) {
		let expected = Duration::from_secs(expected);
		assert!(gap >= expected && gap < expected + Duration::from_millis(50), "gap {gap:?}, expected {expected:?}");
	}

	let job = scheduler.status(&job_id).await.unwrap();
	assert_eq!(job.status, JobStatus::Completed);
	assert_eq!(job.attempts, 4);
	assert_eq!(job.priority, 4);
	assert_eq!(job.remote_id.as_deref(), Some("remote/a"));

	let statuses: Vec<ProgressStatus> = events.lock().iter().map(|e| e.status).collect();
	use ProgressStatus::*;
	assert_eq!(statuses, vec![Uploading, Failed, Uploading, Failed, Uploading, Failed, Uploading, Completed]);
	assert!(events.lock()[1].retry_at.is_some());
	assert!(!scheduler.progress().has_observer(&job_id));
}

#[tokio::test(start_paused = true)]
async fn priority_boost_stops_at_cap() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	transport.script("a", (0..5).map(|_| transient("flaky")).collect());
	let config = SchedulerConfig { concurrency: 1, max_attempts: 6, backoff_secs: vec![1], priority_cap: 3 };
	let scheduler = Scheduler::start(&config, store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	scheduler.wait_idle().await.unwrap();

	let job = scheduler.status(&job_id).await.unwrap();
	assert_eq!(job.status, JobStatus::Completed);
	assert_eq!(job.attempts, 6);
	assert_eq!(job.priority, 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_terminal() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	transport.script("a", vec![Err(TransferError::Permanent("unsupported media".into()))]);
	let scheduler = Scheduler::start(&config(2, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	scheduler.wait_idle().await.unwrap();

	let job = scheduler.status(&job_id).await.unwrap();
	assert_eq!(job.status, JobStatus::Failed);
	assert_eq!(job.attempts, 1);
	assert_eq!(job.priority, 1);
	assert!(job.next_retry_at.is_none());
	assert_eq!(job.last_error.as_deref(), Some("unsupported media"));
	assert_eq!(transport.call_count(), 1);
	assert_eq!(scheduler.queue_stats().await.unwrap().failed, 1);
	assert_eq!(store.record(&job_id).unwrap().job.status, JobStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_job_can_be_retried_manually() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	transport.script("a", vec![transient("offline"), transient("offline")]);
	let scheduler = Scheduler::start(&config(1, 2), store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	scheduler.wait_idle().await.unwrap();

	let failed = scheduler.status(&job_id).await.unwrap();
	assert_eq!(failed.status, JobStatus::Failed);
	assert_eq!(failed.attempts, 2);

	scheduler.pause().await.unwrap();
	scheduler.retry(&job_id).await.unwrap();
	let reset = scheduler.status(&job_id).await.unwrap();
	assert_eq!(reset.status, JobStatus::Pending);
	assert_eq!(reset.attempts, 0);
	assert!(reset.next_retry_at.is_none());
	assert!(reset.last_error.is_none());

	scheduler.resume().await.unwrap();
	scheduler.wait_idle().await.unwrap();

	let done = scheduler.status(&job_id).await.unwrap();
	assert_eq!(done.status, JobStatus::Completed);
	assert_eq!(done.attempts, 1);
	assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_and_lookups_reject_bad_targets() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start_paused(&config(1, 5), store, transport).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	match scheduler.retry(&job_id).await {
		Err(SchedulerError::InvalidState { status: JobStatus::Pending, .. }) => {}
		other => panic!("expected InvalidState, got {other:?}"),
	}

	let unknown = JobId::from("job_missing");
	assert!(matches!(scheduler.status(&unknown).await, Err(SchedulerError::NotFound(_))));
	assert!(matches!(scheduler.cancel(&unknown).await, Err(SchedulerError::NotFound(_))));
	assert!(matches!(scheduler.retry(&unknown).await, Err(SchedulerError::NotFound(_))));
}

// ---------------------------------------------------------------------------
// Enqueue and cancel
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn enqueue_is_idempotent_per_artifact() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start_paused(&config(2, 5), store.clone(), transport).await.unwrap();

	let first = scheduler.enqueue(artifact("a")).await.unwrap();
	let again = scheduler.enqueue(artifact("a")).await.unwrap();
	assert_eq!(first, again);

	let mut tasks = Vec::new();
	for _ in 0..20 {
		let scheduler = scheduler.clone();
		tasks.push(tokio::spawn(async move { scheduler.enqueue(artifact("b")).await }));
	}
	let mut ids = Vec::new();
	for task in tasks {
		ids.push(task.await.unwrap().unwrap());
	}
	ids.dedup();
	assert_eq!(ids.len(), 1);

	let stats = scheduler.queue_stats().await.unwrap();
	assert_eq!(stats.pending, 2);
	assert_eq!(store.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn enqueue_replaces_failed_job() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	transport.script("a", vec![Err(TransferError::Permanent("rejected".into()))]);
	let scheduler = Scheduler::start(&config(1, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	scheduler.wait_idle().await.unwrap();
	assert_eq!(scheduler.status(&job_id).await.unwrap().status, JobStatus::Failed);

	assert_eq!(scheduler.enqueue(artifact("a")).await.unwrap(), job_id);
	scheduler.wait_idle().await.unwrap();

	let job = scheduler.status(&job_id).await.unwrap();
	assert_eq!(job.status, JobStatus::Completed);
	assert_eq!(job.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_uploading_discards_late_result() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(GatedTransport::new());
	let scheduler = Scheduler::start(&config(2, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	wait_for_status(&scheduler, &job_id, JobStatus::Uploading).await;

	scheduler.cancel(&job_id).await.unwrap();
	assert!(store.record(&job_id).is_none());
	assert!(matches!(scheduler.status(&job_id).await, Err(SchedulerError::NotFound(_))));

	// The artifact stays busy until the abandoned call returns.
	assert_eq!(scheduler.enqueue(artifact("a")).await.unwrap(), job_id);
	tokio::time::sleep(Duration::from_secs(1)).await;
	assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
	assert_eq!(scheduler.status(&job_id).await.unwrap().status, JobStatus::Pending);

	transport.gate.add_permits(2);
	scheduler.wait_idle().await.unwrap();

	assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
	let job = scheduler.status(&job_id).await.unwrap();
	assert_eq!(job.status, JobStatus::Completed);
	assert_eq!(job.attempts, 1);
	assert_eq!(scheduler.queue_stats().await.unwrap().completed, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_pending_job_removes_record() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start_paused(&config(2, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	scheduler.cancel(&job_id).await.unwrap();

	assert_eq!(store.len(), 0);
	scheduler.resume().await.unwrap();
	scheduler.wait_idle().await.unwrap();
	assert_eq!(transport.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_enqueue_write_leaves_no_job() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start_paused(&config(2, 5), store.clone(), transport).await.unwrap();

	store.fail_next_puts(1);
	assert!(matches!(scheduler.enqueue(artifact("a")).await, Err(SchedulerError::Store(_))));

	let job_id = JobId::for_artifact(&ArtifactId::from("a"));
	assert!(matches!(scheduler.status(&job_id).await, Err(SchedulerError::NotFound(_))));
	assert_eq!(scheduler.queue_stats().await.unwrap().pending, 0);

	// A later attempt goes through.
	assert_eq!(scheduler.enqueue(artifact("a")).await.unwrap(), job_id);
}

#[tokio::test(start_paused = true)]
async fn outcome_write_is_retried_before_notifying() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(100)));
	let scheduler = Scheduler::start(&config(1, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = JobId::for_artifact(&ArtifactId::from("a"));
	let events = record_events(&scheduler, &job_id);
	scheduler.enqueue(artifact("a")).await.unwrap();
	wait_for_status(&scheduler, &job_id, JobStatus::Uploading).await;

	store.fail_next_puts(1);
	let started = Instant::now();
	scheduler.wait_idle().await.unwrap();

	assert!(Instant::now() - started >= Duration::from_secs(1));
	assert_eq!(store.record(&job_id).unwrap().job.status, JobStatus::Completed);
	assert_eq!(transport.call_count(), 1);

	let completions = events.lock().iter().filter(|e| e.status == ProgressStatus::Completed).count();
	assert_eq!(completions, 1);
}

#[tokio::test(start_paused = true)]
async fn unsettled_outcome_holds_its_concurrency_slot() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(100)));
	let scheduler = Scheduler::start(&config(1, 5), store.clone(), transport.clone()).await.unwrap();

	let first = scheduler.enqueue(artifact("a")).await.unwrap();
	let second = scheduler.enqueue(artifact("b")).await.unwrap();
	wait_for_status(&scheduler, &first, JobStatus::Uploading).await;
	store.fail_next_puts(1);

	let mut peak = 0;
	for _ in 0..60 {
		peak = peak.max(scheduler.queue_stats().await.unwrap().uploading);
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	assert!(peak <= 1, "peak uploading {peak} with concurrency 1");

	scheduler.wait_idle().await.unwrap();
	let a_calls = transport.call_times("a");
	let b_calls = transport.call_times("b");
	assert_eq!((a_calls.len(), b_calls.len()), (1, 1));
	assert!(b_calls[0] - a_calls[0] >= Duration::from_secs(1));
	assert_eq!(scheduler.status(&first).await.unwrap().status, JobStatus::Completed);
	assert_eq!(scheduler.status(&second).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn failed_dispatch_write_is_retried_without_other_activity() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start_paused(&config(1, 5), store.clone(), transport.clone()).await.unwrap();

	let job_id = scheduler.enqueue(artifact("a")).await.unwrap();
	store.fail_next_puts(1);
	scheduler.resume().await.unwrap();

	tokio::time::timeout(Duration::from_secs(60), scheduler.wait_idle())
		.await
		.expect("queue stalled after a failed dispatch write")
		.unwrap();

	let job = scheduler.status(&job_id).await.unwrap();
	assert_eq!(job.status, JobStatus::Completed);
	assert_eq!(job.attempts, 1);
	assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_recovers_interrupted_uploads() {
	let store = Arc::new(MemoryStore::default());
	let now = Utc::now();

	let mut interrupted = TransferJob::new(ArtifactId::from("a"), 5, now);
	interrupted.begin_attempt(now).unwrap();

	let mut last_chance = TransferJob::new(ArtifactId::from("b"), 1, now);
	last_chance.begin_attempt(now).unwrap();

	let mut failed = TransferJob::new(ArtifactId::from("c"), 5, now);
	failed.begin_attempt(now).unwrap();
	failed.status = JobStatus::Failed;

	for (job, id) in [(&interrupted, "a"), (&last_chance, "b"), (&failed, "c")] {
		store.put(&JobRecord { job: job.clone(), artifact: artifact(id) }).await.unwrap();
	}

	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start_paused(&config(2, 5), store.clone(), transport.clone()).await.unwrap();

	let recovered = scheduler.status(&interrupted.id).await.unwrap();
	assert_eq!(recovered.status, JobStatus::Pending);
	assert_eq!(recovered.attempts, 1);
	assert_eq!(store.record(&interrupted.id).unwrap().job.status, JobStatus::Pending);

	let exhausted = scheduler.status(&last_chance.id).await.unwrap();
	assert_eq!(exhausted.status, JobStatus::Failed);
	assert!(exhausted.last_error.is_some());

	let stats = scheduler.queue_stats().await.unwrap();
	assert_eq!((stats.pending, stats.uploading, stats.failed), (1, 0, 2));

	scheduler.resume().await.unwrap();
	scheduler.wait_idle().await.unwrap();

	let done = scheduler.status(&interrupted.id).await.unwrap();
	assert_eq!(done.status, JobStatus::Completed);
	assert_eq!(done.attempts, 2);
	assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_handles() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let scheduler = Scheduler::start(&config(1, 5), store, transport).await.unwrap();

	scheduler.shutdown().await.unwrap();
	assert!(matches!(scheduler.enqueue(artifact("a")).await, Err(SchedulerError::Closed)));
}

#[tokio::test]
async fn rejects_invalid_config() {
	let store = Arc::new(MemoryStore::default());
	let transport = Arc::new(ScriptedTransport::default());
	let result = Scheduler::start(&config(0, 5), store, transport).await;
	assert!(matches!(result, Err(SchedulerError::Config(_))));
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn uploads_files_into_directory_remote() {
	let source = tempfile::tempdir().unwrap();
	let remote = tempfile::tempdir().unwrap();
	let path = source.path().join("shot.jpg");
	std::fs::write(&path, b"jpeg bytes").unwrap();

	let mut target = TargetMetadata::new();
	target.insert("folder".into(), "album/2026".into());
	let artifact = Artifact::from_file(&path, target).unwrap();

	let handle = db::in_memory().await.unwrap();
	let store = Arc::new(SurrealJobStore::new(handle));
	let transport = Arc::new(DirectoryTransport::new(remote.path()));
	let scheduler = Scheduler::start(&config(2, 5), store.clone(), transport).await.unwrap();

	let job_id = scheduler.enqueue(artifact).await.unwrap();
	scheduler.wait_idle().await.unwrap();

	let record = store.get(&job_id).await.unwrap().unwrap();
	assert_eq!(record.job.status, JobStatus::Completed);
	assert_eq!(record.job.remote_id.as_deref(), Some("album/2026/shot.jpg"));
	assert_eq!(std::fs::read(remote.path().join("album/2026/shot.jpg")).unwrap(), b"jpeg bytes");
}
