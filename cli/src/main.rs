use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use courier_core::{
	config::{CourierConfig, LoggingConfig},
	db,
	engine::{collect_artifacts, DirectoryTransport, ProgressStatus},
	models::{JobId, JobStatus, TargetMetadata, TransferJob},
	store::{JobStore, SurrealJobStore},
	Scheduler,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "courier", version, about = "Durable background uploads")]
struct Cli {
	/// Config file (TOML). Built-in defaults when omitted.
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Queue files or directory trees and upload them
	Upload {
		#[arg(required = true)]
		paths: Vec<PathBuf>,
		/// Target metadata, e.g. --meta folder=albums/2026
		#[arg(long = "meta", value_parser = parse_meta)]
		meta: Vec<(String, String)>,
	},
	/// Finish uploads left over from earlier runs
	Resume,
	/// Show one job, or every persisted job
	Status { job_id: Option<String> },
	/// Give a failed job a fresh set of attempts and upload it
	Retry { job_id: String },
	/// Drop a job and its persisted record
	Cancel { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let config = CourierConfig::load_or_default(cli.config.as_deref()).context("loading config")?;
	init_logging(&config.logging)?;

	match cli.command {
		Command::Upload { paths, meta } => upload(&config, paths, meta.into_iter().collect()).await,
		Command::Resume => resume(&config).await,
		Command::Status { job_id } => status(&config, job_id).await,
		Command::Retry { job_id } => retry(&config, JobId::from(job_id.as_str())).await,
		Command::Cancel { job_id } => cancel(&config, JobId::from(job_id.as_str())).await,
	}
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.filter))
		.context("invalid log filter")?;

	match &config.dir {
		Some(dir) => {
			std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
			let file_appender = tracing_appender::rolling::never(dir, "courier.log");
			tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer().with_writer(file_appender).with_ansi(false))
				.init();
		}
		None => {
			tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
				.init();
		}
	}
	Ok(())
}

async fn open_store(config: &CourierConfig) -> Result<Arc<SurrealJobStore>> {
	let handle = db::open(&config.store.path)
		.await
		.with_context(|| format!("opening job store at {}", config.store.path.display()))?;
	Ok(Arc::new(SurrealJobStore::new(handle)))
}

/// Recover persisted jobs without dispatching anything yet.
async fn start_paused(config: &CourierConfig) -> Result<Scheduler> {
	let store = open_store(config).await?;
	let transport = Arc::new(DirectoryTransport::new(&config.transport.remote_dir));
	let scheduler = Scheduler::start_paused(&config.scheduler, store, transport).await?;
	Ok(scheduler)
}

async fn upload(config: &CourierConfig, paths: Vec<PathBuf>, target: TargetMetadata) -> Result<()> {
	let scheduler = start_paused(config).await?;

	let mut job_ids = Vec::new();
	for path in &paths {
		let scan = collect_artifacts(path, &target).with_context(|| format!("scanning {}", path.display()))?;
		if scan.skipped_entries > 0 {
			println!("{} skipped {} entries under {}", style("!").yellow(), scan.skipped_entries, path.display());
		}
		for artifact in scan.artifacts {
			job_ids.push(scheduler.enqueue(artifact).await?);
		}
	}
	info!(jobs = job_ids.len(), "upload queued");

	run_to_idle(&scheduler).await?;
	let failed = report(&scheduler, &job_ids).await?;
	scheduler.shutdown().await?;

	if failed > 0 {
		bail!("{failed} of {} uploads failed", job_ids.len());
	}
	Ok(())
}

async fn resume(config: &CourierConfig) -> Result<()> {
	let scheduler = start_paused(config).await?;
	let stats = scheduler.queue_stats().await?;
	if stats.pending == 0 {
		println!("nothing to resume ({} failed)", stats.failed);
		return Ok(());
	}

	run_to_idle(&scheduler).await?;
	let stats = scheduler.queue_stats().await?;
	println!(
		"{} {} completed, {} failed",
		style("done").green().bold(),
		stats.completed,
		stats.failed
	);
	scheduler.shutdown().await?;
	Ok(())
}

async fn retry(config: &CourierConfig, job_id: JobId) -> Result<()> {
	let scheduler = start_paused(config).await?;
	scheduler.retry(&job_id).await?;

	run_to_idle(&scheduler).await?;
	let failed = report(&scheduler, std::slice::from_ref(&job_id)).await?;
	scheduler.shutdown().await?;

	if failed > 0 {
		bail!("retry of {job_id} failed");
	}
	Ok(())
}

async fn cancel(config: &CourierConfig, job_id: JobId) -> Result<()> {
	let scheduler = start_paused(config).await?;
	scheduler.cancel(&job_id).await?;
	scheduler.shutdown().await?;
	println!("{} cancelled {job_id}", style("✓").green());
	Ok(())
}

async fn status(config: &CourierConfig, job_id: Option<String>) -> Result<()> {
	let store = open_store(config).await?;

	match job_id {
		Some(id) => {
			let job_id = JobId::from(id.as_str());
			let Some(record) = store.get(&job_id).await? else {
				bail!("job not found: {job_id}");
			};
			println!("{}", describe(&record.job));
			println!("  artifact  {}", record.artifact.local_path.display());
			println!("  created   {}", record.job.created_at.to_rfc3339());
			if let Some(at) = record.job.next_retry_at {
				println!("  retry at  {}", at.to_rfc3339());
			}
			if let Some(remote_id) = &record.job.remote_id {
				println!("  remote    {remote_id}");
			}
		}
		None => {
			let records = store.list_all().await?;
			if records.is_empty() {
				println!("no jobs");
			}
			for record in &records {
				println!("{}  {}", describe(&record.job), style(record.artifact.local_path.display()).dim());
			}
		}
	}
	Ok(())
}

/// Resume dispatching and follow the progress feed until the queue drains.
async fn run_to_idle(scheduler: &Scheduler) -> Result<()> {
	let stats = scheduler.queue_stats().await?;
	let bar = ProgressBar::new((stats.pending + stats.uploading) as u64);
	bar.set_style(
		ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
			.progress_chars("=> "),
	);
	bar.enable_steady_tick(Duration::from_millis(120));

	let mut feed = scheduler.progress().feed();
	let follower = {
		let bar = bar.clone();
		tokio::spawn(async move {
			loop {
				match feed.recv().await {
					Ok(event) => {
						if event.is_terminal() {
							bar.inc(1);
						}
						match (event.status, &event.error) {
							(ProgressStatus::Failed, Some(error)) if !event.is_terminal() => {
								bar.set_message(format!("retrying {}: {error}", event.job_id));
							}
							_ => bar.set_message(format!("{} {}", event.job_id, status_word(event.status))),
						}
					}
					Err(RecvError::Lagged(_)) => continue,
					Err(RecvError::Closed) => break,
				}
			}
		})
	};

	scheduler.resume().await?;
	scheduler.wait_idle().await?;
	follower.abort();
	bar.finish_and_clear();
	Ok(())
}

/// Print the outcome of each job. Returns how many failed.
async fn report(scheduler: &Scheduler, job_ids: &[JobId]) -> Result<usize> {
	let mut failed = 0;
	for job_id in job_ids {
		let job = scheduler.status(job_id).await?;
		if job.status == JobStatus::Failed {
			failed += 1;
		}
		println!("{}", describe(&job));
	}
	Ok(failed)
}

fn describe(job: &TransferJob) -> String {
	let detail = match job.status {
		JobStatus::Completed => job.remote_id.clone().unwrap_or_default(),
		JobStatus::Failed => job.last_error.clone().unwrap_or_default(),
		_ => String::new(),
	};
	let status = match job.status {
		JobStatus::Completed => style(job.status.as_str()).green(),
		JobStatus::Failed => style(job.status.as_str()).red(),
		_ => style(job.status.as_str()).yellow(),
	};
	format!(
		"{}  {:<10} attempts {}/{}  {}",
		job.id, status, job.attempts, job.max_attempts, detail
	)
}

fn status_word(status: ProgressStatus) -> &'static str {
	match status {
		ProgressStatus::Uploading => "uploading",
		ProgressStatus::Completed => "done",
		ProgressStatus::Failed => "failed",
	}
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
	let (key, value) = raw
		.split_once('=')
		.ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
	let key = key.trim();
	if key.is_empty() {
		return Err(format!("empty key in {raw:?}"));
	}
	Ok((key.to_string(), value.to_string()))
}
