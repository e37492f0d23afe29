use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::artifact::ArtifactId;

/// Job identity. One job per artifact, so the id is a pure function of the artifact id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn for_artifact(artifact_id: &ArtifactId) -> Self {
        let digest = blake3::hash(artifact_id.as_str().as_bytes());
        Self(format!("job_{}", &digest.to_hex()[..20]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "uploading" => Some(JobStatus::Uploading),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a failed attempt was classified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(FailureKind::Transient),
            "permanent" => Some(FailureKind::Permanent),
            _ => None,
        }
    }
}

/// Retry budget, backoff schedule and priority ceiling applied to every job.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub priority_cap: u32,
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts already made.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let Some(last) = self.backoff.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempts.saturating_sub(1) as usize).min(last);
        self.backoff[index]
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: [1, 2, 4, 8, 16].into_iter().map(Duration::from_secs).collect(),
            priority_cap: 10,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("cannot {action} a job in status {status}")]
pub struct InvalidTransition {
    pub action: &'static str,
    pub status: JobStatus,
}

/// What a failed attempt did to the job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureOutcome {
    /// Back to pending; eligible again after the delay.
    RetryScheduled(Duration),
    /// Terminal until a manual retry.
    Exhausted,
}

/// Lifecycle record of one artifact's upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferJob {
    pub id: JobId,
    pub artifact_id: ArtifactId,
    pub status: JobStatus,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub remote_id: Option<String>,
}

impl TransferJob {
    pub fn new(artifact_id: ArtifactId, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::for_artifact(&artifact_id),
            artifact_id,
            status: JobStatus::Pending,
            priority: 1,
            created_at: now,
            last_attempt_at: None,
            next_retry_at: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            error_kind: None,
            remote_id: None,
        }
    }

    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Pending || self.attempts >= self.max_attempts {
            return Err(InvalidTransition { action: "start", status: self.status });
        }
        self.status = JobStatus::Uploading;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.next_retry_at = None;
        Ok(())
    }

    pub fn complete(&mut self, remote_id: String) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Uploading {
            return Err(InvalidTransition { action: "complete", status: self.status });
        }
        self.status = JobStatus::Completed;
        self.remote_id = Some(remote_id);
        self.next_retry_at = None;
        self.last_error = None;
        self.error_kind = None;
        Ok(())
    }

    /// Apply a failed attempt. Transient failures raise the priority and, while the
    /// budget lasts, schedule another attempt. Permanent failures are terminal at once.
    pub fn fail(
        &mut self,
        kind: FailureKind,
        message: String,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, InvalidTransition> {
        if self.status != JobStatus::Uploading {
            return Err(InvalidTransition { action: "fail", status: self.status });
        }
        self.last_error = Some(message);
        self.error_kind = Some(kind);

        if kind == FailureKind::Transient {
            self.priority = (self.priority + 1).min(policy.priority_cap.max(self.priority));
            if self.attempts < self.max_attempts {
                let delay = policy.delay_for(self.attempts);
                self.status = JobStatus::Pending;
                self.next_retry_at = Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
                return Ok(FailureOutcome::RetryScheduled(delay));
            }
        }

        self.status = JobStatus::Failed;
        self.next_retry_at = None;
        Ok(FailureOutcome::Exhausted)
    }

    /// Manual retry of a failed job: fresh budget, eligible immediately.
    pub fn reset_for_retry(&mut self) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Failed {
            return Err(InvalidTransition { action: "retry", status: self.status });
        }
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.next_retry_at = None;
        self.last_error = None;
        self.error_kind = None;
        Ok(())
    }

    /// No attempt survives a restart. Returns true when the record changed.
    pub fn recover_after_restart(&mut self) -> bool {
        if self.status != JobStatus::Uploading {
            return false;
        }
        if self.attempts >= self.max_attempts {
            self.status = JobStatus::Failed;
            self.last_error = Some("attempt interrupted by restart".to_string());
            self.error_kind = Some(FailureKind::Transient);
        } else {
            self.status = JobStatus::Pending;
        }
        self.next_retry_at = None;
        true
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, ..RetryPolicy::default() }
    }

    fn job(max_attempts: u32) -> TransferJob {
        TransferJob::new(ArtifactId::from("scan-001"), max_attempts, Utc::now())
    }

    #[test]
    fn job_id_is_stable_per_artifact() {
        let a = JobId::for_artifact(&ArtifactId::from("photo-7"));
        let b = JobId::for_artifact(&ArtifactId::from("photo-7"));
        let c = JobId::for_artifact(&ArtifactId::from("photo-8"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("job_"));
    }

    #[test]
    fn backoff_index_clamps_to_last_delay() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(5), Duration::from_secs(16));
        assert_eq!(p.delay_for(9), Duration::from_secs(16));
    }

    #[test]
    fn attempt_start_counts_once() {
        let mut j = job(5);
        let now = Utc::now();
        j.begin_attempt(now).unwrap();
        assert_eq!(j.status, JobStatus::Uploading);
        assert_eq!(j.attempts, 1);
        assert_eq!(j.last_attempt_at, Some(now));

        // A second start without an outcome is rejected.
        assert!(j.begin_attempt(now).is_err());
        assert_eq!(j.attempts, 1);
    }

    #[test]
    fn transient_failure_schedules_retry_and_raises_priority() {
        let mut j = job(5);
        let now = Utc::now();
        j.begin_attempt(now).unwrap();
        let outcome = j.fail(FailureKind::Transient, "timeout".into(), &policy(5), now).unwrap();

        assert_eq!(outcome, FailureOutcome::RetryScheduled(Duration::from_secs(1)));
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.priority, 2);
        assert_eq!(j.next_retry_at, Some(now + chrono::Duration::seconds(1)));
        assert_eq!(j.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn priority_stops_at_cap() {
        let p = RetryPolicy { max_attempts: 20, priority_cap: 3, ..RetryPolicy::default() };
        let mut j = job(20);
        for _ in 0..6 {
            j.begin_attempt(Utc::now()).unwrap();
            j.fail(FailureKind::Transient, "503".into(), &p, Utc::now()).unwrap();
        }
        assert_eq!(j.priority, 3);
    }

    #[test]
    fn permanent_failure_is_terminal_immediately() {
        let mut j = job(5);
        j.begin_attempt(Utc::now()).unwrap();
        let outcome = j.fail(FailureKind::Permanent, "rejected".into(), &policy(5), Utc::now()).unwrap();

        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.attempts, 1);
        assert_eq!(j.priority, 1);
        assert!(j.next_retry_at.is_none());
    }

    #[test]
    fn budget_exhaustion_then_manual_retry() {
        let p = policy(2);
        let mut j = job(2);
        for _ in 0..2 {
            j.begin_attempt(Utc::now()).unwrap();
            j.fail(FailureKind::Transient, "reset".into(), &p, Utc::now()).unwrap();
        }
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.attempts, 2);
        assert!(j.begin_attempt(Utc::now()).is_err());

        j.reset_for_retry().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.attempts, 0);
        assert!(j.next_retry_at.is_none());
        assert!(j.last_error.is_none());
        // Priority never goes back down.
        assert_eq!(j.priority, 3);
    }

    #[test]
    fn retry_rejected_unless_failed() {
        let mut j = job(5);
        assert_eq!(
            j.reset_for_retry(),
            Err(InvalidTransition { action: "retry", status: JobStatus::Pending })
        );
    }

    #[test]
    fn completion_records_remote_id() {
        let mut j = job(5);
        j.begin_attempt(Utc::now()).unwrap();
        j.complete("remote/abc".into()).unwrap();
        assert_eq!(j.status, JobStatus::Completed);
        assert_eq!(j.remote_id.as_deref(), Some("remote/abc"));
    }

    #[test]
    fn restart_recovery() {
        let mut j = job(3);
        j.begin_attempt(Utc::now()).unwrap();
        assert!(j.recover_after_restart());
        assert_eq!(j.status, JobStatus::Pending);
        assert!(j.next_retry_at.is_none());
        assert!(!j.recover_after_restart());

        let mut spent = job(1);
        spent.begin_attempt(Utc::now()).unwrap();
        assert!(spent.recover_after_restart());
        assert_eq!(spent.status, JobStatus::Failed);
    }
}
