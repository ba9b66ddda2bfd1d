//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use statcrunch_core::{CrunchError, FailureKind};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Failed terminally or exhausted retries; never picked up again
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, JobStatus::Failed { .. })
    }

    /// Stored representation (`jobs.status`).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::DeadLettered { .. } => "dead_lettered",
        }
    }

    /// Inverse of [`JobStatus::as_str`], given the stored error and attempt.
    pub fn from_stored(status: &str, last_error: Option<String>, attempt: u32) -> Option<Self> {
        let error = || last_error.clone().unwrap_or_default();
        Some(match status {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed {
                error: error(),
                attempt,
            },
            "dead_lettered" => JobStatus::DeadLettered {
                error: error(),
                attempts: attempt,
            },
            _ => return None,
        })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Default exponential policy with a different attempt limit.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exp = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(exp)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Why a job attempt failed, and whether it may run again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?} failure: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == FailureKind::Terminal
    }
}

impl From<CrunchError> for JobFailure {
    fn from(err: CrunchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Routing key; a worker only claims jobs of its own type
    pub job_type: String,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Higher runs first
    pub priority: i32,
    /// Current status
    pub status: JobStatus,
    /// Number of attempts started so far
    pub attempt: u32,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last updated
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant (retry backoff)
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            status: JobStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Check if the job may be claimed now.
    pub fn is_ready(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed { .. })
            && self.scheduled_at.is_none_or(|at| Utc::now() >= at)
    }

    /// A running job whose claim is older than `lease` was abandoned by its
    /// worker (crash, lost connection) and may be reclaimed.
    pub fn lease_expired(&self, lease: Duration) -> bool {
        self.status == JobStatus::Running
            && (Utc::now() - self.updated_at)
                .to_std()
                .is_ok_and(|age| age >= lease)
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.scheduled_at = None;
        self.updated_at = Utc::now();
    }

    /// Mark job as failed.
    ///
    /// Terminal failures are dead-lettered immediately; retryable ones are
    /// rescheduled with backoff until the policy runs out of attempts.
    pub fn mark_failed(&mut self, failure: &JobFailure, policy: &RetryPolicy) {
        let now = Utc::now();
        self.updated_at = now;

        if !failure.is_terminal() && policy.should_retry(self.attempt) {
            let delay = policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error: failure.message.clone(),
                attempt: self.attempt,
            };
        } else {
            self.scheduled_at = None;
            self.status = JobStatus::DeadLettered {
                error: failure.message.clone(),
                attempts: self.attempt,
            };
        }
    }
}

/// Result of running one job through a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(3);

        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn terminal_failure_dead_letters_on_first_attempt() {
        let mut job = Job::new("crunch", serde_json::json!({"dimension": 1}));
        job.mark_running();
        job.mark_failed(&JobFailure::terminal("dimension 1 not found"), &RetryPolicy::default());

        assert_eq!(
            job.status,
            JobStatus::DeadLettered {
                error: "dimension 1 not found".to_string(),
                attempts: 1
            }
        );
        assert!(!job.is_ready());
    }

    #[test]
    fn retryable_failure_is_rescheduled_until_exhausted() {
        let policy = RetryPolicy::with_max_attempts(2);
        let mut job = Job::new("crunch", serde_json::json!({}));

        job.mark_running();
        job.mark_failed(&JobFailure::retryable("connection reset"), &policy);
        assert!(job.status.is_retriable());
        assert!(job.scheduled_at.is_some());

        job.mark_running();
        job.mark_failed(&JobFailure::retryable("connection reset"), &policy);
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
    }

    #[test]
    fn stored_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed {
                error: "e".to_string(),
                attempt: 2,
            },
            JobStatus::DeadLettered {
                error: "e".to_string(),
                attempts: 2,
            },
        ] {
            let restored = JobStatus::from_stored(status.as_str(), Some("e".to_string()), 2);
            assert_eq!(restored, Some(status));
        }
        assert_eq!(JobStatus::from_stored("exploded", None, 0), None);
    }

    #[test]
    fn crunch_errors_keep_their_classification() {
        let failure = JobFailure::from(CrunchError::transient("deadlock detected"));
        assert_eq!(failure.kind, FailureKind::Retryable);

        let failure = JobFailure::from(CrunchError::unsupported("team"));
        assert!(failure.is_terminal());
        assert_eq!(failure.message, "unsupported dimension target 'team'");
    }
}
