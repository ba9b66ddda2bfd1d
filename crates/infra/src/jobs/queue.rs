//! Job queue abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::types::{Job, JobFailure, JobId, JobStatus, RetryPolicy};

/// How long a claim stays valid before a running job counts as abandoned.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(15 * 60);

/// Failure recorded against a job whose claim lapsed.
pub(crate) const LEASE_EXPIRED: &str = "lease expired: worker stopped reporting";

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable queue of jobs, shared between producers and workers.
///
/// The queue owns the retry policy: [`JobQueue::fail`] decides from the
/// failure kind and the attempt count whether the job runs again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError>;

    /// Claim up to `limit` ready jobs of `job_type`, highest priority first
    /// then oldest, and mark them running.
    ///
    /// Running jobs whose lease has lapsed are first failed as retryable, so
    /// the retry policy decides whether they run again.
    async fn claim(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Record a successful run.
    async fn complete(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Record a failed run and return the job's resulting status.
    async fn fail(&self, job_id: JobId, failure: &JobFailure) -> Result<JobStatus, QueueError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Release connections held by the queue.
    async fn close(&self) {}
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        (**self).enqueue(job).await
    }

    async fn claim(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, QueueError> {
        (**self).claim(job_type, limit).await
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        (**self).complete(job_id).await
    }

    async fn fail(&self, job_id: JobId, failure: &JobFailure) -> Result<JobStatus, QueueError> {
        (**self).fail(job_id, failure).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        (**self).get(job_id).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory job queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
    retry_policy: RetryPolicy,
    lease: Duration,
}

impl InMemoryJobQueue {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retry_policy,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn arc(retry_policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(retry_policy))
    }

    /// Make a rescheduled job claimable right away (skips backoff).
    pub fn expire_backoff(&self, job_id: JobId) {
        if let Some(job) = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&job_id)
        {
            job.scheduled_at = None;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let mut jobs = self.jobs.write().map_err(lock_poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn claim(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.jobs.write().map_err(lock_poisoned)?;

        let lapsed = JobFailure::retryable(LEASE_EXPIRED);
        for job in jobs.values_mut() {
            if job.job_type == job_type && job.lease_expired(self.lease) {
                job.mark_failed(&lapsed, &self.retry_policy);
            }
        }

        let mut candidates: Vec<(i32, chrono::DateTime<chrono::Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.job_type == job_type && j.is_ready())
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();

        // Highest priority first, FIFO within a priority.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_running();
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().map_err(lock_poisoned)?;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.mark_completed();
        Ok(())
    }

    async fn fail(&self, job_id: JobId, failure: &JobFailure) -> Result<JobStatus, QueueError> {
        let mut jobs = self.jobs.write().map_err(lock_poisoned)?;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.mark_failed(failure, &self.retry_policy);
        Ok(job.status.clone())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let jobs = self.jobs.read().map_err(lock_poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }
}

fn lock_poisoned<T>(_: PoisonError<T>) -> QueueError {
    QueueError::Storage("lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_claim() {
        let queue = InMemoryJobQueue::default();

        let job = Job::new("crunch", serde_json::json!({"dimension": 1}));
        let job_id = queue.enqueue(job).await.unwrap();

        let claimed = queue.claim("crunch", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job_id);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert_eq!(claimed[0].attempt, 1);

        // No more jobs
        assert!(queue.claim("crunch", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_type_priority_and_limit() {
        let queue = InMemoryJobQueue::default();
        queue
            .enqueue(Job::new("other", serde_json::json!({})).with_priority(100))
            .await
            .unwrap();
        let low = queue
            .enqueue(Job::new("crunch", serde_json::json!({})))
            .await
            .unwrap();
        let high = queue
            .enqueue(Job::new("crunch", serde_json::json!({})).with_priority(5))
            .await
            .unwrap();

        let first = queue.claim("crunch", 1).await.unwrap();
        assert_eq!(first[0].id, high);
        let second = queue.claim("crunch", 1).await.unwrap();
        assert_eq!(second[0].id, low);
        assert!(queue.claim("crunch", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let queue = InMemoryJobQueue::default();
        let job = Job::new("crunch", serde_json::json!({}));
        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(
            queue.enqueue(job.clone()).await,
            Err(QueueError::AlreadyExists(job.id))
        );
    }

    #[tokio::test]
    async fn retryable_failure_waits_for_backoff() {
        let queue = InMemoryJobQueue::new(RetryPolicy::fixed(3, Duration::from_secs(60)));
        let id = queue
            .enqueue(Job::new("crunch", serde_json::json!({})))
            .await
            .unwrap();

        queue.claim("crunch", 1).await.unwrap();
        let status = queue
            .fail(id, &JobFailure::retryable("timeout"))
            .await
            .unwrap();
        assert!(status.is_retriable());

        // Backoff not elapsed yet
        assert!(queue.claim("crunch", 1).await.unwrap().is_empty());

        queue.expire_backoff(id);
        let again = queue.claim("crunch", 1).await.unwrap();
        assert_eq!(again[0].attempt, 2);
    }

    #[tokio::test]
    async fn abandoned_claim_is_reclaimed_after_lease() {
        let queue = InMemoryJobQueue::new(RetryPolicy::fixed(3, Duration::ZERO))
            .with_lease(Duration::ZERO);
        let id = queue
            .enqueue(Job::new("crunch", serde_json::json!({})))
            .await
            .unwrap();

        let first = queue.claim("crunch", 1).await.unwrap();
        assert_eq!(first[0].attempt, 1);

        // The first claimant never reports back.
        let again = queue.claim("crunch", 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].attempt, 2);
        assert_eq!(again[0].status, JobStatus::Running);
    }

    #[tokio::test]
    async fn live_claim_is_not_reclaimed() {
        let queue = InMemoryJobQueue::default();
        queue
            .enqueue(Job::new("crunch", serde_json::json!({})))
            .await
            .unwrap();

        queue.claim("crunch", 1).await.unwrap();

        assert!(queue.claim("crunch", 1).await.unwrap().is_empty());
        assert_eq!(queue.stats().running, 1);
    }

    #[tokio::test]
    async fn repeatedly_abandoned_job_is_dead_lettered() {
        let queue = InMemoryJobQueue::new(RetryPolicy::fixed(2, Duration::ZERO))
            .with_lease(Duration::ZERO);
        let id = queue
            .enqueue(Job::new("crunch", serde_json::json!({})))
            .await
            .unwrap();

        queue.claim("crunch", 1).await.unwrap();
        queue.claim("crunch", 1).await.unwrap();
        assert!(queue.claim("crunch", 1).await.unwrap().is_empty());

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(
            job.status,
            JobStatus::DeadLettered {
                error: LEASE_EXPIRED.to_string(),
                attempts: 2,
            }
        );
    }

    #[tokio::test]
    async fn stats_tracking() {
        let queue = InMemoryJobQueue::default();
        for i in 0..3 {
            queue
                .enqueue(Job::new("crunch", serde_json::json!({"dimension": i})))
                .await
                .unwrap();
        }

        let claimed = queue.claim("crunch", 2).await.unwrap();
        queue.complete(claimed[0].id).await.unwrap();
        queue
            .fail(claimed[1].id, &JobFailure::terminal("bad dimension"))
            .await
            .unwrap();

        assert_eq!(
            queue.stats(),
            QueueStats {
                pending: 1,
                running: 0,
                completed: 1,
                failed: 0,
                dead_lettered: 1,
            }
        );
    }
}
