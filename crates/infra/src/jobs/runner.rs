//! Worker runner: claims jobs and drives a [`Worker`] through each one.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{JobQueue, QueueError};
use super::types::{Job, JobFailure, JobId, JobOutcome};

/// A unit of work driven by [`WorkerRunner`].
///
/// For every claimed job the runner calls `windup`, then `execute_job`, then
/// `teardown` exactly once with `failed` set when either earlier step failed.
/// Workers hold per-job state (an open transaction) between those calls, so
/// the runner never interleaves two jobs on one worker.
#[async_trait]
pub trait Worker: Send {
    /// Job type this worker claims.
    fn job_type(&self) -> &str;

    /// Acquire per-job resources.
    async fn windup(&mut self) -> Result<(), JobFailure>;

    /// Run one job.
    async fn execute_job(
        &mut self,
        job_id: JobId,
        payload: &Value,
        priority: i32,
    ) -> Result<(), JobFailure>;

    /// Release per-job resources, committing on success.
    async fn teardown(&mut self, failed: bool) -> Result<(), JobFailure>;

    /// Release everything before the process exits.
    async fn shutdown(&mut self) {}
}

/// Runner statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunnerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
}

/// Polls a queue and feeds claimed jobs to one worker, one job at a time.
pub struct WorkerRunner<Q, W> {
    queue: Q,
    worker: W,
    poll_interval: Duration,
    stats: RunnerStats,
}

impl<Q, W> WorkerRunner<Q, W>
where
    Q: JobQueue,
    W: Worker,
{
    /// Bind a worker to an already connected queue.
    pub fn connect(queue: Q, worker: W, poll_interval: Duration) -> Self {
        Self {
            queue,
            worker,
            poll_interval,
            stats: RunnerStats::default(),
        }
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// The in-flight job always finishes, including its teardown, before the
    /// loop observes the signal.
    pub async fn start(mut self, batch_limit: usize, mut shutdown: watch::Receiver<bool>) -> RunnerStats {
        let batch_limit = batch_limit.max(1);
        info!(
            job_type = %self.worker.job_type(),
            batch_limit,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "worker started"
        );

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            let idle = match self.run_once(batch_limit).await {
                Ok(0) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.worker.shutdown().await;
        self.queue.close().await;

        info!(
            processed = self.stats.jobs_processed,
            succeeded = self.stats.jobs_succeeded,
            retried = self.stats.jobs_retried,
            failed = self.stats.jobs_failed,
            "worker stopped"
        );
        self.stats
    }

    /// Claim up to `batch_limit` jobs and process them in order.
    ///
    /// Returns how many jobs were processed.
    pub async fn run_once(&mut self, batch_limit: usize) -> Result<usize, QueueError> {
        let job_type = self.worker.job_type().to_string();
        let jobs = self.queue.claim(&job_type, batch_limit).await?;
        for job in &jobs {
            debug!(job_id = %job.id, priority = job.priority, "claimed job");
            self.process(job).await;
        }
        Ok(jobs.len())
    }

    /// Drive one claimed job through the worker and report the outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt))]
    pub async fn process(&mut self, job: &Job) -> JobOutcome {
        let result = match self.worker.windup().await {
            Ok(()) => {
                self.worker
                    .execute_job(job.id, &job.payload, job.priority)
                    .await
            }
            Err(failure) => Err(failure),
        };

        let teardown = self.worker.teardown(result.is_err()).await;

        let outcome = match (result, teardown) {
            (Ok(()), Ok(())) => JobOutcome::Completed,
            // The worker classifies its own commit failure.
            (Ok(()), Err(failure)) => JobOutcome::Failed(failure),
            (Err(failure), Ok(())) => JobOutcome::Failed(failure),
            (Err(failure), Err(rollback)) => {
                warn!(error = %rollback.message, "teardown after failure also failed");
                JobOutcome::Failed(failure)
            }
        };

        self.stats.jobs_processed += 1;
        self.report(job.id, &outcome).await;
        outcome
    }

    async fn report(&mut self, job_id: JobId, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => {
                self.stats.jobs_succeeded += 1;
                match self.queue.complete(job_id).await {
                    Ok(()) => info!(%job_id, "job completed"),
                    Err(e) => error!(%job_id, error = %e, "failed to mark job completed"),
                }
            }
            JobOutcome::Failed(failure) => match self.queue.fail(job_id, failure).await {
                Ok(status) if status.is_retriable() => {
                    self.stats.jobs_retried += 1;
                    warn!(%job_id, kind = ?failure.kind, error = %failure.message, "job failed, will retry");
                }
                Ok(_) => {
                    self.stats.jobs_failed += 1;
                    error!(%job_id, kind = ?failure.kind, error = %failure.message, "job failed permanently");
                }
                Err(e) => {
                    self.stats.jobs_failed += 1;
                    error!(%job_id, error = %e, "failed to record job failure");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::types::{JobStatus, RetryPolicy};

    #[derive(Default)]
    struct Script {
        windup: Option<JobFailure>,
        execute: Option<JobFailure>,
        teardown: Option<JobFailure>,
    }

    struct ScriptedWorker {
        script: Script,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedWorker {
        fn new(script: Script) -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    script,
                    calls: calls.clone(),
                },
                calls,
            )
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn job_type(&self) -> &str {
            "crunch"
        }

        async fn windup(&mut self) -> Result<(), JobFailure> {
            self.record("windup");
            self.script.windup.clone().map_or(Ok(()), Err)
        }

        async fn execute_job(
            &mut self,
            _job_id: JobId,
            payload: &Value,
            _priority: i32,
        ) -> Result<(), JobFailure> {
            self.record(format!("execute {payload}"));
            self.script.execute.clone().map_or(Ok(()), Err)
        }

        async fn teardown(&mut self, failed: bool) -> Result<(), JobFailure> {
            self.record(format!("teardown failed={failed}"));
            self.script.teardown.clone().map_or(Ok(()), Err)
        }

        async fn shutdown(&mut self) {
            self.record("shutdown");
        }
    }

    async fn runner_with(
        script: Script,
        policy: RetryPolicy,
    ) -> (
        WorkerRunner<Arc<InMemoryJobQueue>, ScriptedWorker>,
        Arc<Mutex<Vec<String>>>,
        JobId,
    ) {
        let queue = InMemoryJobQueue::arc(policy);
        let id = queue
            .enqueue(Job::new("crunch", serde_json::json!({"dimension": 7})))
            .await
            .unwrap();
        let (worker, calls) = ScriptedWorker::new(script);
        (
            WorkerRunner::connect(queue, worker, Duration::from_millis(5)),
            calls,
            id,
        )
    }

    #[tokio::test]
    async fn successful_job_commits_and_completes() {
        let (mut runner, calls, id) = runner_with(Script::default(), RetryPolicy::default()).await;

        assert_eq!(runner.run_once(1).await.unwrap(), 1);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["windup", r#"execute {"dimension":7}"#, "teardown failed=false"]
        );
        let job = runner.queue().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            runner.stats(),
            &RunnerStats {
                jobs_processed: 1,
                jobs_succeeded: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn terminal_failure_rolls_back_and_dead_letters() {
        let script = Script {
            execute: Some(JobFailure::terminal("dimension 7 not found")),
            ..Default::default()
        };
        let (mut runner, calls, id) = runner_with(script, RetryPolicy::default()).await;

        runner.run_once(1).await.unwrap();

        assert_eq!(calls.lock().unwrap().last().unwrap(), "teardown failed=true");
        let job = runner.queue().get(id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 1, .. }));
        assert_eq!(runner.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn retryable_failure_is_rescheduled() {
        let script = Script {
            execute: Some(JobFailure::retryable("deadlock detected")),
            ..Default::default()
        };
        let (mut runner, _calls, id) = runner_with(script, RetryPolicy::default()).await;

        runner.run_once(1).await.unwrap();

        let job = runner.queue().get(id).await.unwrap().unwrap();
        assert!(job.status.is_retriable());
        assert_eq!(runner.stats().jobs_retried, 1);
    }

    #[tokio::test]
    async fn failed_windup_skips_execution() {
        let script = Script {
            windup: Some(JobFailure::retryable("connection refused")),
            ..Default::default()
        };
        let (mut runner, calls, _id) = runner_with(script, RetryPolicy::default()).await;

        runner.run_once(1).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["windup", "teardown failed=true"]);
    }

    #[tokio::test]
    async fn terminal_commit_failure_after_success_is_dead_lettered() {
        let script = Script {
            teardown: Some(JobFailure::terminal("deferred constraint violated")),
            ..Default::default()
        };
        let (mut runner, _calls, id) = runner_with(script, RetryPolicy::default()).await;

        let outcome = runner.run_once(1).await.unwrap();

        assert_eq!(outcome, 1);
        let job = runner.queue().get(id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 1, .. }));
        assert_eq!(runner.stats().jobs_failed, 1);
        assert_eq!(runner.stats().jobs_retried, 0);
    }

    #[tokio::test]
    async fn retryable_commit_failure_after_success_is_rescheduled() {
        let script = Script {
            teardown: Some(JobFailure::retryable("connection reset during commit")),
            ..Default::default()
        };
        let (mut runner, _calls, id) = runner_with(script, RetryPolicy::default()).await;

        runner.run_once(1).await.unwrap();

        let job = runner.queue().get(id).await.unwrap().unwrap();
        assert!(job.status.is_retriable());
        assert_eq!(runner.stats().jobs_retried, 1);
    }

    #[tokio::test]
    async fn start_drains_and_shuts_down_on_signal() {
        let (runner, calls, id) = runner_with(Script::default(), RetryPolicy::default()).await;
        let queue = runner.queue().clone();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(runner.start(1, rx));

        for _ in 0..200 {
            if queue.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(calls.lock().unwrap().last().unwrap(), "shutdown");
    }
}
