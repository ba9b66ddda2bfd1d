//! Background job system with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are typed by a routing key; a worker claims only its own type
//! - Retry policy with exponential backoff for retryable failures
//! - Terminal failures and exhausted retries are dead-lettered
//! - Claims carry a lease; a job left running past it is failed and retried
//! - One job at a time per worker, driven through windup, execute, teardown
//!
//! ## Components
//!
//! - `Job`: queued unit of work with payload and metadata
//! - `JobQueue`: persistence for jobs (in-memory or Postgres)
//! - `Worker`: per-job lifecycle hooks
//! - `WorkerRunner`: claims jobs and reports outcomes back to the queue

pub mod postgres;
pub mod queue;
pub mod runner;
pub mod types;

pub use postgres::PgJobQueue;
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, QueueStats, DEFAULT_LEASE};
pub use runner::{RunnerStats, Worker, WorkerRunner};
pub use types::{
    BackoffStrategy, Job, JobFailure, JobId, JobOutcome, JobStatus, RetryPolicy,
};
