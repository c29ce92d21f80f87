use common::{config::ServiceConfig, http_client::HttpClient, ServiceResult};
use models::{JobOutcome, ProcessJobRequest, ProcessJobResponse, WorkerResponse};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::store::JobStore;

/// Hard cap on jobs attempted in one worker run.
pub const MAX_JOBS_PER_RUN: usize = 5;

/// Soft wall-clock budget. The hosting runtime kills invocations at 60s;
/// stopping at 50s leaves room to return a summary instead of being killed.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(50);

/// Pause between iterations so a burst of pending jobs does not hammer
/// the database and the processor back to back.
const ITERATION_PAUSE: Duration = Duration::from_millis(100);

/// A job stuck in processing longer than this is treated as abandoned by a
/// crashed worker and handed back to the queue.
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Deadline on each delegated processor call, well inside the run budget.
const PROCESSOR_CALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Per-run budget: a job count and a wall-clock deadline, whichever is
/// exhausted first ends the loop.
#[derive(Debug, Clone, Copy)]
pub struct WorkerBudget {
    pub max_jobs: usize,
    pub timeout: Duration,
}

impl Default for WorkerBudget {
    fn default() -> Self {
        Self {
            max_jobs: MAX_JOBS_PER_RUN,
            timeout: WORKER_TIMEOUT,
        }
    }
}

impl WorkerBudget {
    pub fn exhausted(&self, jobs_processed: usize, elapsed: Duration) -> bool {
        jobs_processed >= self.max_jobs || elapsed >= self.timeout
    }
}

/// True once the claim that just happened pushed the job past its ceiling.
/// Claiming increments the counter and a successful batch resets it, so
/// this only trips after `max_attempts` consecutive claims with nothing
/// completed in between.
pub fn attempt_limit_exceeded(attempts: i32, max_attempts: i32) -> bool {
    attempts > max_attempts
}

/// One worker run: reclaim stale jobs, then claim and delegate pending jobs
/// until the budget runs out or the queue is empty.
///
/// Jobs are resumable: the processor does one bounded batch per call and
/// leaves unfinished jobs pending, so repeated runs converge the queue to
/// empty rather than any single run finishing everything.
pub async fn run_worker(
    store: &JobStore,
    http_client: &HttpClient,
    config: &ServiceConfig,
    budget: WorkerBudget,
) -> ServiceResult<WorkerResponse> {
    let started = Instant::now();

    let reclaimed = store.reclaim_stale(STALE_AFTER).await?;
    if reclaimed > 0 {
        info!("Reclaimed {} stale jobs back to pending", reclaimed);
    }

    let processor_url = format!(
        "{}/api/v1/sync/process",
        config.service_url("sync-processor")
    );

    let mut jobs: Vec<JobOutcome> = Vec::new();

    while !budget.exhausted(jobs.len(), started.elapsed()) {
        let job = match store.claim_next_job().await? {
            Some(job) => job,
            None => break,
        };

        // The claim itself counted this attempt. Past the ceiling the job
        // is cut off before another delegation is wasted on it.
        if attempt_limit_exceeded(job.attempts, job.max_attempts) {
            let message = format!(
                "attempt limit exceeded ({} of {})",
                job.attempts, job.max_attempts
            );
            warn!("Job {} failed terminally: {}", job.id, message);
            store.fail_job(job.id, &message).await?;
            jobs.push(JobOutcome {
                job_id: job.id,
                status: "failed".to_string(),
                progress: None,
                error: Some(message),
            });
            continue;
        }

        info!(
            "Dispatching job {} (mailbox {}, attempt {})",
            job.id, job.mailbox_id, job.attempts
        );

        let request = ProcessJobRequest { job_id: job.id };
        match http_client
            .post_with_timeout::<_, ProcessJobResponse>(
                &processor_url,
                &request,
                PROCESSOR_CALL_TIMEOUT,
            )
            .await
        {
            Ok(response) => {
                let status = if response.completed { "completed" } else { "pending" };
                info!("Job {} batch done: {}", job.id, status);
                jobs.push(JobOutcome {
                    job_id: job.id,
                    status: status.to_string(),
                    progress: Some(response.progress),
                    error: None,
                });
            }
            Err(e) => {
                warn!("Processor call for job {} failed: {}", job.id, e);
                // Hand the claim back so a later run retries; if the
                // processor already finished the job this is a no-op and
                // the reclaimer covers anything in between.
                if let Err(release_err) = store.release_job(job.id).await {
                    error!("Failed to release job {}: {}", job.id, release_err);
                }
                jobs.push(JobOutcome {
                    job_id: job.id,
                    status: "error".to_string(),
                    progress: None,
                    error: Some(e.to_string()),
                });
            }
        }

        tokio::time::sleep(ITERATION_PAUSE).await;
    }

    Ok(WorkerResponse {
        success: true,
        jobs_processed: jobs.len(),
        time_elapsed_ms: started.elapsed().as_millis() as u64,
        jobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_stops_at_job_cap() {
        let budget = WorkerBudget::default();
        assert!(!budget.exhausted(0, Duration::from_secs(0)));
        assert!(!budget.exhausted(MAX_JOBS_PER_RUN - 1, Duration::from_secs(1)));
        assert!(budget.exhausted(MAX_JOBS_PER_RUN, Duration::from_secs(1)));
    }

    #[test]
    fn test_budget_stops_at_deadline() {
        let budget = WorkerBudget {
            max_jobs: 100,
            timeout: Duration::from_secs(50),
        };
        assert!(!budget.exhausted(3, Duration::from_secs(49)));
        assert!(budget.exhausted(3, Duration::from_secs(50)));
        assert!(budget.exhausted(0, Duration::from_secs(51)));
    }

    #[test]
    fn test_processor_deadline_fits_inside_run_budget() {
        assert!(PROCESSOR_CALL_TIMEOUT < WORKER_TIMEOUT);
    }

    #[test]
    fn test_long_sync_of_successful_batches_never_hits_ceiling() {
        // A mailbox needing 50 batches: each claim increments the counter,
        // each successful continuation resets it (return_job_pending sets
        // attempts = 0), so the ceiling never trips.
        let max_attempts = crate::store::DEFAULT_MAX_ATTEMPTS;
        let mut attempts = 0;
        for _ in 0..50 {
            attempts += 1;
            assert!(!attempt_limit_exceeded(attempts, max_attempts));
            attempts = 0;
        }
    }

    #[test]
    fn test_consecutive_failed_claims_trip_the_ceiling() {
        // Failed delegations release the claim without resetting the
        // counter; the claim after the tenth is cut off.
        let max_attempts = crate::store::DEFAULT_MAX_ATTEMPTS;
        let mut attempts = 0;
        for _ in 0..max_attempts {
            attempts += 1;
            assert!(!attempt_limit_exceeded(attempts, max_attempts));
        }
        attempts += 1;
        assert!(attempt_limit_exceeded(attempts, max_attempts));
    }
}
