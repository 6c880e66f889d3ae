use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::domain::{
    entity::Job,
    repository::JobRepository,
    retry::{RetryDecision, RetryPolicy},
};
use crate::pipeline::dispatch::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retrying(Duration),
    Failed,
}

/// Claims jobs, hands them to the dispatcher and records the result. Shared by the
/// burst loop and the single-shot drain so both follow one retry policy.
pub struct Processor<JR, D>
where
    JR: JobRepository,
    D: Dispatcher,
{
    jobs: JR,
    dispatcher: Arc<D>,
    retry: RetryPolicy,
}

impl<JR, D> Processor<JR, D>
where
    JR: JobRepository,
    D: Dispatcher,
{
    pub fn new(jobs: JR, dispatcher: Arc<D>, retry: RetryPolicy) -> Self {
        Self {
            jobs,
            dispatcher,
            retry,
        }
    }

    /// Claims up to `batch_size` jobs and processes them in order. Returns how many
    /// were claimed. Store errors propagate; handler errors never do.
    pub async fn claim_and_process(&self, batch_size: usize) -> Result<usize> {
        let claimed = self.jobs.claim_batch(batch_size).await?;

        for job in &claimed {
            self.process(job).await?;
        }

        Ok(claimed.len())
    }

    pub async fn process(&self, job: &Job) -> Result<JobOutcome> {
        let error = match self.dispatcher.dispatch(job).await {
            Ok(()) => {
                self.jobs.mark_done(job.id).await?;
                info!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    subject_key = %job.subject_key,
                    attempts = job.attempts,
                    "Job succeeded"
                );
                return Ok(JobOutcome::Succeeded);
            }
            Err(e) => format!("{:#}", e),
        };

        match self.retry.decide(job.attempts) {
            RetryDecision::Retry(backoff) => {
                warn!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    subject_key = %job.subject_key,
                    attempts = job.attempts,
                    backoff_secs = backoff.as_secs(),
                    "Job failed, will retry: {}",
                    error
                );
                self.jobs.mark_failed(job.id, &error, backoff).await?;
                Ok(JobOutcome::Retrying(backoff))
            }
            RetryDecision::GiveUp => {
                error!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    subject_key = %job.subject_key,
                    attempts = job.attempts,
                    "Job failed permanently: {}",
                    error
                );
                self.jobs.mark_failed_terminal(job.id, &error).await?;
                Ok(JobOutcome::Failed)
            }
        }
    }
}
