use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::{
    entity::{Job, JobType, NewJob},
    repository::JobRepository,
};
use crate::task::spawn_logged;

/// Fire-and-forget nudge that asks some process to start draining soon.
#[async_trait::async_trait]
pub trait WakeSignal: Clone + Send + Sync + 'static {
    async fn wake(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Created(Job),
    Duplicate,
}

#[derive(Clone, Debug)]
pub struct Enqueuer<JR, W>
where
    JR: JobRepository,
    W: WakeSignal,
{
    jobs: JR,
    wake: W,
}

impl<JR, W> Enqueuer<JR, W>
where
    JR: JobRepository,
    W: WakeSignal,
{
    pub fn new(jobs: JR, wake: W) -> Self {
        Self { jobs, wake }
    }

    /// Adds `job_type` for `subject_key` unless the same stage is already pending or
    /// running for that subject.
    pub async fn enqueue(
        &self,
        subject_key: &str,
        job_type: JobType,
        priority: i32,
    ) -> Result<Enqueued> {
        let (enqueued, _wake) = self.submit(subject_key, job_type, priority).await?;
        Ok(enqueued)
    }

    /// Like `enqueue`, but returns only once the wake has been attempted. For
    /// short-lived callers that would otherwise exit before it is sent.
    pub async fn enqueue_and_wake(
        &self,
        subject_key: &str,
        job_type: JobType,
        priority: i32,
    ) -> Result<Enqueued> {
        let (enqueued, wake) = self.submit(subject_key, job_type, priority).await?;
        if let Some(wake) = wake {
            wake.await?;
        }
        Ok(enqueued)
    }

    async fn submit(
        &self,
        subject_key: &str,
        job_type: JobType,
        priority: i32,
    ) -> Result<(Enqueued, Option<JoinHandle<()>>)> {
        if let Some(existing) = self.jobs.find_outstanding(subject_key, job_type).await? {
            debug!(
                subject_key,
                %job_type,
                job_id = existing.id,
                status = %existing.status,
                "Job already outstanding, not enqueued"
            );
            return Ok((Enqueued::Duplicate, None));
        }

        let job = match self
            .jobs
            .insert_if_absent(&NewJob::new(subject_key, job_type, priority))
            .await?
        {
            Some(job) => job,
            // Lost the insert race to a concurrent enqueue.
            None => return Ok((Enqueued::Duplicate, None)),
        };

        info!(subject_key, %job_type, job_id = job.id, priority, "Job enqueued");

        let wake = job_type.is_first().then(|| {
            let wake = self.wake.clone();
            spawn_logged("wake", async move { wake.wake().await })
        });

        Ok((Enqueued::Created(job), wake))
    }
}
