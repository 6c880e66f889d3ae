use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use super::enqueuer::{Enqueuer, WakeSignal};
use crate::domain::{
    entity::{Job, JobType},
    repository::JobRepository,
};

/// Whether the pipeline should go on to the next stage for this subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    Stop,
}

/// Content-specific work for one stage (hashing, safety classification, embedding).
#[async_trait::async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, subject_key: &str) -> Result<StageOutcome>;
}

/// Runs a claimed job. An `Err` is a handler failure and goes through retry.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, job: &Job) -> Result<()>;
}

pub struct Pipeline<JR, W>
where
    JR: JobRepository,
    W: WakeSignal,
{
    enqueuer: Enqueuer<JR, W>,
    hash: Arc<dyn StageHandler>,
    safety: Arc<dyn StageHandler>,
    embed: Arc<dyn StageHandler>,
}

impl<JR, W> Pipeline<JR, W>
where
    JR: JobRepository,
    W: WakeSignal,
{
    pub fn new(
        enqueuer: Enqueuer<JR, W>,
        hash: Arc<dyn StageHandler>,
        safety: Arc<dyn StageHandler>,
        embed: Arc<dyn StageHandler>,
    ) -> Self {
        Self {
            enqueuer,
            hash,
            safety,
            embed,
        }
    }

    fn handler(&self, job_type: JobType) -> &dyn StageHandler {
        match job_type {
            JobType::Hash => self.hash.as_ref(),
            JobType::Safety => self.safety.as_ref(),
            JobType::Embed => self.embed.as_ref(),
        }
    }
}

#[async_trait::async_trait]
impl<JR, W> Dispatcher for Pipeline<JR, W>
where
    JR: JobRepository,
    W: WakeSignal,
{
    async fn dispatch(&self, job: &Job) -> Result<()> {
        let outcome = self.handler(job.job_type).run(&job.subject_key).await?;

        match (outcome, job.job_type.next()) {
            (StageOutcome::Continue, Some(next)) => {
                // Next stage inherits the urgency of the work that started the pipeline.
                self.enqueuer
                    .enqueue(&job.subject_key, next, job.priority)
                    .await?;
            }
            (StageOutcome::Stop, Some(next)) => {
                info!(
                    subject_key = %job.subject_key,
                    job_type = %job.job_type,
                    skipped = %next,
                    "Pipeline stopped early"
                );
            }
            (_, None) => {
                debug!(subject_key = %job.subject_key, "Pipeline complete");
            }
        }

        Ok(())
    }
}
