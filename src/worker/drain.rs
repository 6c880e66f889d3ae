use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::guard::RunGuard;
use super::processor::Processor;
use crate::domain::repository::JobRepository;
use crate::pipeline::dispatch::Dispatcher;
use crate::task::spawn_logged;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainStatus {
    Started,
    AlreadyRunning,
}

/// Operator-triggered drain of at most `max` jobs. No lease; overlapping triggers in
/// one process collapse into `AlreadyRunning`.
pub struct SingleShotDrain<JR, D>
where
    JR: JobRepository,
    D: Dispatcher,
{
    processor: Arc<Processor<JR, D>>,
    guard: RunGuard,
}

impl<JR, D> SingleShotDrain<JR, D>
where
    JR: JobRepository,
    D: Dispatcher,
{
    pub fn new(processor: Arc<Processor<JR, D>>) -> Self {
        Self {
            processor,
            guard: RunGuard::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Starts the drain in the background and returns immediately.
    pub fn trigger(&self, max: usize) -> DrainStatus {
        let permit = match self.guard.try_start() {
            Some(permit) => permit,
            None => return DrainStatus::AlreadyRunning,
        };

        let processor = self.processor.clone();
        spawn_logged("single-shot drain", async move {
            let _permit = permit;
            drain(&processor, max).await.map(|_| ())
        });

        DrainStatus::Started
    }

    /// Runs the drain in the caller's task. `None` if one is already in progress.
    pub async fn run(&self, max: usize) -> Result<Option<usize>> {
        let _permit = match self.guard.try_start() {
            Some(permit) => permit,
            None => return Ok(None),
        };

        drain(&self.processor, max).await.map(Some)
    }
}

async fn drain<JR, D>(processor: &Processor<JR, D>, max: usize) -> Result<usize>
where
    JR: JobRepository,
    D: Dispatcher,
{
    info!(max, "Single-shot drain started");

    let mut processed = 0;
    while processed < max {
        let claimed = processor.claim_and_process(1).await?;
        if claimed == 0 {
            break;
        }
        processed += claimed;
    }

    info!(processed, "Single-shot drain finished");

    Ok(processed)
}
