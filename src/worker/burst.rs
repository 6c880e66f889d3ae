use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::lease::{new_owner_id, LeaseCoordinator};
use super::processor::Processor;
use crate::domain::repository::{JobRepository, LeaseRepository};
use crate::pipeline::dispatch::Dispatcher;

/// What the loop does when a renewal reports the lease gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseLossPolicy {
    /// Keep draining; per-row claiming still prevents double processing.
    Tolerate,
    /// Stop at once so at most one loop drives the queue.
    Abort,
}

impl FromStr for LeaseLossPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tolerate" => Ok(LeaseLossPolicy::Tolerate),
            "abort" => Ok(LeaseLossPolicy::Abort),
            other => Err(anyhow!("unknown lease loss policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BurstConfig {
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    pub idle_exit: Duration,
    pub max_runtime: Duration,
    pub batch_size: usize,
    pub lease_loss: LeaseLossPolicy,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            idle_exit: Duration::from_secs(30),
            max_runtime: Duration::from_secs(600),
            batch_size: 1,
            lease_loss: LeaseLossPolicy::Tolerate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Idle,
    Deadline,
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstOutcome {
    /// Another loop holds the lease; nothing was done.
    Contended,
    Finished { processed: usize, reason: ExitReason },
}

/// Bounded-lifetime drain loop guarded by a named lease.
pub struct BurstWorker<JR, LR, D>
where
    JR: JobRepository,
    LR: LeaseRepository,
    D: Dispatcher,
{
    lease: LeaseCoordinator<LR>,
    processor: Arc<Processor<JR, D>>,
    config: BurstConfig,
}

impl<JR, LR, D> BurstWorker<JR, LR, D>
where
    JR: JobRepository,
    LR: LeaseRepository,
    D: Dispatcher,
{
    pub fn new(
        lease: LeaseCoordinator<LR>,
        processor: Arc<Processor<JR, D>>,
        config: BurstConfig,
    ) -> Self {
        Self {
            lease,
            processor,
            config,
        }
    }

    pub async fn run(&self) -> Result<BurstOutcome> {
        let owner = new_owner_id();

        if !self.lease.try_acquire(&owner, self.config.lease_ttl).await {
            debug!(lease = %self.lease.name(), "Lease held elsewhere, not starting");
            return Ok(BurstOutcome::Contended);
        }

        info!(lease = %self.lease.name(), %owner, "Burst loop started");

        let result = self.drive(&owner).await;

        self.lease.release(&owner).await;

        match &result {
            Ok(BurstOutcome::Finished { processed, reason }) => {
                info!(%owner, processed, ?reason, "Burst loop finished")
            }
            Ok(BurstOutcome::Contended) => {}
            Err(e) => error!(%owner, "Burst loop aborted: {:#}", e),
        }

        result
    }

    async fn drive(&self, owner: &str) -> Result<BurstOutcome> {
        let started = Instant::now();
        let deadline = started + self.config.max_runtime;
        let mut last_work = started;
        let mut processed = 0;
        let mut lease_held = true;

        let finished = |processed, reason| Ok(BurstOutcome::Finished { processed, reason });

        loop {
            if Instant::now() >= deadline {
                return finished(processed, ExitReason::Deadline);
            }

            if self.lease.renew(owner, self.config.lease_ttl).await {
                lease_held = true;
            } else {
                match self.config.lease_loss {
                    LeaseLossPolicy::Abort => {
                        warn!(owner, "Lease lost, stopping burst loop");
                        return finished(processed, ExitReason::LeaseLost);
                    }
                    LeaseLossPolicy::Tolerate => {
                        if lease_held {
                            warn!(owner, "Lease lost, continuing on per-job claims");
                        }
                        lease_held = self.lease.try_acquire(owner, self.config.lease_ttl).await;
                        if lease_held {
                            info!(owner, "Lease regained");
                        }
                    }
                }
            }

            let claimed = self.processor.claim_and_process(self.config.batch_size).await?;

            if claimed > 0 {
                processed += claimed;
                last_work = Instant::now();
                continue;
            }

            if last_work.elapsed() >= self.config.idle_exit {
                return finished(processed, ExitReason::Idle);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }
}
