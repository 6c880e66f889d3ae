use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_nats::{Client, Message};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::domain::{
    entity::QueueStats,
    repository::{JobRepository, LeaseRepository},
};
use crate::infrastructure::nats::Subjects;
use crate::pipeline::dispatch::Dispatcher;
use crate::task::spawn_logged;
use crate::worker::{
    burst::BurstWorker,
    drain::{DrainStatus, SingleShotDrain},
    guard::RunGuard,
};

#[derive(Debug, Default, Deserialize)]
pub struct DrainRequest {
    pub max: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrainResponse {
    pub status: DrainStatus,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub jobs: QueueStats,
    pub burst_running: bool,
    pub drain_running: bool,
}

pub struct QueueService<JR, LR, D>
where
    JR: JobRepository,
    LR: LeaseRepository,
    D: Dispatcher,
{
    jobs: JR,
    burst: Arc<BurstWorker<JR, LR, D>>,
    burst_guard: RunGuard,
    drain: SingleShotDrain<JR, D>,
    default_drain_max: usize,
}

impl<JR, LR, D> QueueService<JR, LR, D>
where
    JR: JobRepository,
    LR: LeaseRepository,
    D: Dispatcher,
{
    pub fn new(
        jobs: JR,
        burst: Arc<BurstWorker<JR, LR, D>>,
        drain: SingleShotDrain<JR, D>,
        default_drain_max: usize,
    ) -> Self {
        Self {
            jobs,
            burst,
            burst_guard: RunGuard::new(),
            drain,
            default_drain_max,
        }
    }

    /// Starts a burst loop unless this process already runs one. Returns whether a
    /// loop was started.
    pub fn kick(&self) -> bool {
        let permit = match self.burst_guard.try_start() {
            Some(permit) => permit,
            None => {
                debug!("Burst loop already running in this process");
                return false;
            }
        };

        let burst = self.burst.clone();
        spawn_logged("burst loop", async move {
            let _permit = permit;
            burst.run().await.map(|_| ())
        });

        true
    }

    /// Starts a background drain. An empty payload uses the default `max`; a payload
    /// that does not parse is refused without starting anything.
    pub fn handle_drain(&self, payload: &[u8]) -> Result<DrainResponse> {
        let request: DrainRequest = if payload.is_empty() {
            DrainRequest::default()
        } else {
            serde_json::from_slice(payload).context("malformed drain request")?
        };

        let max = request.max.unwrap_or(self.default_drain_max);
        let status = self.drain.trigger(max);
        info!(max, ?status, "Drain requested");

        Ok(DrainResponse { status })
    }

    pub async fn handle_stats(&self) -> Result<StatsResponse> {
        Ok(StatsResponse {
            jobs: self.jobs.stats().await?,
            burst_running: self.burst_guard.is_running(),
            drain_running: self.drain.is_running(),
        })
    }

    /// Starts burst loops on wake messages and on a fixed tick as the fallback.
    pub async fn listen_wake(
        &self,
        client: Client,
        subjects: &Subjects,
        every: Duration,
    ) -> Result<()> {
        let mut wake = client
            .subscribe(subjects.wake())
            .await
            .map_err(|e| anyhow!("subscribe {}: {}", subjects.wake(), e))?;
        let mut ticker = tokio::time::interval(every);

        info!(subject = %subjects.wake(), "Listening for wake signals");

        loop {
            tokio::select! {
                message = wake.next() => match message {
                    Some(_) => {
                        debug!("Wake received");
                        self.kick();
                    }
                    None => return Err(anyhow!("wake subscription closed")),
                },
                _ = ticker.tick() => {
                    self.kick();
                }
            }
        }
    }

    /// Serves the administrative drain and stats requests.
    pub async fn listen_admin(&self, client: Client, subjects: &Subjects) -> Result<()> {
        let mut drains = client
            .subscribe(subjects.admin_drain())
            .await
            .map_err(|e| anyhow!("subscribe {}: {}", subjects.admin_drain(), e))?;
        let mut stats = client
            .subscribe(subjects.admin_stats())
            .await
            .map_err(|e| anyhow!("subscribe {}: {}", subjects.admin_stats(), e))?;

        info!(subject = %subjects.admin_drain(), "Listening for admin requests");

        loop {
            let result = tokio::select! {
                message = drains.next() => {
                    let message = message.ok_or_else(|| anyhow!("drain subscription closed"))?;
                    match self.handle_drain(&message.payload) {
                        Ok(response) => reply(&client, &message, &response).await,
                        Err(e) => {
                            warn!("Drain request refused: {:#}", e);
                            let error = format!("{:#}", e);
                            reply(&client, &message, &ErrorResponse { error }).await
                        }
                    }
                }
                message = stats.next() => {
                    let message = message.ok_or_else(|| anyhow!("stats subscription closed"))?;
                    match self.handle_stats().await {
                        Ok(response) => reply(&client, &message, &response).await,
                        Err(e) => Err(e),
                    }
                }
            };

            if let Err(e) = result {
                error!("Admin request failed: {:#}", e);
            }
        }
    }
}

async fn reply<T: Serialize>(client: &Client, message: &Message, body: &T) -> Result<()> {
    let subject = match &message.reply {
        Some(subject) => subject.clone(),
        None => return Ok(()),
    };

    let payload = Bytes::from(serde_json::to_vec(body)?);
    client
        .publish(subject, payload)
        .await
        .map_err(|e| anyhow!("reply: {}", e))?;

    Ok(())
}
