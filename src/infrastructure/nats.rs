use anyhow::{anyhow, Context, Result};
use async_nats::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::entity::JobType;
use crate::pipeline::{
    dispatch::{StageHandler, StageOutcome},
    enqueuer::WakeSignal,
};

#[derive(Clone, Debug)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn wake(&self) -> String {
        format!("{}.wake", self.prefix)
    }

    pub fn stage(&self, job_type: JobType) -> String {
        format!("{}.stage.{}", self.prefix, job_type)
    }

    pub fn admin_drain(&self) -> String {
        format!("{}.admin.drain", self.prefix)
    }

    pub fn admin_stats(&self) -> String {
        format!("{}.admin.stats", self.prefix)
    }
}

#[derive(Clone, Debug)]
pub struct NatsWake {
    client: Client,
    subject: String,
}

impl NatsWake {
    pub fn new(client: Client, subjects: &Subjects) -> Self {
        Self {
            client,
            subject: subjects.wake(),
        }
    }
}

#[async_trait::async_trait]
impl WakeSignal for NatsWake {
    async fn wake(&self) -> Result<()> {
        self.client
            .publish(self.subject.clone(), Bytes::new())
            .await
            .map_err(|e| anyhow!("publish {}: {}", self.subject, e))?;

        debug!(subject = %self.subject, "Wake published");

        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StageRequest<'a> {
    subject_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct StageReply {
    #[serde(rename = "continue", default)]
    continue_pipeline: bool,
    #[serde(default)]
    error: Option<String>,
}

/// A stage implemented by an external service answering NATS requests.
#[derive(Clone, Debug)]
pub struct NatsStageHandler {
    client: Client,
    subject: String,
}

impl NatsStageHandler {
    pub fn new(client: Client, subjects: &Subjects, job_type: JobType) -> Self {
        Self {
            client,
            subject: subjects.stage(job_type),
        }
    }
}

#[async_trait::async_trait]
impl StageHandler for NatsStageHandler {
    async fn run(&self, subject_key: &str) -> Result<StageOutcome> {
        let payload = serde_json::to_vec(&StageRequest { subject_key })?;

        let message = self
            .client
            .request(self.subject.clone(), payload.into())
            .await
            .map_err(|e| anyhow!("request {}: {}", self.subject, e))?;

        parse_stage_reply(&message.payload)
            .with_context(|| format!("stage {} for {}", self.subject, subject_key))
    }
}

fn parse_stage_reply(payload: &[u8]) -> Result<StageOutcome> {
    let reply: StageReply = serde_json::from_slice(payload).context("invalid stage reply")?;

    if let Some(error) = reply.error {
        return Err(anyhow!(error));
    }

    Ok(if reply.continue_pipeline {
        StageOutcome::Continue
    } else {
        StageOutcome::Stop
    })
}
