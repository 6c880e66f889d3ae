use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt::format, prelude::__tracing_subscriber_field_MakeExt, EnvFilter};

use crate::domain::retry::RetryPolicy;
use crate::infrastructure::nats::Subjects;
use crate::worker::burst::{BurstConfig, LeaseLossPolicy};

#[derive(Debug, Parser)]
pub struct Config {
    #[clap(long, required = true, env)]
    pub database_url: String,
    #[clap(long, default_value = "nats://localhost:4222", env)]
    pub nats_url: String,
    #[clap(long, default_value = "pipeline", env)]
    pub subject_prefix: String,

    // Burst loop
    #[clap(long, default_value = "image-runner", env)]
    pub lease_name: String,
    #[clap(long, default_value = "120", env)]
    pub lease_ttl_secs: u64,
    #[clap(long, default_value = "2000", env)]
    pub poll_interval_ms: u64,
    #[clap(long, default_value = "30000", env)]
    pub idle_exit_ms: u64,
    #[clap(long, default_value = "600000", env)]
    pub max_runtime_ms: u64,
    #[clap(long, default_value = "1", env)]
    pub batch_size: usize,
    #[clap(long, default_value = "60", env)]
    pub trigger_interval_secs: u64,
    /// "tolerate" keeps draining after losing the lease, "abort" stops the loop.
    #[clap(long, default_value = "tolerate", env)]
    pub lease_loss: String,

    // Retry
    #[clap(long, default_value = "3", env)]
    pub max_retries: i32,
    #[clap(long, default_value = "30", env)]
    pub backoff_base_secs: u64,
    #[clap(long, default_value = "3600", env)]
    pub backoff_cap_secs: u64,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run migrations, then drain the queue on wake signals and admin requests.
    Serve,
    /// Create or update the queue schema.
    Migrate,
    /// Submit a pipeline stage for one subject.
    Enqueue {
        subject_key: String,
        /// Origin of the work: interactive, manager, admin or backfill.
        #[clap(long, default_value = "interactive")]
        source: String,
        #[clap(long, default_value = "image.hash")]
        job_type: String,
    },
    /// Process up to `max` jobs in the foreground, without a lease.
    Drain {
        #[clap(long, default_value = "100")]
        max: usize,
    },
    /// Print job counts by status.
    Stats,
    /// Print every job recorded for a subject, including the last error.
    Inspect { subject_key: String },
    /// Print one job by id.
    Show { id: i64 },
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.max_retries < 1 {
            bail!("max_retries must be at least 1");
        }

        if self.poll_interval_ms == 0 || self.trigger_interval_secs == 0 {
            bail!("poll_interval_ms and trigger_interval_secs must be greater than 0");
        }

        if self.backoff_base_secs == 0 || self.backoff_cap_secs < self.backoff_base_secs {
            bail!("backoff_base_secs must be positive and not above backoff_cap_secs");
        }

        // Renewal happens at least once per poll; leave room for slow iterations.
        if self.poll_interval_ms.saturating_mul(4) > self.lease_ttl_secs.saturating_mul(1000) {
            bail!("poll_interval_ms must be at most a quarter of lease_ttl_secs");
        }

        self.lease_loss.parse::<LeaseLossPolicy>()?;

        Ok(())
    }

    pub fn burst_config(&self) -> Result<BurstConfig> {
        Ok(BurstConfig {
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            idle_exit: Duration::from_millis(self.idle_exit_ms),
            max_runtime: Duration::from_millis(self.max_runtime_ms),
            batch_size: self.batch_size,
            lease_loss: self.lease_loss.parse()?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_secs(self.backoff_base_secs),
            cap: Duration::from_secs(self.backoff_cap_secs),
        }
    }

    pub fn subjects(&self) -> Subjects {
        Subjects::new(self.subject_prefix.clone())
    }

    pub fn trigger_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_interval_secs)
    }
}

pub fn configure_tracing() {
    let formatter =
        format::debug_fn(|writer, field, value| write!(writer, "{}={:?}", field, value))
            .delimited(" ");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .fmt_fields(formatter)
        .init();
}
