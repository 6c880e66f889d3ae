use std::time::Duration;

use anyhow::Result;

use super::entity::{Job, JobType, NewJob, QueueStats};

/// Candidates fetched per claimed slot. Concurrent claimers lose some races, so the
/// eligibility query reads past `limit`.
pub const CLAIM_OVERFETCH: usize = 4;

#[async_trait::async_trait]
pub trait JobRepository: Clone + Send + Sync + 'static {
    /// Inserts `job` unless a pending or running job already exists for the same
    /// subject and stage. Returns `None` when nothing was inserted.
    async fn insert_if_absent(&self, job: &NewJob) -> Result<Option<Job>>;

    async fn find_outstanding(&self, subject_key: &str, job_type: JobType) -> Result<Option<Job>>;

    /// Claims up to `limit` eligible jobs, highest priority first. Each returned job
    /// has been moved pending -> running by exactly this caller. A claimed row that
    /// cannot be decoded is failed terminally instead of being returned.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>>;

    async fn mark_done(&self, id: i64) -> Result<()>;

    /// Returns the job to the pending pool, eligible again after `backoff`.
    async fn mark_failed(&self, id: i64, error: &str, backoff: Duration) -> Result<()>;

    async fn mark_failed_terminal(&self, id: i64, error: &str) -> Result<()>;

    async fn load(&self, id: i64) -> Result<Option<Job>>;

    async fn list_for_subject(&self, subject_key: &str) -> Result<Vec<Job>>;

    async fn stats(&self) -> Result<QueueStats>;
}

#[async_trait::async_trait]
pub trait LeaseRepository: Clone + Send + Sync + 'static {
    /// Takes the named lease if it is free or expired. Single atomic statement.
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extends the lease only while `owner` still holds it unexpired.
    async fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, name: &str, owner: &str) -> Result<()>;
}
