//! In-memory stores for tests.
//!
//! Claiming keeps the same two steps as the Postgres store: an eligibility scan,
//! then one conditional pending -> running update per candidate, each under its own
//! short lock. Tasks may interleave between the steps, which is what the exclusivity
//! tests rely on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::domain::{
    clock::ManualClock,
    entity::{truncate_error, Job, JobStatus, JobType, NewJob, QueueStats},
    repository::{JobRepository, LeaseRepository, CLAIM_OVERFETCH},
};

fn is_outstanding(job: &Job) -> bool {
    matches!(job.status, JobStatus::Pending | JobStatus::Running)
}

fn is_eligible(job: &Job, now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Pending && job.scheduled_at.map_or(true, |at| at <= now)
}

#[derive(Debug, Default)]
struct JobTable {
    next_id: i64,
    rows: HashMap<i64, Job>,
}

#[derive(Clone, Debug)]
pub struct MemoryJobRepository {
    table: Arc<Mutex<JobTable>>,
    clock: Arc<ManualClock>,
}

impl MemoryJobRepository {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            table: Arc::new(Mutex::new(JobTable::default())),
            clock,
        }
    }

    pub fn all(&self) -> Vec<Job> {
        let table = self.table.lock().unwrap();
        let mut jobs: Vec<Job> = table.rows.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    fn transition<F>(&self, id: i64, update: F)
    where
        F: FnOnce(&mut Job, DateTime<Utc>),
    {
        let now = self.clock.now();
        let mut table = self.table.lock().unwrap();
        if let Some(job) = table.rows.get_mut(&id) {
            if job.status == JobStatus::Running {
                update(job, now);
                job.updated_at = now;
            }
        }
    }
}

#[async_trait::async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert_if_absent(&self, new: &NewJob) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut table = self.table.lock().unwrap();
        let duplicate = table.rows.values().any(|j| {
            j.subject_key == new.subject_key && j.job_type == new.job_type && is_outstanding(j)
        });
        if duplicate {
            return Ok(None);
        }

        table.next_id += 1;
        let id = table.next_id;
        let job = Job {
            id,
            job_type: new.job_type,
            subject_key: new.subject_key.clone(),
            status: JobStatus::Pending,
            priority: new.priority,
            attempts: 0,
            last_error: None,
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(id, job.clone());

        Ok(Some(job))
    }

    async fn find_outstanding(&self, subject_key: &str, job_type: JobType) -> Result<Option<Job>> {
        let table = self.table.lock().unwrap();
        Ok(table
            .rows
            .values()
            .filter(|j| j.subject_key == subject_key && j.job_type == job_type)
            .find(|j| is_outstanding(j))
            .cloned())
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates: Vec<i64> = {
            let now = self.clock.now();
            let table = self.table.lock().unwrap();
            let mut eligible: Vec<&Job> =
                table.rows.values().filter(|j| is_eligible(j, now)).collect();
            eligible.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });
            eligible
                .into_iter()
                .take(limit.saturating_mul(CLAIM_OVERFETCH))
                .map(|j| j.id)
                .collect()
        };

        let mut claimed = Vec::with_capacity(limit);

        for id in candidates {
            tokio::task::yield_now().await;

            {
                let now = self.clock.now();
                let mut table = self.table.lock().unwrap();
                if let Some(job) = table.rows.get_mut(&id) {
                    if is_eligible(job, now) {
                        job.status = JobStatus::Running;
                        job.attempts += 1;
                        job.started_at = Some(now);
                        job.finished_at = None;
                        job.updated_at = now;
                        claimed.push(job.clone());
                    }
                }
            }

            if claimed.len() >= limit {
                break;
            }
        }

        Ok(claimed)
    }

    async fn mark_done(&self, id: i64) -> Result<()> {
        self.transition(id, |job, now| {
            job.status = JobStatus::Succeeded;
            job.finished_at = Some(now);
            job.last_error = None;
        });
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, backoff: Duration) -> Result<()> {
        let backoff = chrono::Duration::from_std(backoff)?;
        self.transition(id, |job, now| {
            job.status = JobStatus::Pending;
            job.last_error = Some(truncate_error(error));
            job.scheduled_at = Some(now + backoff);
            job.started_at = None;
            job.finished_at = None;
        });
        Ok(())
    }

    async fn mark_failed_terminal(&self, id: i64, error: &str) -> Result<()> {
        self.transition(id, |job, now| {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            job.last_error = Some(truncate_error(error));
        });
        Ok(())
    }

    async fn load(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.table.lock().unwrap().rows.get(&id).cloned())
    }

    async fn list_for_subject(&self, subject_key: &str) -> Result<Vec<Job>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|j| j.subject_key == subject_key)
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for job in self.table.lock().unwrap().rows.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone)]
struct LeaseRow {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct MemoryLeaseRepository {
    rows: Arc<Mutex<HashMap<String, LeaseRow>>>,
    clock: Arc<ManualClock>,
}

impl MemoryLeaseRepository {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn holder(&self, name: &str) -> Option<String> {
        let now = self.clock.now();
        self.rows
            .lock()
            .unwrap()
            .get(name)
            .filter(|row| row.expires_at > now)
            .map(|row| row.owner.clone())
    }
}

#[async_trait::async_trait]
impl LeaseRepository for MemoryLeaseRepository {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;
        let mut rows = self.rows.lock().unwrap();

        match rows.get(name) {
            Some(row) if row.expires_at > now => Ok(false),
            _ => {
                rows.insert(
                    name.to_string(),
                    LeaseRow {
                        owner: owner.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;
        let mut rows = self.rows.lock().unwrap();

        match rows.get_mut(name) {
            Some(row) if row.owner == owner && row.expires_at > now => {
                row.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.get(name).map_or(false, |row| row.owner == owner) {
            rows.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<ManualClock>, MemoryJobRepository) {
        let clock = Arc::new(ManualClock::new());
        let jobs = MemoryJobRepository::new(clock.clone());
        (clock, jobs)
    }

    async fn insert(jobs: &MemoryJobRepository, key: &str, priority: i32) -> Job {
        jobs.insert_if_absent(&NewJob::new(key, JobType::Hash, priority))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_created_at() {
        let (clock, jobs) = setup();
        insert(&jobs, "a", 10).await;
        clock.advance(Duration::from_millis(1));
        let first_fifty = insert(&jobs, "b", 50).await;
        clock.advance(Duration::from_millis(1));
        let second_fifty = insert(&jobs, "c", 50).await;
        clock.advance(Duration::from_millis(1));
        insert(&jobs, "d", 0).await;

        let claimed = jobs.claim_batch(2).await.unwrap();

        let ids: Vec<i64> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first_fifty.id, second_fifty.id]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Running));
    }

    #[tokio::test]
    async fn test_concurrent_claimers_never_share_a_job() {
        let (_clock, jobs) = setup();
        for i in 0..40 {
            insert(&jobs, &format!("subject-{}", i), i % 5).await;
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let jobs = jobs.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = jobs.claim_batch(2).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                }
                mine
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn test_attempts_count_every_claim() {
        let (_clock, jobs) = setup();
        let job = insert(&jobs, "k", 1).await;

        for k in 1..=3 {
            let claimed = jobs.claim_batch(1).await.unwrap();
            assert_eq!(claimed[0].attempts, k);
            jobs.mark_failed(job.id, "nope", Duration::ZERO).await.unwrap();
        }

        assert_eq!(jobs.load(job.id).await.unwrap().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_mark_failed_reschedules_and_keeps_attempts() {
        let (clock, jobs) = setup();
        let job = insert(&jobs, "k", 1).await;
        jobs.claim_batch(1).await.unwrap();

        let failed_at = clock.now();
        jobs.mark_failed(job.id, "decoder exploded", Duration::from_secs(30))
            .await
            .unwrap();

        let job = jobs.load(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("decoder exploded"));
        assert_eq!(job.scheduled_at, Some(failed_at + chrono::Duration::seconds(30)));
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());

        assert!(jobs.claim_batch(1).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(30));
        assert_eq!(jobs.claim_batch(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_done_clears_last_error() {
        let (_clock, jobs) = setup();
        let job = insert(&jobs, "k", 1).await;
        jobs.claim_batch(1).await.unwrap();
        jobs.mark_failed(job.id, "flaky", Duration::ZERO).await.unwrap();
        jobs.claim_batch(1).await.unwrap();

        jobs.mark_done(job.id).await.unwrap();

        let job = jobs.load(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.finished_at.is_some());
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_is_never_eligible() {
        let (clock, jobs) = setup();
        let job = insert(&jobs, "k", 1).await;
        jobs.claim_batch(1).await.unwrap();

        jobs.mark_failed_terminal(job.id, "corrupt image").await.unwrap();
        clock.advance(Duration::from_secs(86_400));

        assert!(jobs.claim_batch(5).await.unwrap().is_empty());
        let job = jobs.load(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("corrupt image"));
    }

    #[tokio::test]
    async fn test_lease_contention_and_expiry() {
        let clock = Arc::new(ManualClock::new());
        let leases = MemoryLeaseRepository::new(clock.clone());
        let ttl = Duration::from_secs(60);

        assert!(leases.try_acquire("L", "a", ttl).await.unwrap());
        assert!(!leases.try_acquire("L", "b", ttl).await.unwrap());

        clock.advance(Duration::from_secs(61));
        assert!(leases.try_acquire("L", "b", ttl).await.unwrap());
        assert_eq!(leases.holder("L").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_renew_fails_after_expiry_or_release() {
        let clock = Arc::new(ManualClock::new());
        let leases = MemoryLeaseRepository::new(clock.clone());
        let ttl = Duration::from_secs(60);

        assert!(leases.try_acquire("L", "a", ttl).await.unwrap());
        assert!(leases.renew("L", "a", ttl).await.unwrap());
        assert!(!leases.renew("L", "b", ttl).await.unwrap());

        clock.advance(Duration::from_secs(61));
        assert!(!leases.renew("L", "a", ttl).await.unwrap());

        assert!(leases.try_acquire("L", "a", ttl).await.unwrap());
        leases.release("L", "a").await.unwrap();
        assert!(!leases.renew("L", "a", ttl).await.unwrap());
    }
}
