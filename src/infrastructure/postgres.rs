use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::{error, info, warn};

use crate::domain::{
    entity::{truncate_error, Job, JobStatus, JobType, NewJob, QueueStats},
    repository::{JobRepository, LeaseRepository, CLAIM_OVERFETCH},
};

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let statements = [
        "CREATE SCHEMA IF NOT EXISTS queue",
        r#"
        CREATE TABLE IF NOT EXISTS queue.jobs (
            id BIGSERIAL PRIMARY KEY,
            job_type TEXT NOT NULL,
            subject_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            scheduled_at TIMESTAMPTZ,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_jobs_outstanding
        ON queue.jobs (subject_key, job_type)
        WHERE status IN ('pending', 'running')
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_jobs_eligible
        ON queue.jobs (status, priority DESC, scheduled_at ASC NULLS FIRST, created_at ASC)
        "#,
        "CREATE INDEX IF NOT EXISTS idx_jobs_subject ON queue.jobs (subject_key)",
        r#"
        CREATE TABLE IF NOT EXISTS queue.leases (
            name TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("run_migrations")?;
    }

    info!("Database migrations complete");

    Ok(())
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Clone, Debug)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JobRepository for PgJobRepository {
    async fn insert_if_absent(&self, job: &NewJob) -> Result<Option<Job>> {
        // The partial unique index makes this the real guard; concurrent enqueues for
        // the same subject and stage collapse into one row.
        let inserted: Option<Job> = sqlx::query_as(
            r#"
            INSERT INTO queue.jobs
                (job_type, subject_key, status, priority, attempts, created_at, updated_at)
            VALUES ($1, $2, 'pending', $3, 0, NOW(), NOW())
            ON CONFLICT (subject_key, job_type) WHERE status IN ('pending', 'running') DO NOTHING
            RETURNING *
            "#,
        )
        .bind(job.job_type.as_str())
        .bind(&job.subject_key)
        .bind(job.priority)
        .fetch_optional(&self.pool)
        .await
        .context("JobRepository::insert_if_absent")?;

        Ok(inserted)
    }

    async fn find_outstanding(&self, subject_key: &str, job_type: JobType) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as(
            r#"
            SELECT * FROM queue.jobs
            WHERE subject_key = $1 AND job_type = $2 AND status IN ('pending', 'running')
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(subject_key)
        .bind(job_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("JobRepository::find_outstanding")?;

        Ok(job)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let fetch = i64::try_from(limit.saturating_mul(CLAIM_OVERFETCH)).unwrap_or(i64::MAX);

        let candidates: Vec<i64> = sqlx::query(
            r#"
            SELECT id FROM queue.jobs
            WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= NOW())
            ORDER BY priority DESC, scheduled_at ASC NULLS FIRST, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(fetch)
        .map(|row: PgRow| row.get(0))
        .fetch_all(&self.pool)
        .await
        .context("JobRepository::claim_batch select")?;

        let mut claimed = Vec::with_capacity(limit);

        for id in candidates {
            // Exactly one caller can win this transition.
            let row: Option<JobRow> = sqlx::query_as(
                r#"
                UPDATE queue.jobs
                SET status = 'running',
                    attempts = attempts + 1,
                    started_at = NOW(),
                    finished_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                  AND status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= NOW())
                RETURNING *
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("JobRepository::claim_batch update")?;

            let row = match row {
                Some(row) => row,
                None => continue,
            };

            match Job::try_from(row) {
                Ok(job) => {
                    claimed.push(job);
                    if claimed.len() >= limit {
                        break;
                    }
                }
                // Already running under this claim, so it can be failed in place.
                Err(e) => {
                    error!(job_id = id, "Claimed job cannot be decoded: {:#}", e);
                    self.mark_failed_terminal(id, &format!("{:#}", e)).await?;
                }
            }
        }

        Ok(claimed)
    }

    async fn mark_done(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue.jobs
            SET status = 'succeeded', finished_at = NOW(), last_error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("JobRepository::mark_done")?;

        if result.rows_affected() == 0 {
            warn!(job_id = id, "mark_done found no running job");
        }

        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, backoff: Duration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue.jobs
            SET status = 'pending',
                last_error = $2,
                scheduled_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond'),
                started_at = NULL,
                finished_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(truncate_error(error))
        .bind(millis(backoff))
        .execute(&self.pool)
        .await
        .context("JobRepository::mark_failed")?;

        if result.rows_affected() == 0 {
            warn!(job_id = id, "mark_failed found no running job");
        }

        Ok(())
    }

    async fn mark_failed_terminal(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue.jobs
            SET status = 'failed', finished_at = NOW(), last_error = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await
        .context("JobRepository::mark_failed_terminal")?;

        if result.rows_affected() == 0 {
            warn!(job_id = id, "mark_failed_terminal found no running job");
        }

        Ok(())
    }

    async fn load(&self, id: i64) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as("SELECT * FROM queue.jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("JobRepository::load")?;

        Ok(job)
    }

    async fn list_for_subject(&self, subject_key: &str) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = sqlx::query_as(
            r#"
            SELECT * FROM queue.jobs
            WHERE subject_key = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(subject_key)
        .fetch_all(&self.pool)
        .await
        .context("JobRepository::list_for_subject")?;

        Ok(jobs)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue.jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .context("JobRepository::stats")?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status.parse()?, count);
        }

        Ok(stats)
    }
}

/// A jobs row with its tags still undecoded.
#[derive(Debug, Clone)]
struct JobRow {
    id: i64,
    job_type: String,
    subject_key: String,
    status: String,
    priority: i32,
    attempts: i32,
    last_error: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for JobRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            subject_key: row.try_get("subject_key")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_type: row.job_type.parse::<JobType>()?,
            subject_key: row.subject_key,
            status: row.status.parse::<JobStatus>()?,
            priority: row.priority,
            attempts: row.attempts,
            last_error: row.last_error,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl FromRow<'_, PgRow> for Job {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Job::try_from(JobRow::from_row(row)?).map_err(|e| sqlx::Error::Decode(e.into()))
    }
}

#[derive(Clone, Debug)]
pub struct PgLeaseRepository {
    pool: PgPool,
}

impl PgLeaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LeaseRepository for PgLeaseRepository {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO queue.leases AS held (name, owner, expires_at)
            VALUES ($1, $2, NOW() + ($3::BIGINT * INTERVAL '1 millisecond'))
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE held.expires_at <= NOW()
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(millis(ttl))
        .execute(&self.pool)
        .await
        .context("LeaseRepository::try_acquire")?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue.leases
            SET expires_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond')
            WHERE name = $1 AND owner = $2 AND expires_at > NOW()
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(millis(ttl))
        .execute(&self.pool)
        .await
        .context("LeaseRepository::renew")?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue.leases WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .context("LeaseRepository::release")?;

        Ok(())
    }
}
