use std::{fmt, str::FromStr};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of bytes of handler diagnostics kept in `last_error`.
pub const MAX_ERROR_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow!("unknown job status: {}", other)),
        }
    }
}

/// Stages of the image pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Hash,
    Safety,
    Embed,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Hash, JobType::Safety, JobType::Embed];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Hash => "image.hash",
            JobType::Safety => "image.safety",
            JobType::Embed => "image.embed",
        }
    }

    pub fn next(&self) -> Option<JobType> {
        match self {
            JobType::Hash => Some(JobType::Safety),
            JobType::Safety => Some(JobType::Embed),
            JobType::Embed => None,
        }
    }

    pub fn is_first(&self) -> bool {
        *self == JobType::Hash
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow!("unknown job type: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub subject_key: String,
    pub status: JobStatus,

    // Scheduling
    pub priority: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,

    // Timestamps
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub job_type: JobType,
    pub subject_key: String,
    pub priority: i32,
}

impl NewJob {
    pub fn new(subject_key: impl Into<String>, job_type: JobType, priority: i32) -> Self {
        Self {
            job_type,
            subject_key: subject_key.into(),
            priority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Cuts diagnostics down to `MAX_ERROR_LEN` bytes without splitting a character.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }

    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }

    error[..end].to_string()
}
