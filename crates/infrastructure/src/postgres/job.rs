use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use sner_core::errors::SnerResult;
use sner_core::models::{Job, JobStateCounts};
use sner_core::traits::JobRepository;

pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "id, queue_id, assignment, retval, time_start, time_end";

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: &Job) -> SnerResult<()> {
        sqlx::query(
            "INSERT INTO job (id, queue_id, assignment, retval, time_start, time_end) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(job.id)
        .bind(job.queue_id)
        .bind(&job.assignment)
        .bind(job.retval)
        .bind(job.time_start)
        .bind(job.time_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SnerResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn finalize(&self, id: Uuid, retval: i32, time_end: DateTime<Utc>) -> SnerResult<()> {
        sqlx::query("UPDATE job SET retval = $2, time_end = $3 WHERE id = $1")
            .bind(id)
            .bind(retval)
            .bind(time_end)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> SnerResult<()> {
        sqlx::query("DELETE FROM job WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_by_queue(&self, queue_id: i32) -> SnerResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE queue_id = $1 ORDER BY time_start"
        ))
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn count_by_queue(&self, queue_id: i32) -> SnerResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM job WHERE queue_id = $1")
            .bind(queue_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn first_finished(&self, queue_id: i32) -> SnerResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE queue_id = $1 AND retval = 0 ORDER BY time_start LIMIT 1"
        ))
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list_running(&self) -> SnerResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE retval IS NULL"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn state_counts(&self, stale_horizon: DateTime<Utc>) -> SnerResult<JobStateCounts> {
        let (running, stale, finished, failed): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT \
               count(*) FILTER (WHERE retval IS NULL AND time_start >= $1), \
               count(*) FILTER (WHERE retval IS NULL AND time_start < $1), \
               count(*) FILTER (WHERE retval = 0), \
               count(*) FILTER (WHERE retval IS NOT NULL AND retval != 0) \
             FROM job",
        )
        .bind(stale_horizon)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobStateCounts {
            running,
            stale,
            finished,
            failed,
        })
    }
}
