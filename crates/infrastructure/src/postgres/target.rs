use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder};

use sner_core::errors::SnerResult;
use sner_core::models::Target;
use sner_core::traits::TargetRepository;

use super::QUERY_WINDOW;

pub struct PgTargetRepository {
    pool: PgPool,
}

impl PgTargetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetRepository for PgTargetRepository {
    async fn insert(&self, targets: &[Target]) -> SnerResult<u64> {
        if targets.is_empty() {
            return Ok(0);
        }

        let mut builder =
            QueryBuilder::new("INSERT INTO target (queue_id, target, hashval, rand) ");
        builder.push_values(targets, |mut row, target| {
            row.push_bind(target.queue_id)
                .push_bind(&target.target)
                .push_bind(&target.hashval)
                .push_bind(target.rand);
        });
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn filter_not_queued(
        &self,
        queue_id: i32,
        candidates: Vec<String>,
    ) -> SnerResult<Vec<String>> {
        let mut queued: HashSet<String> = HashSet::new();
        let mut last_id = 0i64;
        loop {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                "SELECT id, target FROM target \
                 WHERE queue_id = $1 AND id > $2 ORDER BY id LIMIT $3",
            )
            .bind(queue_id)
            .bind(last_id)
            .bind(QUERY_WINDOW)
            .fetch_all(&self.pool)
            .await?;
            let Some((id, _)) = rows.last() else {
                break;
            };
            last_id = *id;
            queued.extend(rows.into_iter().map(|(_, target)| target));
        }

        Ok(candidates
            .into_iter()
            .filter(|candidate| !queued.contains(candidate))
            .collect())
    }

    async fn ensure_readynets(&self, queue_id: i32, hashvals: &[String]) -> SnerResult<()> {
        if hashvals.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO readynet (queue_id, hashval) \
             SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING",
        )
        .bind(queue_id)
        .bind(hashvals)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pick_readynet(&self, queue_id: i32) -> SnerResult<Option<String>> {
        let hashval: Option<(String,)> = sqlx::query_as(
            "SELECT hashval FROM readynet WHERE queue_id = $1 ORDER BY random() LIMIT 1",
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hashval.map(|(hashval,)| hashval))
    }

    async fn bucket_targets(
        &self,
        queue_id: i32,
        hashval: &str,
        limit: i64,
    ) -> SnerResult<Vec<Target>> {
        let targets = sqlx::query_as::<_, Target>(
            "SELECT id, queue_id, target, hashval, rand FROM target \
             WHERE queue_id = $1 AND hashval = $2 ORDER BY rand LIMIT $3",
        )
        .bind(queue_id)
        .bind(hashval)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(targets)
    }

    async fn delete_targets(&self, ids: &[i64]) -> SnerResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM target WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_bucket(&self, queue_id: i32, hashval: &str) -> SnerResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM target WHERE queue_id = $1 AND hashval = $2")
                .bind(queue_id)
                .bind(hashval)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn remove_readynet(&self, queue_id: i32, hashval: &str) -> SnerResult<()> {
        sqlx::query("DELETE FROM readynet WHERE queue_id = $1 AND hashval = $2")
            .bind(queue_id)
            .bind(hashval)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_readynet_all_queues(&self, hashval: &str) -> SnerResult<()> {
        sqlx::query("DELETE FROM readynet WHERE hashval = $1")
            .bind(hashval)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn restore_readynets(&self, hashval: &str) -> SnerResult<()> {
        sqlx::query(
            "INSERT INTO readynet (queue_id, hashval) \
             SELECT DISTINCT queue_id, $1 FROM target WHERE hashval = $1 \
             ON CONFLICT DO NOTHING",
        )
        .bind(hashval)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn flush_queue(&self, queue_id: i32) -> SnerResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM target WHERE queue_id = $1")
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM readynet WHERE queue_id = $1")
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
