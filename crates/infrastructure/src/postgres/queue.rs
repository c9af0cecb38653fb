use async_trait::async_trait;
use sqlx::PgPool;

use sner_core::errors::SnerResult;
use sner_core::models::Queue;
use sner_core::traits::QueueRepository;

pub struct PgQueueRepository {
    pool: PgPool,
}

impl PgQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const QUEUE_COLUMNS: &str = "id, name, config, group_size, priority, active, reqs";

#[async_trait]
impl QueueRepository for PgQueueRepository {
    async fn create(&self, queue: &Queue) -> SnerResult<Queue> {
        let created = sqlx::query_as::<_, Queue>(&format!(
            "INSERT INTO queue (name, config, group_size, priority, active, reqs) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(&queue.name)
        .bind(&queue.config)
        .bind(queue.group_size)
        .bind(queue.priority)
        .bind(queue.active)
        .bind(&queue.reqs)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn get_by_id(&self, id: i32) -> SnerResult<Option<Queue>> {
        let queue =
            sqlx::query_as::<_, Queue>(&format!("SELECT {QUEUE_COLUMNS} FROM queue WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(queue)
    }

    async fn get_by_name(&self, name: &str) -> SnerResult<Option<Queue>> {
        let queue = sqlx::query_as::<_, Queue>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(queue)
    }

    async fn list(&self) -> SnerResult<Vec<Queue>> {
        let queues =
            sqlx::query_as::<_, Queue>(&format!("SELECT {QUEUE_COLUMNS} FROM queue ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(queues)
    }

    async fn delete(&self, id: i32) -> SnerResult<()> {
        sqlx::query("DELETE FROM queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_for_assignment(
        &self,
        queue_name: Option<&str>,
        caps: &[String],
    ) -> SnerResult<Option<Queue>> {
        let queue = sqlx::query_as::<_, Queue>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue \
             WHERE active \
               AND reqs <@ $1 \
               AND id IN (SELECT DISTINCT queue_id FROM readynet) \
               AND ($2::text IS NULL OR name = $2) \
             ORDER BY priority DESC, random() \
             LIMIT 1"
        ))
        .bind(caps)
        .bind(queue_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(queue)
    }

    async fn target_counts(&self) -> SnerResult<Vec<(String, i64)>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT q.name, count(t.id) FROM queue q \
             LEFT JOIN target t ON t.queue_id = q.id \
             GROUP BY q.name ORDER BY q.name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }
}
