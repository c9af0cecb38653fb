use async_trait::async_trait;
use sqlx::PgPool;

use sner_core::errors::SnerResult;
use sner_core::models::Excl;
use sner_core::traits::ExclRepository;

pub struct PgExclRepository {
    pool: PgPool,
}

impl PgExclRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExclRepository for PgExclRepository {
    async fn create(&self, excl: &Excl) -> SnerResult<Excl> {
        let created = sqlx::query_as::<_, Excl>(
            "INSERT INTO excl (family, value, comment) VALUES ($1, $2, $3) \
             RETURNING id, family, value, comment",
        )
        .bind(excl.family)
        .bind(&excl.value)
        .bind(&excl.comment)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn list(&self) -> SnerResult<Vec<Excl>> {
        let excls =
            sqlx::query_as::<_, Excl>("SELECT id, family, value, comment FROM excl ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(excls)
    }
}
