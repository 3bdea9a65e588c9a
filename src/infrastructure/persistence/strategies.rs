//! Strategy rows (owner-scoped reads only).

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::domain::strategy::StrategyDefinition;

#[derive(Clone)]
pub struct StrategyStore {
    pool: PgPool,
}

impl StrategyStore {
    pub fn new(pool: PgPool) -> StrategyStore {
        StrategyStore { pool }
    }

    /// The live definition of a non-deleted strategy owned by `user_id`.
    /// Submissions snapshot this onto the job row.
    pub async fn fetch_definition(
        &self,
        strategy_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<StrategyDefinition>> {
        let row = sqlx::query(
            "SELECT definition FROM strategies \
             WHERE id = $1 AND user_id = $2 AND NOT is_deleted",
        )
        .bind(strategy_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load strategy")?;

        let Some(row) = row else { return Ok(None) };
        let definition: serde_json::Value = row.try_get("definition")?;
        Ok(Some(
            serde_json::from_value(definition).context("Corrupt strategy definition")?,
        ))
    }
}
