//! Hot indicator definitions from `system_indicators`.

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::postgres::PgPool;
use std::collections::BTreeMap;
use tracing::info;

use crate::domain::strategy::indicator_key::{IndicatorDef, ParamValue};

#[derive(Clone)]
pub struct SystemIndicatorStore {
    pool: PgPool,
}

impl SystemIndicatorStore {
    pub fn new(pool: PgPool) -> SystemIndicatorStore {
        SystemIndicatorStore { pool }
    }

    /// Indicators flagged for the RT pipeline.
    pub async fn hot_indicator_defs(&self) -> Result<Vec<IndicatorDef>> {
        let rows = sqlx::query(
            "SELECT indicator_key, name, params FROM system_indicators \
             WHERE is_hot ORDER BY indicator_key",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load hot indicator definitions")?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("indicator_key")?;
            let params: serde_json::Value = row.try_get("params")?;

            // The key is authoritative; the stored name/params are kept in
            // sync by the API but the parse guards against drift.
            let Some(mut def) = IndicatorDef::parse(&key)? else {
                continue;
            };
            if let Some(map) = params.as_object() {
                let parsed: BTreeMap<String, ParamValue> = map
                    .iter()
                    .filter_map(|(name, value)| {
                        serde_json::from_value::<ParamValue>(value.clone())
                            .ok()
                            .map(|v| (name.clone(), v))
                    })
                    .collect();
                if !parsed.is_empty() {
                    def.params = parsed;
                }
            }
            defs.push(def);
        }

        info!("Loaded {} hot indicator definitions", defs.len());
        Ok(defs)
    }
}
