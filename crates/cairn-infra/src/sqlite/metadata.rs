//! SQLite plan execution metadata repository.

use sqlx::Row;
use uuid::Uuid;

use cairn_core::repository::metadata::PlanMetadataRepository;
use cairn_types::error::RepositoryError;
use cairn_types::plan::PlanExecutionMetadata;

use super::pool::DatabasePool;
use super::{
    format_datetime, map_sqlx, opt_from_json, parse_datetime, parse_opt_datetime, parse_uuid,
    placeholders, to_json,
};

pub struct SqlitePlanMetadataRepository {
    pool: DatabasePool,
}

impl SqlitePlanMetadataRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl PlanMetadataRepository for SqlitePlanMetadataRepository {
    async fn save_metadata(&self, metadata: &PlanExecutionMetadata) -> Result<(), RepositoryError> {
        let retry = metadata
            .retry_stages_metadata
            .as_ref()
            .map(to_json)
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO plan_execution_metadata
                 (plan_execution_id, notes, retry_stages_metadata, created_at, valid_until)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(plan_execution_id) DO UPDATE SET
                 notes = excluded.notes,
                 retry_stages_metadata = excluded.retry_stages_metadata,
                 valid_until = excluded.valid_until"#,
        )
        .bind(metadata.plan_execution_id.to_string())
        .bind(metadata.notes.clone())
        .bind(retry)
        .bind(format_datetime(&metadata.created_at))
        .bind(metadata.valid_until.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_metadata(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Option<PlanExecutionMetadata>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM plan_execution_metadata WHERE plan_execution_id = ?")
            .bind(plan_execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("plan_execution_id").map_err(map_sqlx)?;
        let notes: Option<String> = row.try_get("notes").map_err(map_sqlx)?;
        let retry: Option<String> = row.try_get("retry_stages_metadata").map_err(map_sqlx)?;
        let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
        let valid_until: Option<String> = row.try_get("valid_until").map_err(map_sqlx)?;

        Ok(Some(PlanExecutionMetadata {
            plan_execution_id: parse_uuid(&id)?,
            notes,
            retry_stages_metadata: opt_from_json(retry.as_deref(), "retry_stages_metadata")?,
            created_at: parse_datetime(&created_at)?,
            valid_until: parse_opt_datetime(valid_until.as_deref())?,
        }))
    }

    async fn delete_metadata_by_plans(
        &self,
        plan_execution_ids: &[Uuid],
    ) -> Result<u64, RepositoryError> {
        if plan_execution_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM plan_execution_metadata WHERE plan_execution_id IN ({})",
            placeholders(plan_execution_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in plan_execution_ids {
            query = query.bind(id.to_string());
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}
