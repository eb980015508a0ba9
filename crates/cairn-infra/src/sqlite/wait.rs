//! SQLite wait record repository.
//!
//! Each state change is one conditional statement: a delivery only lands on
//! a missing or `waiting` record, and only a `delivered` record can be
//! consumed. Two concurrent deliveries therefore resolve to one winner.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use cairn_core::repository::wait::WaitRepository;
use cairn_types::error::RepositoryError;
use cairn_types::notify::{NotifyPayload, WaitRecord, WaitState};

use super::pool::DatabasePool;
use super::{
    enum_from_str, enum_to_str, format_datetime, from_json, map_sqlx, opt_from_json,
    parse_datetime, placeholders, to_json,
};

pub struct SqliteWaitRepository {
    pool: DatabasePool,
}

impl SqliteWaitRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch(
        &self,
        correlation_id: &str,
        executor: &sqlx::SqlitePool,
    ) -> Result<Option<WaitRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM wait_records WHERE correlation_id = ?")
            .bind(correlation_id)
            .fetch_optional(executor)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_wait).transpose()
    }
}

fn decode_wait(row: &SqliteRow) -> Result<WaitRecord, RepositoryError> {
    let correlation_id: String = row.try_get("correlation_id").map_err(map_sqlx)?;
    let state: String = row.try_get("state").map_err(map_sqlx)?;
    let payload: Option<String> = row.try_get("payload").map_err(map_sqlx)?;
    let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
    let updated_at: String = row.try_get("updated_at").map_err(map_sqlx)?;

    Ok(WaitRecord {
        correlation_id,
        state: enum_from_str(&state, "wait state")?,
        payload: opt_from_json(payload.as_deref(), "payload")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl WaitRepository for SqliteWaitRepository {
    async fn insert_waiting(&self, correlation_id: &str) -> Result<WaitRecord, RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO wait_records (correlation_id, state, payload, created_at, updated_at)
               VALUES (?, ?, NULL, ?, ?)
               ON CONFLICT(correlation_id) DO NOTHING"#,
        )
        .bind(correlation_id)
        .bind(enum_to_str(&WaitState::Waiting)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        // Read back through the writer so the row just written is visible.
        self.fetch(correlation_id, &self.pool.writer)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn mark_delivered(
        &self,
        correlation_id: &str,
        payload: &NotifyPayload,
    ) -> Result<bool, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            r#"INSERT INTO wait_records (correlation_id, state, payload, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(correlation_id) DO UPDATE SET
                 state = excluded.state,
                 payload = excluded.payload,
                 updated_at = excluded.updated_at
               WHERE wait_records.state = ?"#,
        )
        .bind(correlation_id)
        .bind(enum_to_str(&WaitState::Delivered)?)
        .bind(to_json(payload)?)
        .bind(&now)
        .bind(&now)
        .bind(enum_to_str(&WaitState::Waiting)?)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_consumed(
        &self,
        correlation_id: &str,
    ) -> Result<Option<NotifyPayload>, RepositoryError> {
        let row = sqlx::query(
            r#"UPDATE wait_records SET state = ?, updated_at = ?
               WHERE correlation_id = ? AND state = ?
               RETURNING payload"#,
        )
        .bind(enum_to_str(&WaitState::Consumed)?)
        .bind(format_datetime(&Utc::now()))
        .bind(correlation_id)
        .bind(enum_to_str(&WaitState::Delivered)?)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let payload: Option<String> = row.try_get("payload").map_err(map_sqlx)?;
                let payload = payload.ok_or_else(|| {
                    RepositoryError::Query(format!("delivered wait '{correlation_id}' has no payload"))
                })?;
                Ok(Some(from_json(&payload, "payload")?))
            }
            None => Ok(None),
        }
    }

    async fn get_wait(&self, correlation_id: &str) -> Result<Option<WaitRecord>, RepositoryError> {
        self.fetch(correlation_id, &self.pool.reader).await
    }

    async fn delete_consumed_before(&self, before: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM wait_records WHERE state = ? AND updated_at < ?")
            .bind(enum_to_str(&WaitState::Consumed)?)
            .bind(format_datetime(&before))
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn delete_waits(&self, correlation_ids: &[String]) -> Result<u64, RepositoryError> {
        if correlation_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM wait_records WHERE correlation_id IN ({})",
            placeholders(correlation_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in correlation_ids {
            query = query.bind(id);
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}
