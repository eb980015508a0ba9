//! SQLite plan execution repository.
//!
//! Status writes are a single `UPDATE ... WHERE id = ? AND status IN (...)
//! RETURNING *`, so the guard and the write cannot be interleaved by another
//! writer.

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use cairn_core::execution::transition::Transition;
use cairn_core::repository::RepositoryStream;
use cairn_core::repository::plan_execution::PlanExecutionRepository;
use cairn_types::ambiance::keys;
use cairn_types::error::RepositoryError;
use cairn_types::plan::{
    PlanExecution, PlanExecutionField, PlanExecutionProjection, PlanExecutionUpdate,
};
use cairn_types::status::{Status, StatusSet};

use super::pool::DatabasePool;
use super::{
    format_datetime, from_json, map_sqlx, opt_from_json, parse_datetime, parse_opt_datetime,
    parse_uuid, placeholders, status_clause, to_json,
};

pub struct SqlitePlanExecutionRepository {
    pool: DatabasePool,
}

impl SqlitePlanExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(map_sqlx)
}

fn decode_status(s: &str) -> Result<Status, RepositoryError> {
    s.parse::<Status>()
        .map_err(|e| RepositoryError::Query(e.to_string()))
}

fn decode_plan(row: &SqliteRow) -> Result<PlanExecution, RepositoryError> {
    let status: String = get(row, "status")?;
    let created_at: String = get(row, "created_at")?;
    let last_updated_at: String = get(row, "last_updated_at")?;
    let start_ts: String = get(row, "start_ts")?;
    let end_ts: Option<String> = get(row, "end_ts")?;
    let setup: String = get(row, "setup_abstractions")?;
    let metadata: String = get(row, "metadata")?;
    let governance: Option<String> = get(row, "governance_metadata")?;
    let valid_until: Option<String> = get(row, "valid_until")?;
    let id: String = get(row, "id")?;
    let plan_id: String = get(row, "plan_id")?;

    Ok(PlanExecution {
        id: parse_uuid(&id)?,
        plan_id: parse_uuid(&plan_id)?,
        status: decode_status(&status)?,
        created_at: parse_datetime(&created_at)?,
        last_updated_at: parse_datetime(&last_updated_at)?,
        start_ts: parse_datetime(&start_ts)?,
        end_ts: parse_opt_datetime(end_ts.as_deref())?,
        setup_abstractions: from_json(&setup, "setup_abstractions")?,
        metadata: from_json(&metadata, "metadata")?,
        governance_metadata: opt_from_json(governance.as_deref(), "governance_metadata")?,
        valid_until: parse_opt_datetime(valid_until.as_deref())?,
    })
}

fn decode_projection(
    row: &SqliteRow,
    fields: &[PlanExecutionField],
) -> Result<PlanExecutionProjection, RepositoryError> {
    let id: String = get(row, "id")?;
    let mut p = PlanExecutionProjection {
        id: parse_uuid(&id)?,
        ..Default::default()
    };
    for field in fields {
        let column = field.column();
        match field {
            PlanExecutionField::PlanId => {
                let v: String = get(row, column)?;
                p.plan_id = Some(parse_uuid(&v)?);
            }
            PlanExecutionField::Status => {
                let v: String = get(row, column)?;
                p.status = Some(decode_status(&v)?);
            }
            PlanExecutionField::CreatedAt => {
                let v: String = get(row, column)?;
                p.created_at = Some(parse_datetime(&v)?);
            }
            PlanExecutionField::EndTs => {
                let v: Option<String> = get(row, column)?;
                p.end_ts = parse_opt_datetime(v.as_deref())?;
            }
            PlanExecutionField::SetupAbstractions => {
                let v: String = get(row, column)?;
                p.setup_abstractions = Some(from_json(&v, column)?);
            }
            PlanExecutionField::Metadata => {
                let v: String = get(row, column)?;
                p.metadata = Some(from_json(&v, column)?);
            }
            PlanExecutionField::GovernanceMetadata => {
                let v: Option<String> = get(row, column)?;
                p.governance_metadata = opt_from_json(v.as_deref(), column)?;
            }
            PlanExecutionField::ValidUntil => {
                let v: Option<String> = get(row, column)?;
                p.valid_until = parse_opt_datetime(v.as_deref())?;
            }
        }
    }
    Ok(p)
}

fn projection_columns(fields: &[PlanExecutionField]) -> String {
    std::iter::once("id")
        .chain(fields.iter().map(|f| f.column()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn active_statuses() -> StatusSet {
    Status::FINAL.complement()
}

fn bind_statuses<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    set: StatusSet,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for name in set.names() {
        query = query.bind(name);
    }
    query
}

// ---------------------------------------------------------------------------
// PlanExecutionRepository impl
// ---------------------------------------------------------------------------

impl PlanExecutionRepository for SqlitePlanExecutionRepository {
    async fn save_plan(&self, plan: &PlanExecution) -> Result<(), RepositoryError> {
        let governance = plan
            .governance_metadata
            .as_ref()
            .map(to_json)
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO plan_executions
                 (id, plan_id, status, account_id, execution_tag, created_at, last_updated_at,
                  start_ts, end_ts, setup_abstractions, metadata, governance_metadata, valid_until)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(plan.id.to_string())
        .bind(plan.plan_id.to_string())
        .bind(plan.status.as_str())
        .bind(plan.setup_abstractions.get(keys::ACCOUNT_ID).map(String::as_str))
        .bind(plan.metadata.execution_tag.as_deref())
        .bind(format_datetime(&plan.created_at))
        .bind(format_datetime(&plan.last_updated_at))
        .bind(format_datetime(&plan.start_ts))
        .bind(plan.end_ts.as_ref().map(format_datetime))
        .bind(to_json(&plan.setup_abstractions)?)
        .bind(to_json(&plan.metadata)?)
        .bind(governance)
        .bind(plan.valid_until.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_plan(&self, id: &Uuid) -> Result<Option<PlanExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM plan_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_plan).transpose()
    }

    async fn get_plan_projection(
        &self,
        id: &Uuid,
        fields: &[PlanExecutionField],
    ) -> Result<Option<PlanExecutionProjection>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM plan_executions WHERE id = ?",
            projection_columns(fields)
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        row.as_ref()
            .map(|r| decode_projection(r, fields))
            .transpose()
    }

    async fn update_plan_status(
        &self,
        id: &Uuid,
        transition: &Transition<PlanExecutionUpdate>,
    ) -> Result<Option<PlanExecution>, RepositoryError> {
        let guard = match transition.precondition() {
            Some(set) => format!(" AND {}", status_clause(set)),
            None => String::new(),
        };
        let sql = format!(
            r#"UPDATE plan_executions SET
                 status = ?,
                 last_updated_at = ?,
                 end_ts = COALESCE(?, end_ts),
                 valid_until = COALESCE(?, valid_until)
               WHERE id = ?{guard}
               RETURNING *"#
        );
        let update = &transition.update;
        let query = sqlx::query(&sql)
            .bind(transition.target.as_str())
            .bind(format_datetime(&Utc::now()))
            .bind(update.end_ts.as_ref().map(format_datetime))
            .bind(update.valid_until.as_ref().map(format_datetime))
            .bind(id.to_string());
        let query = match transition.precondition() {
            Some(set) => bind_statuses(query, set),
            None => query,
        };

        let row = query
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_plan).transpose()
    }

    fn find_plans_by_status<'a>(
        &'a self,
        statuses: StatusSet,
        fields: &'a [PlanExecutionField],
    ) -> RepositoryStream<'a, PlanExecutionProjection> {
        Box::pin(async_stream::try_stream! {
            let sql = format!(
                "SELECT {} FROM plan_executions WHERE {} ORDER BY created_at, id",
                projection_columns(fields),
                status_clause(statuses),
            );
            let query = bind_statuses(sqlx::query(&sql), statuses);
            let mut rows = query.fetch(&self.pool.reader);
            while let Some(row) = rows.try_next().await.map_err(map_sqlx)? {
                yield decode_projection(&row, fields)?;
            }
        })
    }

    async fn delete_plans(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM plan_executions WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn update_plan_ttl(
        &self,
        id: &Uuid,
        valid_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE plan_executions SET valid_until = ?, last_updated_at = ? WHERE id = ?",
        )
        .bind(format_datetime(&valid_until))
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_expired_plans(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id FROM plan_executions
               WHERE valid_until IS NOT NULL AND valid_until <= ?
               ORDER BY valid_until, id
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let id: String = get(row, "id")?;
                parse_uuid(&id)
            })
            .collect()
    }

    async fn count_active_plans_for_account(&self, account_id: &str) -> Result<u64, RepositoryError> {
        let active = active_statuses();
        let sql = format!(
            "SELECT COUNT(*) AS n FROM plan_executions WHERE account_id = ? AND {}",
            status_clause(active)
        );
        let query = bind_statuses(sqlx::query(&sql).bind(account_id), active);
        let row = query
            .fetch_one(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        let n: i64 = get(&row, "n")?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cairn_types::ambiance::ExecutionMetadata;
    use futures_util::StreamExt;

    use super::*;
    use crate::sqlite::pool::database_url_in;

    async fn repo() -> (tempfile::TempDir, SqlitePlanExecutionRepository) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url_in(dir.path())).await.unwrap();
        (dir, SqlitePlanExecutionRepository::new(pool))
    }

    fn plan(status: Status) -> PlanExecution {
        let now = Utc::now();
        let mut setup = BTreeMap::new();
        setup.insert(keys::ACCOUNT_ID.to_string(), "acc-1".to_string());
        PlanExecution {
            id: Uuid::now_v7(),
            plan_id: Uuid::now_v7(),
            status,
            created_at: now,
            last_updated_at: now,
            start_ts: now,
            end_ts: None,
            setup_abstractions: setup,
            metadata: ExecutionMetadata {
                execution_tag: Some("main".into()),
                ..Default::default()
            },
            governance_metadata: Some(serde_json::json!({"policy": "strict"})),
            valid_until: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let (_dir, repo) = repo().await;
        let p = plan(Status::Running);
        repo.save_plan(&p).await.unwrap();

        let loaded = repo.get_plan(&p.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, p.id);
        assert_eq!(loaded.status, Status::Running);
        assert_eq!(loaded.setup_abstractions, p.setup_abstractions);
        assert_eq!(loaded.governance_metadata, p.governance_metadata);

        let projection = repo
            .get_plan_projection(&p.id, &[PlanExecutionField::Status])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(projection.status, Some(Status::Running));
        assert!(projection.metadata.is_none());
    }

    #[tokio::test]
    async fn test_guarded_update_refuses_final_plan() {
        let (_dir, repo) = repo().await;
        let p = plan(Status::Running);
        repo.save_plan(&p).await.unwrap();

        let done = repo
            .update_plan_status(
                &p.id,
                &Transition::to(Status::Succeeded).with_update(PlanExecutionUpdate::ended(Utc::now())),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, Status::Succeeded);
        assert!(done.end_ts.is_some());

        let stale = repo
            .update_plan_status(&p.id, &Transition::to(Status::Running))
            .await
            .unwrap();
        assert!(stale.is_none());

        let forced = repo
            .update_plan_status(&p.id, &Transition::to(Status::Aborted).forced())
            .await
            .unwrap();
        assert_eq!(forced.unwrap().status, Status::Aborted);
    }

    #[tokio::test]
    async fn test_find_by_status_streams_projections() {
        let (_dir, repo) = repo().await;
        let running = plan(Status::Running);
        let done = plan(Status::Succeeded);
        repo.save_plan(&running).await.unwrap();
        repo.save_plan(&done).await.unwrap();

        let fields = [PlanExecutionField::Status];
        let found: Vec<_> = repo
            .find_plans_by_status(Status::FINAL.complement(), &fields)
            .collect()
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].as_ref().unwrap().id, running.id);
    }

    #[tokio::test]
    async fn test_expiry_and_delete() {
        let (_dir, repo) = repo().await;
        let mut old = plan(Status::Succeeded);
        old.valid_until = Some(Utc::now() - chrono::Duration::days(1));
        let fresh = plan(Status::Running);
        repo.save_plan(&old).await.unwrap();
        repo.save_plan(&fresh).await.unwrap();

        let expired = repo.find_expired_plans(Utc::now(), 10).await.unwrap();
        assert_eq!(expired, vec![old.id]);
        assert_eq!(repo.delete_plans(&expired).await.unwrap(), 1);
        assert!(repo.get_plan(&old.id).await.unwrap().is_none());
        assert!(repo.update_plan_ttl(&fresh.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_count_active_for_account() {
        let (_dir, repo) = repo().await;
        let queued = plan(Status::Queued);
        let running = plan(Status::Running);
        let done = plan(Status::Succeeded);
        repo.save_plan(&queued).await.unwrap();
        repo.save_plan(&running).await.unwrap();
        repo.save_plan(&done).await.unwrap();

        assert_eq!(repo.count_active_plans_for_account("acc-1").await.unwrap(), 2);
        assert_eq!(repo.count_active_plans_for_account("acc-2").await.unwrap(), 0);
    }
}
