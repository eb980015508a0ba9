//! SQLite node execution repository.
//!
//! Status and field writes share one `SET` clause. Optional fields use
//! `COALESCE(?, column)` so an absent value leaves the column untouched, and
//! a new executable response is appended with `json_insert(..., '$[#]', ...)`
//! inside the same statement. "Live" queries filter on `old_retry = 0`.

use chrono::Utc;
use futures_util::TryStreamExt;
use sqlx::Row;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use uuid::Uuid;

use cairn_core::execution::transition::Transition;
use cairn_core::repository::RepositoryStream;
use cairn_core::repository::node_execution::NodeExecutionRepository;
use cairn_types::error::RepositoryError;
use cairn_types::node::{
    NodeExecution, NodeExecutionField, NodeExecutionProjection, NodeExecutionUpdate,
};
use cairn_types::status::{Status, StatusSet};

use super::pool::DatabasePool;
use super::{
    enum_from_str, enum_to_str, format_datetime, from_json, map_sqlx, opt_from_json,
    parse_datetime, parse_opt_datetime, parse_opt_uuid, parse_uuid, placeholders, status_clause,
    to_json,
};

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>;

pub struct SqliteNodeExecutionRepository {
    pool: DatabasePool,
}

impl SqliteNodeExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const INSERT_NODE: &str = r#"INSERT INTO node_executions
    (id, plan_execution_id, ambiance, status, node_id, identifier, name, node_type,
     step_category, stage_identifier, mode, parent_id, previous_id, notify_id,
     original_node_execution_id, level_runtime_idx, executable_responses, adviser_response,
     outputs, failure_info, old_retry, retry_index, created_at, last_updated_at, start_ts,
     end_ts, valid_until)
   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#;

/// Field assignments shared by status and non-status updates.
const UPDATE_FIELDS: &str = r#"last_updated_at = ?,
    start_ts = COALESCE(?, start_ts),
    end_ts = COALESCE(?, end_ts),
    failure_info = COALESCE(?, failure_info),
    outputs = COALESCE(?, outputs),
    adviser_response = COALESCE(?, adviser_response),
    executable_responses = CASE WHEN ? IS NULL THEN executable_responses
        ELSE json_insert(executable_responses, '$[#]', json(?)) END,
    notify_id = COALESCE(?, notify_id),
    old_retry = COALESCE(?, old_retry),
    valid_until = COALESCE(?, valid_until)"#;

// ---------------------------------------------------------------------------
// Encoding / decoding
// ---------------------------------------------------------------------------

fn bind_node<'q>(query: SqliteQuery<'q>, node: &NodeExecution) -> Result<SqliteQuery<'q>, RepositoryError> {
    Ok(query
        .bind(node.id.to_string())
        .bind(node.plan_execution_id.to_string())
        .bind(to_json(&node.ambiance)?)
        .bind(node.status.as_str())
        .bind(node.node_id.clone())
        .bind(node.identifier.clone())
        .bind(node.name.clone())
        .bind(enum_to_str(&node.node_type)?)
        .bind(enum_to_str(&node.step_category)?)
        .bind(node.stage_identifier.clone())
        .bind(enum_to_str(&node.mode)?)
        .bind(node.parent_id.map(|id| id.to_string()))
        .bind(node.previous_id.map(|id| id.to_string()))
        .bind(node.notify_id.clone())
        .bind(node.original_node_execution_id.map(|id| id.to_string()))
        .bind(node.level_runtime_idx.clone())
        .bind(to_json(&node.executable_responses)?)
        .bind(node.adviser_response.as_ref().map(to_json).transpose()?)
        .bind(node.outputs.as_ref().map(to_json).transpose()?)
        .bind(node.failure_info.as_ref().map(to_json).transpose()?)
        .bind(node.old_retry)
        .bind(i64::from(node.retry_index))
        .bind(format_datetime(&node.created_at))
        .bind(format_datetime(&node.last_updated_at))
        .bind(node.start_ts.as_ref().map(format_datetime))
        .bind(node.end_ts.as_ref().map(format_datetime))
        .bind(node.valid_until.as_ref().map(format_datetime)))
}

/// Bind the parameters of [`UPDATE_FIELDS`] in order.
fn bind_update<'q>(
    query: SqliteQuery<'q>,
    update: &NodeExecutionUpdate,
) -> Result<SqliteQuery<'q>, RepositoryError> {
    let response = update
        .executable_response
        .as_ref()
        .map(to_json)
        .transpose()?;
    Ok(query
        .bind(format_datetime(&Utc::now()))
        .bind(update.start_ts.as_ref().map(format_datetime))
        .bind(update.end_ts.as_ref().map(format_datetime))
        .bind(update.failure_info.as_ref().map(to_json).transpose()?)
        .bind(update.outputs.as_ref().map(to_json).transpose()?)
        .bind(update.adviser_response.as_ref().map(to_json).transpose()?)
        .bind(response.clone())
        .bind(response)
        .bind(update.notify_id.clone())
        .bind(update.old_retry)
        .bind(update.valid_until.as_ref().map(format_datetime)))
}

fn bind_statuses(mut query: SqliteQuery<'_>, set: StatusSet) -> SqliteQuery<'_> {
    for name in set.names() {
        query = query.bind(name);
    }
    query
}

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

fn decode_node(row: &SqliteRow) -> Result<NodeExecution, RepositoryError> {
    let id: String = get(row, "id")?;
    let plan_execution_id: String = get(row, "plan_execution_id")?;
    let ambiance: String = get(row, "ambiance")?;
    let status: String = get(row, "status")?;
    let node_type: String = get(row, "node_type")?;
    let step_category: String = get(row, "step_category")?;
    let mode: String = get(row, "mode")?;
    let parent_id: Option<String> = get(row, "parent_id")?;
    let previous_id: Option<String> = get(row, "previous_id")?;
    let original: Option<String> = get(row, "original_node_execution_id")?;
    let responses: String = get(row, "executable_responses")?;
    let adviser: Option<String> = get(row, "adviser_response")?;
    let outputs: Option<String> = get(row, "outputs")?;
    let failure: Option<String> = get(row, "failure_info")?;
    let retry_index: i64 = get(row, "retry_index")?;
    let created_at: String = get(row, "created_at")?;
    let last_updated_at: String = get(row, "last_updated_at")?;
    let start_ts: Option<String> = get(row, "start_ts")?;
    let end_ts: Option<String> = get(row, "end_ts")?;
    let valid_until: Option<String> = get(row, "valid_until")?;

    Ok(NodeExecution {
        id: parse_uuid(&id)?,
        plan_execution_id: parse_uuid(&plan_execution_id)?,
        ambiance: from_json(&ambiance, "ambiance")?,
        status: decode_status(&status)?,
        node_id: get(row, "node_id")?,
        identifier: get(row, "identifier")?,
        name: get(row, "name")?,
        node_type: enum_from_str(&node_type, "node_type")?,
        step_category: enum_from_str(&step_category, "step_category")?,
        stage_identifier: get(row, "stage_identifier")?,
        mode: enum_from_str(&mode, "mode")?,
        parent_id: parse_opt_uuid(parent_id.as_deref())?,
        previous_id: parse_opt_uuid(previous_id.as_deref())?,
        notify_id: get(row, "notify_id")?,
        original_node_execution_id: parse_opt_uuid(original.as_deref())?,
        level_runtime_idx: get(row, "level_runtime_idx")?,
        executable_responses: from_json(&responses, "executable_responses")?,
        adviser_response: opt_from_json(adviser.as_deref(), "adviser_response")?,
        outputs: opt_from_json(outputs.as_deref(), "outputs")?,
        failure_info: opt_from_json(failure.as_deref(), "failure_info")?,
        old_retry: get(row, "old_retry")?,
        retry_index: u32::try_from(retry_index)
            .map_err(|_| RepositoryError::Query(format!("invalid retry_index: {retry_index}")))?,
        created_at: parse_datetime(&created_at)?,
        last_updated_at: parse_datetime(&last_updated_at)?,
        start_ts: parse_opt_datetime(start_ts.as_deref())?,
        end_ts: parse_opt_datetime(end_ts.as_deref())?,
        valid_until: parse_opt_datetime(valid_until.as_deref())?,
    })
}

fn decode_projection(
    row: &SqliteRow,
    fields: &[NodeExecutionField],
) -> Result<NodeExecutionProjection, RepositoryError> {
    let id: String = get(row, "id")?;
    let plan_execution_id: String = get(row, "plan_execution_id")?;
    let mut p = NodeExecutionProjection {
        id: parse_uuid(&id)?,
        plan_execution_id: parse_uuid(&plan_execution_id)?,
        ..Default::default()
    };
    for field in fields {
        let column = field.column();
        match field {
            NodeExecutionField::Status => {
                let v: String = get(row, column)?;
                p.status = Some(decode_status(&v)?);
            }
            NodeExecutionField::Ambiance => {
                let v: String = get(row, column)?;
                p.ambiance = Some(from_json(&v, column)?);
            }
            NodeExecutionField::NodeId => p.node_id = Some(get(row, column)?),
            NodeExecutionField::Identifier => p.identifier = Some(get(row, column)?),
            NodeExecutionField::StageIdentifier => p.stage_identifier = get(row, column)?,
            NodeExecutionField::Mode => {
                let v: String = get(row, column)?;
                p.mode = Some(enum_from_str(&v, column)?);
            }
            NodeExecutionField::ParentId => {
                let v: Option<String> = get(row, column)?;
                p.parent_id = parse_opt_uuid(v.as_deref())?;
            }
            NodeExecutionField::PreviousId => {
                let v: Option<String> = get(row, column)?;
                p.previous_id = parse_opt_uuid(v.as_deref())?;
            }
            NodeExecutionField::NotifyId => p.notify_id = get(row, column)?,
            NodeExecutionField::OriginalNodeExecutionId => {
                let v: Option<String> = get(row, column)?;
                p.original_node_execution_id = parse_opt_uuid(v.as_deref())?;
            }
            NodeExecutionField::ExecutableResponses => {
                let v: String = get(row, column)?;
                p.executable_responses = Some(from_json(&v, column)?);
            }
            NodeExecutionField::AdviserResponse => {
                let v: Option<String> = get(row, column)?;
                p.adviser_response = opt_from_json(v.as_deref(), column)?;
            }
            NodeExecutionField::Outputs => {
                let v: Option<String> = get(row, column)?;
                p.outputs = opt_from_json(v.as_deref(), column)?;
            }
            NodeExecutionField::EndTs => {
                let v: Option<String> = get(row, column)?;
                p.end_ts = parse_opt_datetime(v.as_deref())?;
            }
        }
    }
    Ok(p)
}

fn projection_columns(fields: &[NodeExecutionField]) -> String {
    ["id", "plan_execution_id"]
        .into_iter()
        .chain(fields.iter().map(|f| f.column()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// NodeExecutionRepository impl
// ---------------------------------------------------------------------------

impl NodeExecutionRepository for SqliteNodeExecutionRepository {
    async fn save_node(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        bind_node(sqlx::query(INSERT_NODE), node)?
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn save_nodes(&self, nodes: &[NodeExecution]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;
        for node in nodes {
            bind_node(sqlx::query(INSERT_NODE), node)?
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<NodeExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM node_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_node).transpose()
    }

    async fn get_node_projection(
        &self,
        id: &Uuid,
        fields: &[NodeExecutionField],
    ) -> Result<Option<NodeExecutionProjection>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM node_executions WHERE id = ?",
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

    async fn update_node_status(
        &self,
        id: &Uuid,
        transition: &Transition<NodeExecutionUpdate>,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let precondition = transition.precondition();
        let guard = precondition
            .map(|set| format!(" AND {}", status_clause(set)))
            .unwrap_or_default();
        let sql = format!(
            "UPDATE node_executions SET status = ?, {UPDATE_FIELDS} WHERE id = ?{guard} RETURNING *"
        );

        let query = sqlx::query(&sql).bind(transition.target.as_str());
        let query = bind_update(query, &transition.update)?.bind(id.to_string());
        let query = match precondition {
            Some(set) => bind_statuses(query, set),
            None => query,
        };
        let row = query
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_node).transpose()
    }

    async fn update_node(
        &self,
        id: &Uuid,
        update: &NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let sql = format!("UPDATE node_executions SET {UPDATE_FIELDS} WHERE id = ? RETURNING *");
        let row = bind_update(sqlx::query(&sql), update)?
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_node).transpose()
    }

    fn find_nodes_by_status<'a>(
        &'a self,
        statuses: StatusSet,
        fields: &'a [NodeExecutionField],
    ) -> RepositoryStream<'a, NodeExecutionProjection> {
        Box::pin(async_stream::try_stream! {
            let sql = format!(
                "SELECT {} FROM node_executions WHERE old_retry = 0 AND {} ORDER BY created_at, id",
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

    async fn fetch_children(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM node_executions
               WHERE plan_execution_id = ? AND parent_id IS ? AND old_retry = 0
               ORDER BY created_at, id"#,
        )
        .bind(plan_execution_id.to_string())
        .bind(parent_id.map(|id| id.to_string()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(decode_node).collect()
    }

    async fn fetch_nodes_by_plan(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM node_executions WHERE plan_execution_id = ? ORDER BY created_at, id",
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(decode_node).collect()
    }

    async fn fetch_nodes_with_status(
        &self,
        plan_execution_id: &Uuid,
        statuses: StatusSet,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let sql = format!(
            r#"SELECT * FROM node_executions
               WHERE plan_execution_id = ? AND old_retry = 0 AND {}
               ORDER BY created_at, id"#,
            status_clause(statuses)
        );
        let query = sqlx::query(&sql).bind(plan_execution_id.to_string());
        let rows = bind_statuses(query, statuses)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_node).collect()
    }

    async fn fetch_node_statuses(
        &self,
        plan_execution_id: &Uuid,
        within: StatusSet,
    ) -> Result<Vec<Status>, RepositoryError> {
        let sql = format!(
            "SELECT status FROM node_executions WHERE plan_execution_id = ? AND old_retry = 0 AND {}",
            status_clause(within)
        );
        let query = sqlx::query(&sql).bind(plan_execution_id.to_string());
        let rows = bind_statuses(query, within)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                let status: String = get(row, "status")?;
                decode_status(&status)
            })
            .collect()
    }

    async fn find_existing_node(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT * FROM node_executions
               WHERE plan_execution_id = ? AND parent_id IS ? AND node_id = ? AND old_retry = 0
               ORDER BY created_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(plan_execution_id.to_string())
        .bind(parent_id.map(|id| id.to_string()))
        .bind(node_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(decode_node).transpose()
    }

    async fn delete_nodes_by_plans(&self, plan_execution_ids: &[Uuid]) -> Result<u64, RepositoryError> {
        if plan_execution_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM node_executions WHERE plan_execution_id IN ({})",
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

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cairn_types::ambiance::{Ambiance, ExecutionMetadata};
    use cairn_types::graph::{ExecutionMode, StepCategory};
    use cairn_types::node::{AdviserResponse, ExecutableResponse, NodeType};
    use futures_util::StreamExt;

    use super::*;
    use crate::sqlite::pool::database_url_in;

    async fn repo() -> (tempfile::TempDir, SqliteNodeExecutionRepository) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url_in(dir.path())).await.unwrap();
        (dir, SqliteNodeExecutionRepository::new(pool))
    }

    fn node(plan: Uuid, node_id: &str, parent: Option<Uuid>, status: Status) -> NodeExecution {
        let now = Utc::now();
        NodeExecution {
            id: Uuid::now_v7(),
            plan_execution_id: plan,
            ambiance: Ambiance::new(plan, BTreeMap::new(), ExecutionMetadata::default()),
            status,
            node_id: node_id.to_string(),
            identifier: node_id.to_string(),
            name: String::new(),
            node_type: NodeType::Plan,
            step_category: StepCategory::Step,
            stage_identifier: None,
            mode: ExecutionMode::Sync,
            parent_id: parent,
            previous_id: None,
            notify_id: None,
            original_node_execution_id: None,
            level_runtime_idx: "0".into(),
            executable_responses: Vec::new(),
            adviser_response: None,
            outputs: None,
            failure_info: None,
            old_retry: false,
            retry_index: 0,
            created_at: now,
            last_updated_at: now,
            start_ts: None,
            end_ts: None,
            valid_until: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_round_trips_documents() {
        let (_dir, repo) = repo().await;
        let mut n = node(Uuid::now_v7(), "build", None, Status::Queued);
        n.executable_responses.push(ExecutableResponse::Sync);
        n.adviser_response = Some(AdviserResponse::End);
        repo.save_node(&n).await.unwrap();

        let loaded = repo.get_node(&n.id).await.unwrap().unwrap();
        assert_eq!(loaded.executable_responses, n.executable_responses);
        assert_eq!(loaded.adviser_response, Some(AdviserResponse::End));
        assert_eq!(loaded.mode, ExecutionMode::Sync);
    }

    #[tokio::test]
    async fn test_status_update_appends_response_and_guards() {
        let (_dir, repo) = repo().await;
        let n = node(Uuid::now_v7(), "deploy", None, Status::Running);
        repo.save_node(&n).await.unwrap();

        let parked = repo
            .update_node_status(
                &n.id,
                &Transition::to(Status::AsyncWaiting).with_update(NodeExecutionUpdate {
                    executable_response: Some(ExecutableResponse::Async {
                        callback_ids: vec!["cb-1".into()],
                    }),
                    ..Default::default()
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.status, Status::AsyncWaiting);
        assert_eq!(parked.executable_responses.len(), 1);

        let done = repo
            .update_node_status(&n.id, &Transition::to(Status::Succeeded))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, Status::Succeeded);
        assert_eq!(done.executable_responses.len(), 1);

        let stale = repo
            .update_node_status(&n.id, &Transition::to(Status::Running))
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_update_leaves_status_alone() {
        let (_dir, repo) = repo().await;
        let n = node(Uuid::now_v7(), "deploy", None, Status::Running);
        repo.save_node(&n).await.unwrap();

        let updated = repo
            .update_node(
                &n.id,
                &NodeExecutionUpdate {
                    notify_id: Some("n-1".into()),
                    old_retry: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, Status::Running);
        assert_eq!(updated.notify_id.as_deref(), Some("n-1"));
        assert!(updated.old_retry);
    }

    #[tokio::test]
    async fn test_live_queries_skip_old_retries() {
        let (_dir, repo) = repo().await;
        let plan = Uuid::now_v7();
        let parent = node(plan, "stage", None, Status::Running);
        let mut old = node(plan, "step", Some(parent.id), Status::Failed);
        old.old_retry = true;
        let retry = node(plan, "step", Some(parent.id), Status::Succeeded);
        repo.save_nodes(&[parent.clone(), old.clone(), retry.clone()])
            .await
            .unwrap();

        let children = repo.fetch_children(&plan, Some(&parent.id)).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, retry.id);

        let top = repo.fetch_children(&plan, None).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, parent.id);

        let existing = repo
            .find_existing_node(&plan, Some(&parent.id), "step")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(existing.id, retry.id);

        let statuses = repo.fetch_node_statuses(&plan, StatusSet::ALL).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(repo.fetch_nodes_by_plan(&plan).await.unwrap().len(), 3);

        let fields = [NodeExecutionField::Status];
        let running: Vec<_> = repo
            .find_nodes_by_status(StatusSet::of(&[Status::Running]), &fields)
            .collect()
            .await;
        assert_eq!(running.len(), 1);

        assert_eq!(repo.delete_nodes_by_plans(&[plan]).await.unwrap(), 3);
    }
}
