//! SQLite plan graph repository. Graphs are immutable JSON documents.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use cairn_core::repository::graph::PlanGraphRepository;
use cairn_types::error::RepositoryError;
use cairn_types::graph::PlanGraph;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, map_sqlx, to_json};

pub struct SqlitePlanGraphRepository {
    pool: DatabasePool,
}

impl SqlitePlanGraphRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl PlanGraphRepository for SqlitePlanGraphRepository {
    async fn save_graph(&self, graph: &PlanGraph) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO plan_graphs (plan_id, root_node_id, graph, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(plan_id) DO NOTHING"#,
        )
        .bind(graph.plan_id.to_string())
        .bind(graph.root_node_id.clone())
        .bind(to_json(graph)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_graph(&self, plan_id: &Uuid) -> Result<Option<PlanGraph>, RepositoryError> {
        let row = sqlx::query("SELECT graph FROM plan_graphs WHERE plan_id = ?")
            .bind(plan_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let graph: String = row.try_get("graph").map_err(map_sqlx)?;
                Ok(Some(from_json(&graph, "plan graph")?))
            }
            None => Ok(None),
        }
    }
}
