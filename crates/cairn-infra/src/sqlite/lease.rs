//! SQLite lease table backing the named locks.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use cairn_core::repository::lock::{Lease, LockError, LockProvider, lease_duration};

use super::format_datetime;
use super::pool::DatabasePool;

pub struct SqliteLockProvider {
    pool: DatabasePool,
}

impl SqliteLockProvider {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl LockProvider for SqliteLockProvider {
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        lease: Duration,
    ) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let expires_at = now + lease_duration(lease);
        let result = sqlx::query(
            r#"INSERT INTO leases (name, owner, expires_at) VALUES (?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 owner = excluded.owner,
                 expires_at = excluded.expires_at
               WHERE leases.expires_at <= ?"#,
        )
        .bind(name)
        .bind(owner.to_string())
        .bind(format_datetime(&expires_at))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(Lease {
            name: name.to_string(),
            owner,
            expires_at,
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM leases WHERE name = ? AND owner = ?")
            .bind(&lease.name)
            .bind(lease.owner.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}
