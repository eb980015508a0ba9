//! Lease-based mutual exclusion keyed by string.
//!
//! A provider only offers a single acquisition attempt and an owner-checked
//! release. [`acquire`] layers the bounded wait on top by polling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use cairn_types::config::LockConfig;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// A held lease. It lapses on its own at `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

pub trait LockProvider: Send + Sync {
    /// Take the lease if it is free or expired. `None` when someone else holds it.
    fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        lease: Duration,
    ) -> impl std::future::Future<Output = Result<Option<Lease>, LockError>> + Send;

    /// Release the lease if `lease.owner` still holds it. Returns whether it did.
    fn release(
        &self,
        lease: &Lease,
    ) -> impl std::future::Future<Output = Result<bool, LockError>> + Send;
}

/// Acquire `name`, polling until `config.wait()` elapses.
///
/// Returns `Ok(None)` when the wait expires without acquiring the lease.
pub async fn acquire<L: LockProvider>(
    locks: &L,
    name: &str,
    config: &LockConfig,
) -> Result<Option<Lease>, LockError> {
    let owner = Uuid::now_v7();
    let deadline = tokio::time::Instant::now() + config.wait();
    loop {
        if let Some(lease) = locks.try_acquire(name, owner, config.lease()).await? {
            tracing::trace!(lock = name, owner = %owner, "lease acquired");
            return Ok(Some(lease));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let remaining = deadline - now;
        tokio::time::sleep(config.poll_interval().min(remaining)).await;
    }
}

/// Convert a std duration to a chrono one, saturating on overflow.
pub fn lease_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
