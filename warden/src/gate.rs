//! Sliding-window safety gate over remedial actions.
//!
//! Before a mutating action (service restart, redeploy) the caller checks
//! the window; after performing it, the caller records it. The check and
//! the record are not one atomic step — a single supervising process is
//! the documented operating assumption, not an enforced invariant.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

pub const RESTART_KIND: &str = "restart";
pub const RESTART_LIMIT: i64 = 2;
pub const RESTART_WINDOW: Duration = Duration::from_secs(4 * 3600);

pub const REDEPLOY_KIND: &str = "redeploy";
pub const REDEPLOY_LIMIT: i64 = 1;
pub const REDEPLOY_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Consecutive healthy observations required before a resource's action
/// history is forgiven.
const RECOVERY_STREAK: i64 = 2;

/// Window and limit for a known action kind. `None` means the kind is not
/// gated; callers must reject it rather than treat it as unlimited.
pub fn policy_for(kind: &str) -> Option<(Duration, i64)> {
    match kind {
        RESTART_KIND => Some((RESTART_WINDOW, RESTART_LIMIT)),
        REDEPLOY_KIND => Some((REDEPLOY_WINDOW, REDEPLOY_LIMIT)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SafetyAction {
    pub id: i64,
    pub resource: String,
    pub kind: String,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub session_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SafetyGate {
    pool: SqlitePool,
}

impl SafetyGate {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Count actions of `kind` against `resource` inside the trailing
    /// window. Allowed iff the count is below `limit`.
    ///
    /// This is a true sliding window: two restarts three hours apart still
    /// block a third attempted one hour after the second.
    pub async fn check_and_count(
        &self,
        resource: &str,
        kind: &str,
        window: Duration,
        limit: i64,
    ) -> Result<GateDecision, sqlx::Error> {
        // Windows beyond chrono's range clamp to a century, effectively unbounded.
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM safety_actions
             WHERE resource = ? AND kind = ? AND executed_at >= ?",
        )
        .bind(resource)
        .bind(kind)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        let decision = GateDecision {
            allowed: count < limit,
            count,
        };
        if !decision.allowed {
            warn!(resource, kind, count, limit, "safety gate exceeded — action requires attention");
        }
        Ok(decision)
    }

    /// Append one attempted action. Timestamps are caller-supplied so the
    /// record reflects when the action ran, not when it was persisted.
    pub async fn record(
        &self,
        resource: &str,
        kind: &str,
        executed_at: DateTime<Utc>,
        success: bool,
        error: Option<&str>,
        session_id: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO safety_actions (resource, kind, executed_at, success, error, session_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(resource)
        .bind(kind)
        .bind(executed_at)
        .bind(success)
        .bind(error)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update a resource's consecutive-healthy streak. On reaching
    /// `RECOVERY_STREAK` the resource's entire action history (all kinds)
    /// is cleared; a single healthy observation changes nothing.
    pub async fn record_observation(
        &self,
        resource: &str,
        healthy: bool,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(i64,)> =
            sqlx::query_as("SELECT healthy_count FROM resource_streaks WHERE resource = ?")
                .bind(resource)
                .fetch_optional(&mut *tx)
                .await?;
        let streak = if healthy {
            current.map_or(0, |(n,)| n) + 1
        } else {
            0
        };

        sqlx::query(
            "INSERT INTO resource_streaks (resource, healthy_count, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(resource) DO UPDATE SET
                 healthy_count = excluded.healthy_count,
                 updated_at = excluded.updated_at",
        )
        .bind(resource)
        .bind(streak)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if healthy && streak >= RECOVERY_STREAK {
            let cleared = sqlx::query("DELETE FROM safety_actions WHERE resource = ?")
                .bind(resource)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if cleared > 0 {
                info!(resource, streak, cleared, "recovery reset — action history cleared");
            }
        }

        tx.commit().await
    }

    pub async fn actions(&self, resource: &str) -> Result<Vec<SafetyAction>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM safety_actions WHERE resource = ? ORDER BY executed_at")
            .bind(resource)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn streak(&self, resource: &str) -> Result<i64, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT healthy_count FROM resource_streaks WHERE resource = ?")
                .bind(resource)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map_or(0, |(n,)| n))
    }
}
