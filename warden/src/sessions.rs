//! Session rows: one per supervised worker invocation, append-only history.
//!
//! The process supervisor is the only writer. Rows are inserted as
//! `running` at spawn time and updated exactly once with a terminal status;
//! they are never deleted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::events::Completion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    /// Terminated by owner shutdown rather than by the session deadline.
    Canceled,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::TimedOut => "timed_out",
            SessionStatus::Canceled => "canceled",
        };
        write!(f, "{v}")
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub tier: i64,
    pub model: String,
    pub prompt_path: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub log_path: String,
    pub parent_id: Option<i64>,
    pub response: Option<String>,
    pub cost_usd: Option<f64>,
    pub turns: Option<i64>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub tier: i64,
    pub model: String,
    pub prompt_path: String,
    pub log_path: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SessionRepo {
    pool: SqlitePool,
}

impl SessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly spawned session as `running`. Returns its id.
    pub async fn insert_running(&self, new: &NewSession) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            "INSERT INTO sessions (tier, model, prompt_path, status, started_at, log_path, parent_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.tier)
        .bind(&new.model)
        .bind(&new.prompt_path)
        .bind(SessionStatus::Running)
        .bind(Utc::now())
        .bind(&new.log_path)
        .bind(new.parent_id)
        .execute(&self.pool)
        .await?;
        Ok(row.last_insert_rowid())
    }

    /// Record a session whose worker never started (spawn failure).
    pub async fn insert_spawn_failure(&self, new: &NewSession) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO sessions (tier, model, prompt_path, status, started_at, ended_at, log_path, parent_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.tier)
        .bind(&new.model)
        .bind(&new.prompt_path)
        .bind(SessionStatus::Failed)
        .bind(now)
        .bind(now)
        .bind(&new.log_path)
        .bind(new.parent_id)
        .execute(&self.pool)
        .await?;
        Ok(row.last_insert_rowid())
    }

    /// Apply the one-and-only terminal update for a session. Result
    /// metadata is written iff a completion event was observed.
    pub async fn mark_terminal(
        &self,
        id: i64,
        status: SessionStatus,
        exit_code: Option<i64>,
        completion: Option<&Completion>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE sessions
             SET status = ?, ended_at = ?, exit_code = ?,
                 response = ?, cost_usd = ?, turns = ?, duration_ms = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(exit_code)
        .bind(completion.map(|c| c.response.clone()))
        .bind(completion.map(|c| c.cost_usd))
        .bind(completion.map(|c| c.turns))
        .bind(completion.map(|c| c.duration_ms))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM sessions ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn count_running(&self, tier: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE tier = ? AND status = ?")
                .bind(tier)
                .bind(SessionStatus::Running)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
