//! Health observations recorded during session execution.
//!
//! Each row ties one observation of a named service to the session that
//! made it. Rows are immutable once written; streak bookkeeping lives in
//! the safety gate, which consumes the healthy/unhealthy signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HealthRecord {
    pub id: i64,
    pub session_id: i64,
    pub service: String,
    pub status: HealthStatus,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthRepo {
    pool: SqlitePool,
}

impl HealthRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        session_id: i64,
        service: &str,
        status: HealthStatus,
        latency_ms: Option<i64>,
        error: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            "INSERT INTO health_records (session_id, service, status, latency_ms, error, observed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(service)
        .bind(status)
        .bind(latency_ms)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn list_for_session(&self, session_id: i64) -> Result<Vec<HealthRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM health_records WHERE session_id = ? ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
    }
}
